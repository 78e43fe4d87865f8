//! State reconciler — merges a session snapshot into the agent table.
//!
//! An agent that is missing from a snapshot is only evicted once its
//! spawn grace period has run out. Right after dispatch tmux may not
//! have registered the new window yet, and treating that absence as a
//! departure would requeue work that is in fact starting up.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::models::agent::{AgentTable, SessionName, TrackedAgent};

use super::session_inspector::SessionSnapshot;

/// Output of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Corrected agent table.
    pub table: AgentTable,
    /// Agents removed this pass.
    pub departed: Vec<TrackedAgent>,
    /// Agents observed for the first time this pass: brand-new sessions
    /// and dispatched agents confirmed by the session manager.
    pub newly_observed: Vec<TrackedAgent>,
}

impl Reconciliation {
    /// Whether the table differs from the one passed in.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.departed.is_empty() || !self.newly_observed.is_empty()
    }
}

/// Produce the next agent table from `previous` and a fresh `snapshot`.
///
/// * Active sessions already tracked get `last_observed_at = now`.
/// * Active sessions not tracked are adopted, with kind and work unit
///   inferred from the window name (after stripping `prefix`).
/// * Tracked agents absent from the snapshot are kept while
///   `now - spawned_at < grace`; after that they are removed and reported
///   as departed. Flagged agents skip the grace period.
/// * A degraded snapshot refreshes and adopts nothing and evicts nothing.
#[must_use]
pub fn reconcile(
    previous: AgentTable,
    snapshot: &SessionSnapshot,
    now: Instant,
    grace: Duration,
    prefix: &str,
) -> Reconciliation {
    let mut table = previous;

    if snapshot.degraded {
        debug!(tracked = table.len(), "session snapshot degraded; keeping table as-is");
        return Reconciliation {
            table,
            ..Reconciliation::default()
        };
    }

    let mut newly_observed = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for session in snapshot.sessions.iter().filter(|s| s.active) {
        if !seen.insert(session.name.as_str()) {
            continue;
        }
        if let Some(agent) = table.get_mut(&session.name) {
            let first = agent.last_observed_at.is_none();
            agent.last_observed_at = Some(now);
            if first {
                debug!(name = agent.name, "dispatched agent confirmed");
                newly_observed.push(agent.clone());
            }
        } else {
            let parsed = SessionName::parse(&session.name, prefix);
            let agent = TrackedAgent::observed(session.name.clone(), parsed, now);
            info!(name = agent.name, kind = %agent.kind, unit = ?agent.work_unit_ref, "new agent session observed");
            newly_observed.push(agent.clone());
            table.insert(agent);
        }
    }

    let absent: Vec<String> = table
        .iter()
        .filter(|agent| !seen.contains(agent.name.as_str()))
        .filter(|agent| agent.flagged || now.saturating_duration_since(agent.spawned_at) >= grace)
        .map(|agent| agent.name.clone())
        .collect();

    let mut departed = Vec::with_capacity(absent.len());
    for name in absent {
        if let Some(agent) = table.remove(&name) {
            info!(
                name = agent.name,
                unit = ?agent.work_unit_ref,
                confirmed = agent.is_confirmed(),
                flagged = agent.flagged,
                "agent departed"
            );
            departed.push(agent);
        }
    }

    Reconciliation {
        table,
        departed,
        newly_observed,
    }
}
