//! Dispatcher — decides once per tick whether to start one work unit.
//!
//! The dispatcher is pure bookkeeping: it returns [`DispatchRequest`]s and
//! [`UnitTransition`]s, and the loop applies them to the spawner and the
//! queue store. It never waits on a spawn; confirmation arrives through
//! the next reconciliation's `newly_observed` list.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LoopConfig;
use crate::models::agent::{AgentKind, AgentTable, SessionName, TrackedAgent};
use crate::models::work_unit::{WorkStatus, WorkUnit};

/// Request handed to the session spawner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Unit being started, already marked `dispatched`.
    pub work_unit: WorkUnit,
    /// Role of the agent to start.
    pub kind: AgentKind,
    /// Window name the spawner must use; the reconciler matches on it.
    pub session_name: String,
}

impl DispatchRequest {
    /// Table entry tracking the agent this request starts.
    #[must_use]
    pub fn tracked_agent(&self, now: Instant) -> TrackedAgent {
        TrackedAgent::dispatched(
            self.session_name.clone(),
            self.kind.clone(),
            self.work_unit.id,
            now,
        )
    }
}

/// Why a unit changed status outside of dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// Agent confirmed by the session manager.
    Confirmed,
    /// Agent departed before finishing; unit goes back to the queue.
    Requeued,
    /// Agent departed and retries are exhausted.
    RetriesExhausted,
}

/// Status change the loop must persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitTransition {
    /// Unit after the change.
    pub unit: WorkUnit,
    /// Why it changed.
    pub reason: TransitionReason,
}

/// Cooldown- and concurrency-gated dispatcher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    cooldown: Duration,
    max_concurrent_agents: usize,
    max_retries: u32,
    window_prefix: String,
    last_dispatch_at: Option<Instant>,
}

impl Dispatcher {
    /// Build a dispatcher from loop limits.
    #[must_use]
    pub fn new(config: &LoopConfig, window_prefix: impl Into<String>) -> Self {
        Self {
            cooldown: config.cooldown(),
            max_concurrent_agents: usize::try_from(config.max_concurrent_agents)
                .unwrap_or(usize::MAX),
            max_retries: config.max_retries,
            window_prefix: window_prefix.into(),
            last_dispatch_at: None,
        }
    }

    /// Time of the most recent dispatch.
    #[must_use]
    pub fn last_dispatch_at(&self) -> Option<Instant> {
        self.last_dispatch_at
    }

    /// Move units whose agents were just confirmed from `dispatched` to
    /// `running`.
    pub fn confirm(
        &self,
        newly_observed: &[TrackedAgent],
        units: &mut [WorkUnit],
    ) -> Vec<UnitTransition> {
        let mut transitions = Vec::new();
        for agent in newly_observed {
            let Some(unit_id) = agent.work_unit_ref else {
                continue;
            };
            if let Some(unit) = units.iter_mut().find(|u| u.id == unit_id) {
                if unit.status == WorkStatus::Dispatched {
                    unit.status = WorkStatus::Running;
                    debug!(unit = unit.id, agent = agent.name, "work unit running");
                    transitions.push(UnitTransition {
                        unit: unit.clone(),
                        reason: TransitionReason::Confirmed,
                    });
                }
            }
        }
        transitions
    }

    /// Requeue or block units whose agents departed without finishing.
    ///
    /// Each departed agent yields at most one transition, and only when its
    /// unit is still `dispatched` or `running`. A unit whose `retry_count`
    /// has reached `max_retries` is marked `blocked` instead.
    pub fn resolve_departures(
        &self,
        departed: &[TrackedAgent],
        units: &mut [WorkUnit],
    ) -> Vec<UnitTransition> {
        let mut transitions = Vec::new();
        for agent in departed {
            let Some(unit_id) = agent.work_unit_ref else {
                continue;
            };
            let Some(unit) = units.iter_mut().find(|u| u.id == unit_id) else {
                debug!(unit = unit_id, agent = agent.name, "departed agent's unit not in queue");
                continue;
            };
            if !unit.status.is_in_flight() {
                continue;
            }

            debug!(
                unit = unit.id,
                agent = agent.name,
                confirmed = agent.is_confirmed(),
                "agent departed"
            );
            transitions.push(self.retry_or_block(unit, "agent departed"));
        }
        transitions
    }

    /// Requeue or block in-flight units that no tracked agent services.
    ///
    /// Such units are left behind when a departure could not be persisted
    /// or when the loop restarts with the queue still showing `dispatched`
    /// or `running`. Only call this with a table built from a trusted
    /// (non-degraded) listing.
    pub fn resolve_orphans(
        &self,
        table: &AgentTable,
        units: &mut [WorkUnit],
    ) -> Vec<UnitTransition> {
        units
            .iter_mut()
            .filter(|unit| unit.status.is_in_flight() && !table.services(unit.id))
            .map(|unit| self.retry_or_block(unit, "no agent services unit"))
            .collect()
    }

    fn retry_or_block(&self, unit: &mut WorkUnit, cause: &'static str) -> UnitTransition {
        if unit.retry_count >= self.max_retries {
            unit.status = WorkStatus::Blocked;
            warn!(
                unit = unit.id,
                retries = unit.retry_count,
                cause,
                "work unit blocked after exhausting retries"
            );
            UnitTransition {
                unit: unit.clone(),
                reason: TransitionReason::RetriesExhausted,
            }
        } else {
            unit.status = WorkStatus::Queued;
            unit.retry_count += 1;
            info!(unit = unit.id, retry = unit.retry_count, cause, "work unit requeued");
            UnitTransition {
                unit: unit.clone(),
                reason: TransitionReason::Requeued,
            }
        }
    }

    /// Decide whether to dispatch the next queued unit.
    ///
    /// Gates, in order: cooldown since the last dispatch, executor count
    /// against the concurrency cap, then the first `queued` unit by id
    /// (stable, so equal ids keep queue order) that no tracked agent
    /// already services. The chosen unit is marked `dispatched` in
    /// `units` and the cooldown restarts at `now`.
    pub fn decide(
        &mut self,
        table: &AgentTable,
        units: &mut [WorkUnit],
        now: Instant,
    ) -> Option<DispatchRequest> {
        if let Some(last) = self.last_dispatch_at {
            if now.saturating_duration_since(last) < self.cooldown {
                return None;
            }
        }

        let executors = table.executor_count();
        if executors >= self.max_concurrent_agents {
            debug!(executors, cap = self.max_concurrent_agents, "concurrency cap reached");
            return None;
        }

        let mut order: Vec<usize> = (0..units.len()).collect();
        order.sort_by_key(|&i| units[i].id);

        let index = order.into_iter().find(|&i| {
            units[i].status == WorkStatus::Queued && !table.services(units[i].id)
        })?;

        let unit = &mut units[index];
        unit.status = WorkStatus::Dispatched;
        self.last_dispatch_at = Some(now);

        let kind = AgentKind::Executor;
        let suffix = Uuid::new_v4().simple().to_string();
        let session_name = SessionName::compose(&self.window_prefix, &kind, unit.id, &suffix[..6]);

        info!(unit = unit.id, session = session_name, retry = unit.retry_count, "dispatching work unit");

        Some(DispatchRequest {
            work_unit: unit.clone(),
            kind,
            session_name,
        })
    }
}
