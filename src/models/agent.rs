//! Tracked agent model and the loop's agent table.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use regex::Regex;
use tokio::time::Instant;

/// Role tag carried by an agent session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// Works a single queued prompt to completion.
    Executor,
    /// Long-lived planning/coordination agent.
    Coordinator,
    /// Any other role found in a window name.
    Other(String),
}

impl AgentKind {
    /// Parse a role tag as it appears in a window name.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "executor" => Self::Executor,
            "coordinator" => Self::Coordinator,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Tag written into window names for this kind.
    #[must_use]
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Executor => "executor",
            Self::Coordinator => "coordinator",
            Self::Other(tag) => tag,
        }
    }
}

impl Display for AgentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Kind and work-unit reference recovered from a session name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionName {
    /// Inferred role.
    pub kind: AgentKind,
    /// Work unit the session services, when the name carries one.
    pub work_unit_ref: Option<u32>,
}

#[allow(clippy::expect_used)] // Literal pattern; exercised by the session name tests.
fn session_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // <kind>[-<unit>][-<suffix>]
        Regex::new(r"^(?P<kind>[a-z][a-z_]*)(?:-(?P<unit>\d+))?(?:-[0-9A-Za-z]+)*$")
            .expect("session name pattern compiles")
    })
}

impl SessionName {
    /// Infer kind and work-unit reference from a window name.
    ///
    /// `prefix` is stripped first when present. Names that do not follow
    /// the `<kind>-<unit>-<suffix>` convention map to `Other(name)` with
    /// no unit reference.
    #[must_use]
    pub fn parse(name: &str, prefix: &str) -> Self {
        let bare = name.strip_prefix(prefix).unwrap_or(name);
        match session_name_pattern().captures(bare) {
            Some(caps) => Self {
                kind: AgentKind::from_tag(&caps["kind"]),
                work_unit_ref: caps.name("unit").and_then(|m| m.as_str().parse().ok()),
            },
            None => Self {
                kind: AgentKind::Other(bare.to_owned()),
                work_unit_ref: None,
            },
        }
    }

    /// Compose a window name for a dispatched agent.
    #[must_use]
    pub fn compose(prefix: &str, kind: &AgentKind, work_unit_ref: u32, suffix: &str) -> String {
        format!("{prefix}{kind}-{work_unit_ref}-{suffix}")
    }
}

/// One agent process the loop believes is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedAgent {
    /// Session (tmux window) name; unique key in the table.
    pub name: String,
    /// Role tag.
    pub kind: AgentKind,
    /// Work unit this agent is servicing.
    pub work_unit_ref: Option<u32>,
    /// When the agent was dispatched or first seen.
    pub spawned_at: Instant,
    /// Most recent confirmation from the session manager; `None` until
    /// the first observation after dispatch.
    pub last_observed_at: Option<Instant>,
    /// Set when the entry took part in a duplicate work-unit mapping.
    /// Flagged entries are evicted on their first absence.
    pub flagged: bool,
}

impl TrackedAgent {
    /// Entry for an agent the loop has just dispatched.
    #[must_use]
    pub fn dispatched(name: String, kind: AgentKind, work_unit_ref: u32, now: Instant) -> Self {
        Self {
            name,
            kind,
            work_unit_ref: Some(work_unit_ref),
            spawned_at: now,
            last_observed_at: None,
            flagged: false,
        }
    }

    /// Entry for a session seen in a snapshot without a prior dispatch.
    #[must_use]
    pub fn observed(name: String, parsed: SessionName, now: Instant) -> Self {
        Self {
            name,
            kind: parsed.kind,
            work_unit_ref: parsed.work_unit_ref,
            spawned_at: now,
            last_observed_at: Some(now),
            flagged: false,
        }
    }

    /// Whether the session manager has reported this agent at least once.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.last_observed_at.is_some()
    }

    /// Whether this agent counts against the executor concurrency cap.
    #[must_use]
    pub fn is_executor(&self) -> bool {
        self.kind == AgentKind::Executor
    }
}

/// The loop's tracked-agent table, keyed by session name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentTable {
    agents: BTreeMap<String, TrackedAgent>,
}

impl AgentTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, agent: TrackedAgent) {
        self.agents.insert(agent.name.clone(), agent);
    }

    /// Remove an entry by name.
    pub fn remove(&mut self, name: &str) -> Option<TrackedAgent> {
        self.agents.remove(name)
    }

    /// Look up an entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TrackedAgent> {
        self.agents.get(name)
    }

    /// Mutable lookup by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut TrackedAgent> {
        self.agents.get_mut(name)
    }

    /// Whether a session name is tracked.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Number of tracked agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Iterate entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedAgent> {
        self.agents.values()
    }

    /// Number of executor agents, the quantity capped by
    /// `max_concurrent_agents`.
    #[must_use]
    pub fn executor_count(&self) -> usize {
        self.agents.values().filter(|a| a.is_executor()).count()
    }

    /// Whether any tracked agent services the given work unit.
    #[must_use]
    pub fn services(&self, work_unit_ref: u32) -> bool {
        self.agents
            .values()
            .any(|a| a.work_unit_ref == Some(work_unit_ref))
    }

    /// Work units mapped to more than one agent, with the offending names.
    #[must_use]
    pub fn duplicate_work_units(&self) -> Vec<(u32, Vec<String>)> {
        let mut by_unit: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for agent in self.agents.values() {
            if let Some(unit) = agent.work_unit_ref {
                by_unit.entry(unit).or_default().push(agent.name.clone());
            }
        }
        by_unit.into_iter().filter(|(_, names)| names.len() > 1).collect()
    }

    /// Snapshot of all entries in name order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<TrackedAgent> {
        self.agents.values().cloned().collect()
    }
}

impl FromIterator<TrackedAgent> for AgentTable {
    fn from_iter<I: IntoIterator<Item = TrackedAgent>>(iter: I) -> Self {
        let mut table = Self::new();
        for agent in iter {
            table.insert(agent);
        }
        table
    }
}
