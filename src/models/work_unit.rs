//! Work unit (prompt) model.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Scheduling status of a work unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting for dispatch.
    Queued,
    /// Dispatch requested; agent not yet confirmed by the session manager.
    Dispatched,
    /// Agent confirmed running.
    Running,
    /// Retries exhausted; needs operator attention.
    Blocked,
    /// Completed by the agent.
    Done,
}

impl WorkStatus {
    /// Whether an agent is (or should be) working this unit.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    /// Lowercase name as persisted in front matter.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }
}

impl Display for WorkStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One schedulable item of agent work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkUnit {
    /// Stable ordinal; dispatch order is ascending by id.
    pub id: u32,
    /// Current scheduling status.
    pub status: WorkStatus,
    /// Requeues so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Human-readable title.
    #[serde(default)]
    pub title: Option<String>,
    /// Prompt file backing this unit, when persisted on disk.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl WorkUnit {
    /// A freshly queued unit with no retries.
    #[must_use]
    pub fn queued(id: u32) -> Self {
        Self {
            id,
            status: WorkStatus::Queued,
            retry_count: 0,
            title: None,
            path: None,
        }
    }
}
