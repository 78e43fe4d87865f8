//! Read-only views of loop state handed to front-ends.

use tokio::time::Instant;

use super::agent::TrackedAgent;

/// Review polling state as seen from outside the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewState {
    /// Pull-request URL being watched, if any.
    pub tracked_url: Option<String>,
    /// Whether feedback has already been reported for `tracked_url`.
    pub feedback_seen: bool,
}

/// Point-in-time copy of everything the loop owns.
#[derive(Debug, Clone, Default)]
pub struct LoopSnapshot {
    /// Tracked agents in name order.
    pub agents: Vec<TrackedAgent>,
    /// Last known branch.
    pub branch: Option<String>,
    /// Review polling state.
    pub review: ReviewState,
    /// Time of the most recent dispatch.
    pub last_dispatch_at: Option<Instant>,
    /// Completed ticks since start.
    pub ticks: u64,
    /// Whether the latest session listing failed.
    pub sessions_degraded: bool,
}
