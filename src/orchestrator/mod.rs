//! Orchestration loop modules.
//!
//! Covers session inspection, agent-table reconciliation, dispatch,
//! branch and review polling, agent spawning, and the tick driver that
//! ties them together.

pub mod branch_monitor;
pub mod dispatcher;
pub mod loop_driver;
pub mod reconciler;
pub mod review_poller;
pub mod session_inspector;
pub mod spawner;
