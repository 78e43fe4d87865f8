//! Persistence layer modules.

pub mod queue_store;
