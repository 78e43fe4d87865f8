//! Domain model module declarations.

pub mod agent;
pub mod snapshot;
pub mod work_unit;
