#![forbid(unsafe_code)]

//! Orchestration loop for coding agents running in tmux windows.

pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod process;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
