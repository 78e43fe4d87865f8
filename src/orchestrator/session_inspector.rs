//! Session inspector — lists the agent windows open in tmux.
//!
//! The inspector never fails: a query error yields an empty, `degraded`
//! snapshot. Callers must not read an empty degraded snapshot as
//! "nothing is running".

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::warn;

use crate::config::TmuxConfig;
use crate::process::run_capture;
use crate::AppError;

/// One window reported by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Window name.
    pub name: String,
    /// Whether the window's process is still alive.
    pub active: bool,
}

impl SessionInfo {
    /// Live session with the given name.
    #[must_use]
    pub fn active(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
        }
    }
}

/// Result of one session listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Sessions reported by the manager.
    pub sessions: Vec<SessionInfo>,
    /// Set when the listing failed; `sessions` is then empty and says
    /// nothing about what is running.
    pub degraded: bool,
}

impl SessionSnapshot {
    /// Successful listing.
    #[must_use]
    pub fn observed(sessions: Vec<SessionInfo>) -> Self {
        Self {
            sessions,
            degraded: false,
        }
    }

    /// Failed listing.
    #[must_use]
    pub fn degraded() -> Self {
        Self {
            sessions: Vec::new(),
            degraded: true,
        }
    }
}

/// Query interface onto the terminal-session manager.
pub trait SessionInspector: Send + Sync {
    /// List open sessions, optionally restricted to names starting with
    /// `prefix`.
    fn list_sessions<'a>(
        &'a self,
        prefix: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = SessionSnapshot> + Send + 'a>>;
}

/// Inspector backed by `tmux list-windows`.
pub struct TmuxInspector {
    session: String,
    timeout: Duration,
}

impl TmuxInspector {
    /// Inspect windows of the tmux session named in `config`.
    #[must_use]
    pub fn new(config: &TmuxConfig, timeout: Duration) -> Self {
        Self {
            session: config.session.clone(),
            timeout,
        }
    }
}

impl SessionInspector for TmuxInspector {
    fn list_sessions<'a>(
        &'a self,
        prefix: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = SessionSnapshot> + Send + 'a>> {
        Box::pin(async move {
            let args = [
                "list-windows",
                "-t",
                self.session.as_str(),
                "-F",
                "#{window_name}\t#{pane_dead}",
            ];
            match run_capture("tmux", &args, None, self.timeout, AppError::Session).await {
                Ok(stdout) => SessionSnapshot::observed(parse_window_list(&stdout, prefix)),
                Err(err) => {
                    warn!(%err, session = self.session, "tmux session listing failed");
                    SessionSnapshot::degraded()
                }
            }
        })
    }
}

/// Parse `tmux list-windows -F "#{window_name}\t#{pane_dead}"` output.
///
/// Lines without a tab are treated as live windows. Blank lines and names
/// not matching `prefix` are skipped.
#[must_use]
pub fn parse_window_list(output: &str, prefix: Option<&str>) -> Vec<SessionInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let (name, dead) = line.split_once('\t').unwrap_or((line, "0"));
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            if let Some(p) = prefix {
                if !name.starts_with(p) {
                    return None;
                }
            }
            Some(SessionInfo {
                name: name.to_owned(),
                active: dead.trim() != "1",
            })
        })
        .collect()
}
