//! Branch monitor — detects git branch switches between ticks.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info};

use crate::process::run_capture;
use crate::AppError;

/// Query interface for the active branch.
pub trait BranchSource: Send + Sync {
    /// Current branch name, or `None` when it cannot be determined.
    fn current_branch(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>>;
}

/// Branch source backed by `git rev-parse --abbrev-ref HEAD`.
pub struct GitBranchSource {
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitBranchSource {
    /// Query the repository at `repo_root`.
    #[must_use]
    pub fn new(repo_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo_root: repo_root.into(),
            timeout,
        }
    }
}

impl BranchSource for GitBranchSource {
    fn current_branch(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
        Box::pin(async move {
            match run_capture(
                "git",
                &["rev-parse", "--abbrev-ref", "HEAD"],
                Some(&self.repo_root),
                self.timeout,
                AppError::Git,
            )
            .await
            {
                Ok(branch) => parse_branch(&branch),
                Err(err) => {
                    debug!(%err, "branch lookup failed");
                    None
                }
            }
        })
    }
}

/// Normalize `rev-parse --abbrev-ref` output; detached `HEAD` and empty
/// output read as unknown.
#[must_use]
pub fn parse_branch(output: &str) -> Option<String> {
    let branch = output.trim();
    if branch.is_empty() || branch == "HEAD" {
        None
    } else {
        Some(branch.to_owned())
    }
}

/// Holds the last known branch and reports changes.
#[derive(Debug, Clone, Default)]
pub struct BranchMonitor {
    current: Option<String>,
}

impl BranchMonitor {
    /// Monitor with no branch recorded yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known branch.
    #[must_use]
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Record a reading and return the new branch if it changed.
    ///
    /// `None` readings never change state. The first known branch is
    /// recorded without reporting a change.
    pub fn observe(&mut self, reading: Option<String>) -> Option<String> {
        let branch = reading?;
        match self.current.as_deref() {
            Some(previous) if previous == branch => None,
            Some(previous) => {
                info!(from = previous, to = branch, "branch changed");
                self.current = Some(branch.clone());
                Some(branch)
            }
            None => {
                debug!(branch, "initial branch recorded");
                self.current = Some(branch);
                None
            }
        }
    }
}
