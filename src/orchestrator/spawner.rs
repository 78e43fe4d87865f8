//! Agent session spawner.
//!
//! Opens one tmux window per dispatched work unit running the host CLI
//! with the unit's prompt file. Spawning is fire-and-forget: the request
//! is handed to a background task and the loop moves on. Whether the
//! window actually appeared is learned from the next session listing.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, info_span, Instrument};

use crate::config::GlobalConfig;
use crate::process::run_capture;
use crate::AppError;

use super::dispatcher::DispatchRequest;

/// Starts agent sessions for dispatch requests.
pub trait SessionSpawner: Send + Sync {
    /// Begin starting a session for `request`. Must not block.
    fn spawn(&self, request: DispatchRequest);
}

/// Spawner that opens windows in an existing tmux session.
#[derive(Debug, Clone)]
pub struct TmuxSpawner {
    session: String,
    host_cli: String,
    host_cli_args: Vec<String>,
    workspace_root: PathBuf,
    timeout: Duration,
}

impl TmuxSpawner {
    /// Build a spawner from global configuration.
    #[must_use]
    pub fn new(config: &GlobalConfig) -> Self {
        Self {
            session: config.tmux.session.clone(),
            host_cli: config.tmux.host_cli.clone(),
            host_cli_args: config.tmux.host_cli_args.clone(),
            workspace_root: config.workspace_root.clone(),
            timeout: config.timing.query_timeout(),
        }
    }

    /// `tmux new-window` arguments for a request.
    ///
    /// `CONDUCTOR_WORK_UNIT` and `CONDUCTOR_WORKSPACE_ROOT` are exported
    /// into the window so the agent knows what it is working on.
    #[must_use]
    pub fn command_args(&self, request: &DispatchRequest) -> Vec<String> {
        let mut args = vec![
            "new-window".to_owned(),
            "-d".to_owned(),
            "-t".to_owned(),
            format!("{}:", self.session),
            "-n".to_owned(),
            request.session_name.clone(),
            "-c".to_owned(),
            self.workspace_root.display().to_string(),
            "-e".to_owned(),
            format!("CONDUCTOR_WORK_UNIT={}", request.work_unit.id),
            "-e".to_owned(),
            format!("CONDUCTOR_WORKSPACE_ROOT={}", self.workspace_root.display()),
            "--".to_owned(),
            self.host_cli.clone(),
        ];
        args.extend(self.host_cli_args.iter().cloned());
        if let Some(ref path) = request.work_unit.path {
            args.push(path.display().to_string());
        }
        args
    }
}

impl SessionSpawner for TmuxSpawner {
    fn spawn(&self, request: DispatchRequest) {
        let args = self.command_args(&request);
        let timeout = self.timeout;
        let host_cli = self.host_cli.clone();
        let span = info_span!(
            "spawn_session",
            unit = request.work_unit.id,
            session = request.session_name
        );

        tokio::spawn(
            async move {
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                match run_capture("tmux", &arg_refs, None, timeout, AppError::Spawn).await {
                    Ok(_) => info!(host_cli, "agent window opened"),
                    Err(err) => error!(%err, "failed to open agent window"),
                }
            }
            .instrument(span),
        );
    }
}
