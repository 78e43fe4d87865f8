//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Timing and capacity limits for the orchestration loop.
///
/// Immutable for the lifetime of a run. All durations are stored in
/// milliseconds as written in `config.toml`; use the accessor methods
/// for [`Duration`] values.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LoopConfig {
    /// Interval between scheduler ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Minimum spacing between two dispatches.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Maximum number of executor agents alive at once.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: u32,
    /// Window after dispatch during which an unobserved agent is retained.
    #[serde(default = "default_spawn_grace_period_ms")]
    pub spawn_grace_period_ms: u64,
    /// Requeues allowed per work unit before it is marked blocked.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on any single external query (tmux, git, review API).
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl LoopConfig {
    /// Tick interval as a [`Duration`].
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Dispatch cooldown as a [`Duration`].
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Spawn grace period as a [`Duration`].
    #[must_use]
    pub fn spawn_grace_period(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_period_ms)
    }

    /// External query timeout as a [`Duration`].
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(AppError::Config(
                "loop.tick_interval_ms must be greater than zero".into(),
            ));
        }
        if self.max_concurrent_agents == 0 {
            return Err(AppError::Config(
                "loop.max_concurrent_agents must be greater than zero".into(),
            ));
        }
        if self.spawn_grace_period_ms == 0 {
            return Err(AppError::Config(
                "loop.spawn_grace_period_ms must be greater than zero".into(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(AppError::Config(
                "loop.query_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.spawn_grace_period_ms < self.tick_interval_ms {
            warn!(
                grace_ms = self.spawn_grace_period_ms,
                tick_ms = self.tick_interval_ms,
                "spawn grace period is shorter than one tick; unconfirmed agents \
                 will be evicted on the first reconciliation after dispatch"
            );
        }
        Ok(())
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            cooldown_ms: default_cooldown_ms(),
            max_concurrent_agents: default_max_concurrent_agents(),
            spawn_grace_period_ms: default_spawn_grace_period_ms(),
            max_retries: default_max_retries(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_cooldown_ms() -> u64 {
    5000
}

fn default_max_concurrent_agents() -> u32 {
    1
}

fn default_spawn_grace_period_ms() -> u64 {
    15_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_query_timeout_ms() -> u64 {
    5000
}

/// Terminal-session manager settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TmuxConfig {
    /// tmux session that hosts one window per agent.
    #[serde(default = "default_tmux_session")]
    pub session: String,
    /// Prefix prepended to every agent window name.
    #[serde(default)]
    pub window_prefix: String,
    /// Agent CLI binary launched inside each window (e.g., `claude`).
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Arguments passed to the agent CLI before the prompt path.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            session: default_tmux_session(),
            window_prefix: String::new(),
            host_cli: default_host_cli(),
            host_cli_args: Vec::new(),
        }
    }
}

fn default_tmux_session() -> String {
    "conductor".into()
}

fn default_host_cli() -> String {
    "claude".into()
}

/// Review feedback polling settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReviewConfig {
    /// Whether review feedback polling is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of the GitHub REST API.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Clear the tracked pull-request URL whenever the branch changes.
    #[serde(default)]
    pub reset_on_branch_change: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: default_api_base(),
            reset_on_branch_change: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_base() -> String {
    "https://api.github.com".into()
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from(".conductor/prompts")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Repository root the agents work in; also where branch queries run.
    pub workspace_root: PathBuf,
    /// Directory of prompt files, relative to `workspace_root` unless absolute.
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,
    /// Loop timing and capacity limits.
    #[serde(default, rename = "loop")]
    pub timing: LoopConfig,
    /// Terminal-session manager settings.
    #[serde(default)]
    pub tmux: TmuxConfig,
    /// Review feedback polling settings.
    #[serde(default)]
    pub review: ReviewConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute path to the workspace root.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Resolved prompt queue directory.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        if self.queue_dir.is_absolute() {
            self.queue_dir.clone()
        } else {
            self.workspace_root.join(&self.queue_dir)
        }
    }

    fn validate(&mut self) -> Result<()> {
        self.timing.validate()?;

        if self.tmux.session.trim().is_empty() {
            return Err(AppError::Config("tmux.session must not be empty".into()));
        }

        if self.tmux.host_cli.trim().is_empty() {
            return Err(AppError::Config("tmux.host_cli must not be empty".into()));
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}
