#![forbid(unsafe_code)]

//! `agent-conductor` — orchestration loop binary.
//!
//! Bootstraps configuration, wires the tmux, git, queue and GitHub
//! collaborators into the loop, and logs every loop event until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conductor::config::GlobalConfig;
use agent_conductor::orchestrator::branch_monitor::GitBranchSource;
use agent_conductor::orchestrator::loop_driver::{Collaborators, LoopDriver};
use agent_conductor::orchestrator::review_poller::{GithubReviewSource, ReviewSource};
use agent_conductor::orchestrator::session_inspector::TmuxInspector;
use agent_conductor::orchestrator::spawner::TmuxSpawner;
use agent_conductor::persistence::queue_store::PromptDirStore;
use agent_conductor::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conductor", about = "Dispatch queued prompts to coding agents in tmux", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Pull-request URL to watch for review feedback from startup.
    #[arg(long)]
    track_pr: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-conductor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;

    if let Some(ws) = args.workspace {
        let canonical = ws
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        config.workspace_root = canonical;
    }
    info!(
        workspace = %config.workspace_root.display(),
        queue = %config.queue_path().display(),
        tmux_session = config.tmux.session,
        "configuration loaded"
    );

    // ── Collaborators ───────────────────────────────────
    let query_timeout = config.timing.query_timeout();
    let review: Option<Arc<dyn ReviewSource>> = if config.review.enabled {
        match GithubReviewSource::from_env(&config.review.api_base, query_timeout) {
            Ok(source) => Some(Arc::new(source)),
            Err(err) => {
                warn!(%err, "review polling disabled");
                None
            }
        }
    } else {
        info!("review polling disabled by configuration");
        None
    };

    let collaborators = Collaborators {
        inspector: Arc::new(TmuxInspector::new(&config.tmux, query_timeout)),
        spawner: Arc::new(TmuxSpawner::new(&config)),
        store: Arc::new(PromptDirStore::new(config.queue_path())),
        branch: Arc::new(GitBranchSource::new(&config.workspace_root, query_timeout)),
        review,
    };

    // ── Start the loop ──────────────────────────────────
    let handle = LoopDriver::new(config.timing.clone(), collaborators)
        .window_prefix(config.tmux.window_prefix.clone())
        .reset_review_on_branch_change(config.review.reset_on_branch_change)
        .on_agents_change(|agents| {
            let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
            info!(count = agents.len(), agents = ?names, "tracked agents changed");
        })
        .on_branch_change(|branch| info!(branch, "branch changed"))
        .on_review_feedback(|url| info!(url, "review feedback available"))
        .on_dispatch(|unit| info!(unit = unit.id, title = ?unit.title, "work unit dispatched"))
        .on_blocked(|unit| {
            warn!(unit = unit.id, retries = unit.retry_count, "work unit blocked; needs attention");
        })
        .start();

    if let Some(url) = args.track_pr {
        handle.set_tracked_url(Some(url));
    }

    info!("orchestration loop running");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    handle.stop().await;

    let snapshot = handle.snapshot();
    info!(
        ticks = snapshot.ticks,
        agents = snapshot.agents.len(),
        "agent-conductor shut down"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
