//! Bounded-time execution of short external commands (`tmux`, `git`).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::{AppError, Result};

/// Run `program` with `args` and return its trimmed stdout.
///
/// The child is killed if `timeout` elapses first. Failures are wrapped
/// with `kind`, so callers get the error variant of their domain.
///
/// # Errors
///
/// Returns `kind(..)` if the program cannot be started, times out, or
/// exits with a non-zero status.
pub async fn run_capture(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
    kind: fn(String) -> AppError,
) -> Result<String> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| kind(format!("{program} timed out after {}ms", timeout.as_millis())))?
        .map_err(|err| kind(format!("failed to run {program}: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(program, status = %output.status, stderr = %stderr.trim(), "command failed");
        return Err(kind(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}
