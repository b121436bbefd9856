//! File logging for the supervisor and CLI.
//!
//! Sandbox runtimes never call [`init`]: their stdout and stderr are the
//! bot console, and the supervisor records lifecycle events on its side.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_DIR: &str = "botvisor";
const LOG_FILE: &str = "botvisor.log";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init() -> Result<()> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let log_path = log_path(
        std::env::var_os("XDG_STATE_HOME").map(PathBuf::from),
        home::home_dir(),
    )?;
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let (directory, file_name) = split_path(&log_path)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(rolling::never(directory, file_name));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    let _ = GUARD.set(guard);
    Ok(())
}

/// `$XDG_STATE_HOME/botvisor/botvisor.log`, then `~/.local/state/...`,
/// then the current directory.
fn log_path(state_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(state_home) = state_home.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(state_home.join(LOG_DIR).join(LOG_FILE));
    }

    if let Some(home_dir) = home_dir {
        return Ok(home_dir
            .join(".local")
            .join("state")
            .join(LOG_DIR)
            .join(LOG_FILE));
    }

    Ok(std::env::current_dir()?.join(LOG_FILE))
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}
