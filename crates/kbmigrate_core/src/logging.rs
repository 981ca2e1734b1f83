use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a terminal layer and an append-only text layer at `log_path`.
///
/// `RUST_LOG` controls filtering (default `info`). The returned guard flushes the
/// file writer on drop and must be held for the lifetime of the process.
pub fn init_logging(log_path: &Path) -> Result<WorkerGuard> {
    let directory = log_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("log path has no parent: {}", log_path.display()))?;
    fs::create_dir_all(directory)
        .with_context(|| format!("failed to create {}", directory.display()))?;
    let file_name = log_path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log path has no file name: {}", log_path.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_filter(env_filter()?);

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter()?);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    tracing::debug!("logging to {}", log_path.display());
    Ok(guard)
}

fn env_filter() -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to build log filter")
}
