//! Tracing subscriber bootstrap.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "courier.log";

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.filter`. When `config.directory` is set, events
/// are also written to a daily-rolling file there; keep the returned guard
/// alive for as long as file output is wanted.
///
/// # Errors
/// Returns an error if the filter directive is invalid, the log directory
/// cannot be created, or a global subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(&config.filter),
    }
    .with_context(|| format!("Invalid log filter: {}", config.filter))?;

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    let Some(directory) = config.directory.as_ref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
    let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(Some(guard))
}
