//! Subscriber setup for the binary.
//!
//! Logs always go to stderr. When `[logging] dir` is set they are also written
//! to a daily-rolling `forge-steps.log` in that directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingSettings;

const LOG_FILE_PREFIX: &str = "forge-steps.log";

/// Keep alive for the lifetime of the process; dropping it flushes the file
/// writer.
pub struct LoggingHandle {
    pub _guard: Option<WorkerGuard>,
    pub log_dir: Option<PathBuf>,
}

/// `RUST_LOG` wins, then `--verbose` (debug), then the configured level.
pub fn filter_directive(settings: &LoggingSettings, verbose: bool, rust_log: Option<String>) -> String {
    match rust_log {
        Some(directive) if !directive.trim().is_empty() => directive,
        _ if verbose => "debug".to_string(),
        _ => settings.level.clone(),
    }
}

pub fn init_logging(settings: &LoggingSettings, verbose: bool) -> Result<LoggingHandle> {
    let directive = filter_directive(settings, verbose, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    let stderr_layer = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let Some(dir) = settings.dir.clone() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(LoggingHandle {
            _guard: None,
            log_dir: None,
        });
    };

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingHandle {
        _guard: Some(guard),
        log_dir: Some(dir),
    })
}
