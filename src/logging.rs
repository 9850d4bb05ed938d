//! # Logging
//!
//! Installs the global `tracing` subscriber.
//!
//! Console output is always on. When `[logging] directory` is set, the same
//! events are also written to a daily rolling file in that directory. The
//! `RUST_LOG` environment variable overrides the configured level.

use std::fs;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{BridgeError, Result};

/// File name prefix of the rolling log files
pub const LOG_FILE_PREFIX: &str = "telemetry-bridge.log";

/// Keeps the background log writer alive. Drop it only on shutdown.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize logging for the process
///
/// # Arguments
///
/// * `config` - Logging section of the configuration
///
/// # Returns
///
/// * `Result<LogGuard>` - Guard that flushes file output when dropped
///
/// # Errors
///
/// Returns error if the log directory cannot be created or a global
/// subscriber was already installed
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let filter = build_filter(&config.level);

    let (file_layer, file_guard) = match &config.directory {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| BridgeError::Logging(e.to_string()))?;

    Ok(LogGuard { _file_guard: file_guard })
}

/// `RUST_LOG` wins over the configured level when it is set and non-empty
fn build_filter(level: &str) -> EnvFilter {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(level),
    }
}
