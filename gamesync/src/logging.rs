//! Logging setup for hosts embedding the engine.
//!
//! The engine only emits `tracing` events; installing a subscriber is up to
//! the host. [`init`] is the stock choice: a daily-rolling log file behind a
//! non-blocking writer, filtered by `RUST_LOG` with an `info` default.

use std::fs;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::EnvFilter;

use crate::error::{SyncError, SyncResult};

/// Log file settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory receiving the log files.
    pub directory: PathBuf,
    /// File name prefix; the appender adds the date.
    pub file_prefix: String,
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
}

impl LogConfig {
    /// Log into `directory` as `gamesync.log.<date>`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            file_prefix: "gamesync.log".to_string(),
            default_directive: "info".to_string(),
        }
    }

    /// Set the file name prefix.
    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Set the fallback filter directive.
    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }
}

/// Keeps the background log writer alive. Buffered lines are flushed on drop.
#[must_use = "dropping the guard stops log output"]
#[derive(Debug)]
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> SyncResult<LoggingGuard> {
    fs::create_dir_all(&config.directory).map_err(|e| SyncError::CreateDirFailed {
        path: config.directory.clone(),
        source: e,
    })?;

    let file_appender = tracing_appender::rolling::daily(&config.directory, &config.file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = Subscriber::builder()
        .with_env_filter(config.filter())
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| SyncError::InvalidConfig(format!("logging already initialised: {}", e)))?;

    Ok(LoggingGuard { _guard: guard })
}
