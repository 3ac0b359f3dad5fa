//! Concurrent download pipeline.
//!
//! This module provides functionality for downloading the work set,
//! including:
//! - Pluggable content sources (`source`, `http`)
//! - Single file downloads with idle timeout, resume and hash verification (`file`)
//! - Per-file retry with linear backoff (`retry`)
//! - Real-time progress aggregation (`progress`)
//! - A fixed-size worker pool over a shared queue (`pool`)
//!
//! # Architecture
//!
//! ```text
//! WorkerPool
//!     │
//!     ├── N workers ── pop ──> shared VecDeque<DownloadTask>
//!     │       │
//!     │       └── download_with_retry
//!     │               └── FileDownloader ── ContentSource (trait)
//!     │                                         ├── HttpSource
//!     │                                         └── (test doubles)
//!     │
//!     └── ProgressReporter (polls ProgressCounters)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gamesync::download::{plan_tasks, HttpSource, WorkerPool};
//!
//! let source = Arc::new(HttpSource::new(&config)?);
//! let pool = WorkerPool::new(source, &config);
//! let tasks = plan_tasks(&work_set, &config.install_root, |e| config.file_url(&e.path))?;
//! let report = pool.download_all(tasks, &cancel, None).await?;
//! ```

mod file;
mod http;
mod pool;
mod progress;
mod retry;
mod source;
mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use file::{ByteProgress, FileDownloader};
pub use http::HttpSource;
pub use pool::{plan_tasks, WorkerPool};
pub use progress::{
    ProgressCounters, ProgressReporter, RateMeter, TransferCallback, TransferProgress,
};
pub use retry::{download_with_retry, RetryPolicy};
pub use source::{ByteStream, ContentSource, SourceBody};
pub use state::{temp_path, DownloadReport, DownloadTask, TEMP_SUFFIX};
