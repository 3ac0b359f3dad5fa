//! Fixed-size worker pool over a shared download queue.
//!
//! Workers pull tasks from one queue until it is empty, so a slow or failing
//! file never holds up the others. A file that fails after every retry is
//! recorded and the pool keeps going; the run fails only after every task has
//! finished one way or the other.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::file::FileDownloader;
use super::progress::{ProgressCounters, ProgressReporter, TransferCallback};
use super::retry::{download_with_retry, RetryPolicy};
use super::source::ContentSource;
use super::state::{DownloadReport, DownloadTask};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::inspector::WorkSet;
use crate::manifest::ManifestEntry;

type TaskQueue = Arc<Mutex<VecDeque<DownloadTask>>>;

/// Concurrent downloader for a work set.
#[derive(Debug)]
pub struct WorkerPool<S> {
    downloader: FileDownloader<S>,
    retry: RetryPolicy,
    max_concurrent: usize,
    progress_interval: Duration,
    rate_window: Duration,
}

impl<S: ContentSource> WorkerPool<S> {
    /// Create a pool from the sync configuration.
    pub fn new(source: Arc<S>, config: &SyncConfig) -> Self {
        Self {
            downloader: FileDownloader::new(source, config.idle_timeout)
                .with_resume(config.resume_partial),
            retry: RetryPolicy::from_config(config),
            max_concurrent: config.max_concurrent_downloads.max(1),
            progress_interval: config.progress_interval,
            rate_window: config.rate_window,
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the number of workers.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// The single-file downloader shared by the workers.
    pub fn downloader(&self) -> &FileDownloader<S> {
        &self.downloader
    }

    /// The retry policy applied to each file.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Download every task.
    ///
    /// Returns `PartialFailure` naming every file that still failed after its
    /// retries, or `Cancelled` when `cancel` fired. Successful files stay in
    /// place in both cases.
    pub async fn download_all(
        &self,
        mut tasks: Vec<DownloadTask>,
        cancel: &CancellationToken,
        on_progress: Option<TransferCallback>,
    ) -> SyncResult<DownloadReport> {
        if tasks.is_empty() {
            return Ok(DownloadReport::default());
        }

        for (index, task) in tasks.iter_mut().enumerate() {
            task.index = index;
            task.attempts = 0;
            task.bytes = 0;
        }

        let total_files = tasks.len();
        let total_bytes: u64 = tasks.iter().filter_map(|t| t.expected_size).sum();
        let labels: Vec<String> = tasks.iter().map(|t| t.label.clone()).collect();
        let workers = self.max_concurrent.min(total_files);

        info!(
            files = total_files,
            bytes = total_bytes,
            workers,
            "Starting downloads"
        );

        let queue: TaskQueue = Arc::new(Mutex::new(tasks.into()));
        let counters = Arc::new(ProgressCounters::new(total_files));
        let finished: Arc<Vec<AtomicBool>> =
            Arc::new((0..total_files).map(|_| AtomicBool::new(false)).collect());

        let reporter = on_progress.map(|callback| {
            ProgressReporter::start(
                Arc::clone(&counters),
                total_bytes,
                total_files,
                callback,
                self.progress_interval,
                self.rate_window,
            )
        });

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(run_worker(
                worker_id,
                self.downloader.clone(),
                self.retry,
                Arc::clone(&queue),
                Arc::clone(&counters),
                Arc::clone(&finished),
                cancel.clone(),
            ));
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Download worker terminated abnormally");
            }
        }

        if let Some(reporter) = reporter {
            reporter.stop().await;
        }

        if cancel.is_cancelled() {
            info!("Downloads cancelled");
            return Err(SyncError::Cancelled);
        }

        let failed: Vec<String> = labels
            .iter()
            .zip(finished.iter())
            .filter(|(_, done)| !done.load(Ordering::SeqCst))
            .map(|(label, _)| label.clone())
            .collect();

        if !failed.is_empty() {
            error!(failed = failed.len(), total = total_files, "Some downloads failed");
            return Err(SyncError::PartialFailure { failed });
        }

        let report = DownloadReport {
            files: counters.completed_files(),
            bytes: counters.total_bytes(),
        };
        info!(files = report.files, bytes = report.bytes, "Downloads complete");
        Ok(report)
    }
}

async fn run_worker<S: ContentSource>(
    worker_id: usize,
    downloader: FileDownloader<S>,
    retry: RetryPolicy,
    queue: TaskQueue,
    counters: Arc<ProgressCounters>,
    finished: Arc<Vec<AtomicBool>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let next = queue.lock().pop_front();
        let Some(mut task) = next else {
            break;
        };

        let index = task.index;
        debug!(worker = worker_id, path = %task.label, "Dequeued download");
        let on_bytes = |bytes: u64, _: Option<u64>| counters.update_file(index, bytes);

        match download_with_retry(&downloader, &mut task, retry, &cancel, &on_bytes).await {
            Ok(bytes) => {
                counters.mark_completed(index, bytes);
                finished[index].store(true, Ordering::SeqCst);
            }
            Err(SyncError::Cancelled) => break,
            Err(e) => {
                counters.update_file(index, 0);
                error!(
                    worker = worker_id,
                    path = %task.label,
                    attempts = task.attempts,
                    error = %e,
                    "Download failed after retries"
                );
            }
        }
    }
    debug!(worker = worker_id, "Worker finished");
}

/// Build one task per work-set entry, resolving URLs with `url_for`.
pub fn plan_tasks<F>(work_set: &WorkSet, root: &Path, url_for: F) -> SyncResult<Vec<DownloadTask>>
where
    F: Fn(&ManifestEntry) -> SyncResult<String>,
{
    work_set
        .entries
        .iter()
        .enumerate()
        .map(|(index, entry)| Ok(DownloadTask::for_entry(index, entry, url_for(entry)?, root)))
        .collect()
}
