//! Progress reporting for concurrent downloads.
//!
//! Workers store their byte counts in per-task atomic counters. A reporter task
//! polls the counters on a fixed interval, so the callback rate does not depend
//! on chunk sizes or the number of workers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::events::percent_of;

/// Aggregate progress of a pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes received across all in-flight and completed tasks.
    pub bytes: u64,
    /// Bytes in the whole work set.
    pub total_bytes: u64,
    /// Tasks finished successfully.
    pub files_completed: usize,
    /// Tasks in the work set.
    pub total_files: usize,
    /// Bytes per second over the last rate window.
    pub speed: u64,
}

impl TransferProgress {
    /// Bytes-based percent, 100 for an empty work set.
    pub fn percent(&self) -> u8 {
        percent_of(self.bytes, self.total_bytes)
    }
}

/// Callback receiving aggregate progress.
pub type TransferCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Shared counters for one pool run.
#[derive(Debug)]
pub struct ProgressCounters {
    file_progress: Vec<AtomicU64>,
    files_completed: AtomicUsize,
}

impl ProgressCounters {
    /// Counters for `num_files` tasks.
    pub fn new(num_files: usize) -> Self {
        Self {
            file_progress: (0..num_files).map(|_| AtomicU64::new(0)).collect(),
            files_completed: AtomicUsize::new(0),
        }
    }

    /// Bytes received across all tasks.
    pub fn total_bytes(&self) -> u64 {
        self.file_progress
            .iter()
            .map(|p| p.load(Ordering::Relaxed))
            .sum()
    }

    /// Tasks finished successfully.
    pub fn completed_files(&self) -> usize {
        self.files_completed.load(Ordering::Relaxed)
    }

    /// Set the bytes received by task `index` in its current attempt.
    pub fn update_file(&self, index: usize, bytes: u64) {
        if let Some(counter) = self.file_progress.get(index) {
            counter.store(bytes, Ordering::Relaxed);
        }
    }

    /// Mark task `index` as finished with `final_bytes`.
    pub fn mark_completed(&self, index: usize, final_bytes: u64) {
        if let Some(counter) = self.file_progress.get(index) {
            counter.store(final_bytes, Ordering::Relaxed);
            self.files_completed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Transfer rate recomputed at most once per window.
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    last_at: Instant,
    last_bytes: u64,
    rate: u64,
}

impl RateMeter {
    /// A meter starting at `now` with zero bytes.
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            last_at: now,
            last_bytes: 0,
            rate: 0,
        }
    }

    /// Feed the current byte total; returns the rate of the last full window.
    pub fn sample(&mut self, bytes: u64, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed >= self.window && !elapsed.is_zero() {
            // Counters drop back on retry, so the delta saturates.
            let delta = bytes.saturating_sub(self.last_bytes);
            self.rate = (delta as f64 / elapsed.as_secs_f64()) as u64;
            self.last_at = now;
            self.last_bytes = bytes;
        }
        self.rate
    }

    /// The last computed rate.
    pub fn rate(&self) -> u64 {
        self.rate
    }
}

/// Periodic progress reporter running as a tokio task.
pub struct ProgressReporter {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Start polling `counters` every `interval`.
    pub fn start(
        counters: Arc<ProgressCounters>,
        total_bytes: u64,
        total_files: usize,
        callback: TransferCallback,
        interval: Duration,
        rate_window: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            let mut meter = RateMeter::new(rate_window, Instant::now());
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let report = |meter: &mut RateMeter| {
                let bytes = counters.total_bytes();
                let progress = TransferProgress {
                    bytes,
                    total_bytes,
                    files_completed: counters.completed_files(),
                    total_files,
                    speed: meter.sample(bytes, Instant::now()),
                };
                callback(&progress);
            };

            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => report(&mut meter),
                }
            }

            // Final report
            report(&mut meter);
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the reporter after one final report.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
