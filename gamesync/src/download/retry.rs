//! Per-file retry with linear backoff.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::file::{ByteProgress, FileDownloader};
use super::source::ContentSource;
use super::state::DownloadTask;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// How often and how patiently a file is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per file, including the first.
    pub max_attempts: u32,
    /// Delay multiplied by the attempt number before the next attempt.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy. At least one attempt is always made.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Policy from the sync configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.max_attempts, config.retry_base_delay)
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(2000))
    }
}

/// Download `task`, retrying retryable failures up to `policy.max_attempts` times.
///
/// `task.attempts` counts the attempts made. The byte counter is reset at the
/// start of every attempt. Cancellation interrupts both the transfer and the
/// backoff sleep.
pub async fn download_with_retry<S: ContentSource>(
    downloader: &FileDownloader<S>,
    task: &mut DownloadTask,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    on_bytes: ByteProgress<'_>,
) -> SyncResult<u64> {
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        task.attempts += 1;
        task.bytes = 0;
        on_bytes(0, task.expected_size);

        let error = match downloader.fetch(task, cancel, on_bytes).await {
            Ok(bytes) => {
                if task.attempts > 1 {
                    debug!(path = %task.label, attempt = task.attempts, "Download succeeded after retry");
                }
                return Ok(bytes);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Err(error);
        }

        on_bytes(0, task.expected_size);
        if task.attempts >= policy.max_attempts {
            warn!(
                path = %task.label,
                attempts = task.attempts,
                error = %error,
                "Download failed, giving up"
            );
            return Err(error);
        }

        let delay = policy.delay_after(task.attempts);
        warn!(
            path = %task.label,
            attempt = task.attempts,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Download attempt failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
