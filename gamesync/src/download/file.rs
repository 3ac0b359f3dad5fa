//! Single-file download: stream to a temporary, verify, then rename.
//!
//! The final path only ever receives fully verified content. Any failure,
//! including cancellation and stalls, removes the temporary file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::source::{ContentSource, SourceBody};
use super::state::DownloadTask;
use crate::checksum::{digests_match, hex_digest};
use crate::error::{SyncError, SyncResult};

/// Buffer size for reading/writing during downloads (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Callback receiving the bytes received so far in the current attempt and
/// the expected total, when known from the manifest or the response.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Downloads one file per call.
#[derive(Debug)]
pub struct FileDownloader<S> {
    source: Arc<S>,
    idle_timeout: Duration,
    resume_partial: bool,
}

impl<S> Clone for FileDownloader<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            idle_timeout: self.idle_timeout,
            resume_partial: self.resume_partial,
        }
    }
}

impl<S: ContentSource> FileDownloader<S> {
    /// Create a downloader that fails a transfer after `idle_timeout` without data.
    pub fn new(source: Arc<S>, idle_timeout: Duration) -> Self {
        Self {
            source,
            idle_timeout,
            resume_partial: true,
        }
    }

    /// Enable or disable resuming leftover temporaries.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume_partial = resume;
        self
    }

    /// Idle timeout in use.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// The underlying content source.
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Download `task` to its final path. Returns the final size in bytes.
    pub async fn fetch(
        &self,
        task: &mut DownloadTask,
        cancel: &CancellationToken,
        on_bytes: ByteProgress<'_>,
    ) -> SyncResult<u64> {
        let temp = task.temp_path();

        let mut resumed_from = 0;
        let mut result = self
            .fetch_to_temp(task, &temp, self.resume_partial, &mut resumed_from, cancel, on_bytes)
            .await;
        if resumed_from > 0 && matches!(result, Err(SyncError::HashMismatch { .. })) {
            // The leftover prefix came from other content.
            warn!(path = %task.label, offset = resumed_from, "Resumed download failed verification, restarting");
            remove_temp(&temp).await;
            result = self
                .fetch_to_temp(task, &temp, false, &mut resumed_from, cancel, on_bytes)
                .await;
        }

        let written = match result {
            Ok(written) => written,
            Err(e) => {
                remove_temp(&temp).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&temp, &task.dest).await {
            remove_temp(&temp).await;
            return Err(SyncError::WriteFailed {
                path: task.dest.clone(),
                source: e,
            });
        }

        debug!(path = %task.label, bytes = written, "File installed");
        Ok(written)
    }

    async fn fetch_to_temp(
        &self,
        task: &mut DownloadTask,
        temp: &Path,
        resume: bool,
        resumed_from: &mut u64,
        cancel: &CancellationToken,
        on_bytes: ByteProgress<'_>,
    ) -> SyncResult<u64> {
        *resumed_from = 0;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        if let Some(parent) = task.dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let mut hasher = Sha256::new();
        let mut offset = self.resumable_offset(task, temp, resume, &mut hasher).await?;

        let body = self.open(task, offset, cancel).await?;
        let file = if offset > 0 && body.resumed {
            debug!(path = %task.label, offset, "Resuming partial download");
            *resumed_from = offset;
            OpenOptions::new().append(true).open(temp).await
        } else {
            if offset > 0 {
                debug!(path = %task.label, "Server ignored range request, restarting");
                hasher = Sha256::new();
                offset = 0;
            }
            File::create(temp).await
        }
        .map_err(|e| SyncError::WriteFailed {
            path: temp.to_path_buf(),
            source: e,
        })?;

        let written = self
            .stream_body(task, body, file, offset, &mut hasher, cancel, on_bytes)
            .await?;

        if let Some(expected) = task.expected_size {
            if written != expected {
                return Err(SyncError::DownloadFailed {
                    path: task.label.clone(),
                    reason: format!("received {} of {} bytes", written, expected),
                });
            }
        }

        if let Some(expected) = &task.expected_hash {
            let actual = hex_digest(hasher);
            if !digests_match(&actual, expected) {
                return Err(SyncError::HashMismatch {
                    path: task.label.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(written)
    }

    /// Open the source, racing cancellation and the idle timeout.
    async fn open(
        &self,
        task: &DownloadTask,
        offset: u64,
        cancel: &CancellationToken,
    ) -> SyncResult<SourceBody> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            opened = tokio::time::timeout(self.idle_timeout, self.source.open(&task.url, offset)) => {
                opened.map_err(|_| self.stalled(task))?
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        &self,
        task: &mut DownloadTask,
        mut body: SourceBody,
        file: File,
        offset: u64,
        hasher: &mut Sha256,
        cancel: &CancellationToken,
        on_bytes: ByteProgress<'_>,
    ) -> SyncResult<u64> {
        let temp = task.temp_path();
        let write_failed = |e: std::io::Error| SyncError::WriteFailed {
            path: temp.clone(),
            source: e,
        };

        let expected_total = task
            .expected_size
            .or_else(|| body.content_length.map(|len| offset + len));
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
        let mut written = offset;
        task.bytes = written;
        on_bytes(written, expected_total);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                next = tokio::time::timeout(self.idle_timeout, body.stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => return Err(self.stalled(task)),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            let len = chunk.len() as u64;
            if let Some(expected) = task.expected_size {
                if written + len > expected {
                    return Err(SyncError::DownloadFailed {
                        path: task.label.clone(),
                        reason: format!("received more than the expected {} bytes", expected),
                    });
                }
            }

            writer.write_all(&chunk).await.map_err(write_failed)?;
            hasher.update(&chunk);
            written += len;
            task.bytes = written;
            on_bytes(written, expected_total);
        }

        writer.flush().await.map_err(write_failed)?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(write_failed)?;

        Ok(written)
    }

    /// Offset to resume from; leftover temporaries that cannot be resumed are removed.
    async fn resumable_offset(
        &self,
        task: &DownloadTask,
        temp: &Path,
        resume: bool,
        hasher: &mut Sha256,
    ) -> SyncResult<u64> {
        let existing = match fs::metadata(temp).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Ok(0),
        };

        let resumable = resume
            && existing > 0
            && task.expected_size.is_some_and(|size| existing < size);

        if !resumable {
            remove_temp(temp).await;
            return Ok(0);
        }

        match hash_prefix(temp, hasher).await {
            Ok(read) => Ok(read),
            Err(e) => {
                warn!(path = %task.label, error = %e, "Cannot read partial download, restarting");
                *hasher = Sha256::new();
                remove_temp(temp).await;
                Ok(0)
            }
        }
    }

    fn stalled(&self, task: &DownloadTask) -> SyncError {
        SyncError::Stalled {
            path: task.label.clone(),
            idle_ms: self.idle_timeout.as_millis() as u64,
        }
    }
}

async fn hash_prefix(path: &Path, hasher: &mut Sha256) -> std::io::Result<u64> {
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok(total)
}

async fn remove_temp(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed temporary file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
    }
}
