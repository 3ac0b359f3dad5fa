//! Error types for the sync engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronising an installation.
///
/// Per-file variants (`DownloadFailed`, `Stalled`, `HashMismatch`, ...) are
/// absorbed and retried inside the worker pool. Cycle-level variants
/// (`ManifestUnavailable`, `InsufficientSpace`, `PartialFailure`, ...) are what
/// callers of [`crate::engine::SyncEngine`] see.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The manifest could not be fetched or parsed.
    #[error("manifest unavailable from {url}: {reason}")]
    ManifestUnavailable { url: String, reason: String },

    /// The manifest body parsed but violates the manifest rules.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A manifest path is not a safe relative path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Not enough free disk space (margin already applied to `required`).
    #[error("insufficient disk space: {required} bytes required, {free} bytes free")]
    InsufficientSpace { required: u64, free: u64 },

    /// A single file download attempt failed.
    #[error("failed to download {path}: {reason}")]
    DownloadFailed { path: String, reason: String },

    /// No data arrived within the idle timeout.
    #[error("download of {path} stalled: no data for {idle_ms}ms")]
    Stalled { path: String, idle_ms: u64 },

    /// The server kept redirecting.
    #[error("too many redirects for {url} (limit {limit})")]
    TooManyRedirects { url: String, limit: usize },

    /// Downloaded content does not hash to the expected digest.
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Some files were still failing after every retry.
    #[error("{} file(s) failed to download: {}", failed.len(), failed.join(", "))]
    PartialFailure { failed: Vec<String> },

    /// Files still mismatch the manifest after the download phase.
    #[error("{} file(s) failed verification: {}", paths.len(), paths.join(", "))]
    VerificationFailed { paths: Vec<String> },

    /// Archive extraction failed.
    #[error("failed to extract {}: {reason}", path.display())]
    ExtractionFailed { path: PathBuf, reason: String },

    /// Failed to read a file or directory.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to write a file.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// The installation marker could not be written or removed.
    #[error("installation marker {}: {reason}", path.display())]
    MarkerFailed { path: PathBuf, reason: String },

    /// Required files are missing after an install.
    #[error("installation incomplete, missing: {}", missing.join(", "))]
    NotInstalled { missing: Vec<String> },

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Another sync cycle is already running on this engine.
    #[error("a sync cycle is already in progress")]
    CycleInProgress,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Whether a failed download attempt with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::CycleInProgress | Self::InvalidConfig(_) | Self::InvalidPath(_)
        )
    }
}
