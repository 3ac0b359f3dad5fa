//! Download task and run report types.

use std::path::{Path, PathBuf};

use crate::inspector::local_path;
use crate::manifest::ManifestEntry;

/// Suffix appended to a final path while its content is in flight.
pub const TEMP_SUFFIX: &str = ".download";

/// One file to download. Owned by exactly one worker at a time.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Position in the work set (indexes the progress counters).
    pub index: usize,
    /// Label used in logs and failure reports (the manifest path).
    pub label: String,
    /// Source URL.
    pub url: String,
    /// Final destination path.
    pub dest: PathBuf,
    /// Expected size, when known.
    pub expected_size: Option<u64>,
    /// Expected lowercase SHA-256, when known.
    pub expected_hash: Option<String>,
    /// Attempts made so far.
    pub attempts: u32,
    /// Bytes received in the current attempt.
    pub bytes: u64,
}

impl DownloadTask {
    /// A task for a manifest entry under `root`.
    pub fn for_entry(index: usize, entry: &ManifestEntry, url: String, root: &Path) -> Self {
        Self {
            index,
            label: entry.path.clone(),
            url,
            dest: local_path(root, entry),
            expected_size: Some(entry.size),
            expected_hash: Some(entry.hash.clone()),
            attempts: 0,
            bytes: 0,
        }
    }

    /// A task for content with no manifest entry (e.g. a bulk archive).
    pub fn unverified(label: impl Into<String>, url: impl Into<String>, dest: PathBuf) -> Self {
        Self {
            index: 0,
            label: label.into(),
            url: url.into(),
            dest,
            expected_size: None,
            expected_hash: None,
            attempts: 0,
            bytes: 0,
        }
    }

    /// Sibling temporary path the content is streamed into.
    pub fn temp_path(&self) -> PathBuf {
        temp_path(&self.dest)
    }
}

/// `<dest>.download`, next to `dest`.
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    dest.with_file_name(name)
}

/// Result of a successful pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Files downloaded and verified.
    pub files: usize,
    /// Bytes written to final paths.
    pub bytes: u64,
}
