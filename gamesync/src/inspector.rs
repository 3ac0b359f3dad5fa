//! Local state inspection: diffing a manifest against the install tree.
//!
//! Every entry is classified with the cheapest check that can decide it:
//!
//! 1. missing file            -> fetch
//! 2. size differs            -> fetch
//! 3. SHA-256 differs         -> fetch (skipped above the hash limit)
//!
//! Inspection is read-only; nothing under the root is modified.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::checksum::{calculate_file_checksum, digests_match};
use crate::error::SyncResult;
use crate::manifest::{Manifest, ManifestEntry};

/// Callback for inspection progress: `(entries_checked, total_entries)`.
pub type InspectProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// How thoroughly existing files are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashPolicy {
    /// Files larger than this many bytes are compared by size only.
    pub full_hash_limit: Option<u64>,
}

impl HashPolicy {
    /// Hash every file regardless of size.
    pub fn always() -> Self {
        Self {
            full_hash_limit: None,
        }
    }

    /// Hash only files up to `limit` bytes.
    pub fn up_to(limit: u64) -> Self {
        Self {
            full_hash_limit: Some(limit),
        }
    }

    /// Whether a file of `size` bytes should be hashed.
    pub fn should_hash(&self, size: u64) -> bool {
        self.full_hash_limit.map_or(true, |limit| size <= limit)
    }
}

/// Observed state of one local file. Recomputed every cycle, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalFileState {
    /// Whether a regular file exists at the entry path.
    pub exists: bool,
    /// Local size, when the file exists.
    pub size: Option<u64>,
    /// Local digest, when it was computed.
    pub hash: Option<String>,
}

/// Why an entry needs downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchReason {
    /// No file at the path.
    Missing,
    /// File exists with the wrong length.
    SizeMismatch { local: u64, expected: u64 },
    /// File has the right length but different content.
    HashMismatch,
    /// File exists but could not be read.
    Unreadable,
}

/// Per-entry outcome of the diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    /// Local copy matches.
    Skip,
    /// Local copy is missing or wrong.
    Fetch(FetchReason),
}

impl SyncDecision {
    /// Whether the entry must be downloaded.
    pub fn needs_fetch(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }
}

/// Entries that need downloading in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSet {
    /// Entries to fetch, in manifest order.
    pub entries: Vec<ManifestEntry>,
    /// Sum of `size` over `entries`, saturating at `u64::MAX`.
    pub total_bytes: u64,
}

impl WorkSet {
    /// Add an entry, keeping `total_bytes` in step.
    pub fn push(&mut self, entry: ManifestEntry) {
        self.total_bytes = self.total_bytes.saturating_add(entry.size);
        self.entries.push(entry);
    }

    /// Whether nothing needs downloading.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Paths of all entries.
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }
}

impl FromIterator<ManifestEntry> for WorkSet {
    fn from_iter<I: IntoIterator<Item = ManifestEntry>>(iter: I) -> Self {
        let mut set = WorkSet::default();
        for entry in iter {
            set.push(entry);
        }
        set
    }
}

/// Local path of a manifest entry under `root`.
pub fn local_path(root: &Path, entry: &ManifestEntry) -> PathBuf {
    entry
        .path
        .split('/')
        .fold(root.to_path_buf(), |acc, segment| acc.join(segment))
}

/// Observe the local copy of `entry`, hashing only when the cheap checks pass.
pub fn inspect(root: &Path, entry: &ManifestEntry, policy: HashPolicy) -> SyncResult<LocalFileState> {
    let path = local_path(root, entry);
    let size = match path.metadata() {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Ok(LocalFileState::default()),
    };

    let hash = if size == entry.size && policy.should_hash(size) {
        Some(calculate_file_checksum(&path)?)
    } else {
        None
    };

    Ok(LocalFileState {
        exists: true,
        size: Some(size),
        hash,
    })
}

/// Decide what to do with an entry given its observed local state.
pub fn decide(entry: &ManifestEntry, state: &LocalFileState) -> SyncDecision {
    if !state.exists {
        return SyncDecision::Fetch(FetchReason::Missing);
    }
    match state.size {
        Some(local) if local != entry.size => {
            return SyncDecision::Fetch(FetchReason::SizeMismatch {
                local,
                expected: entry.size,
            })
        }
        None => return SyncDecision::Fetch(FetchReason::Unreadable),
        _ => {}
    }
    match &state.hash {
        Some(hash) if !digests_match(hash, &entry.hash) => {
            SyncDecision::Fetch(FetchReason::HashMismatch)
        }
        _ => SyncDecision::Skip,
    }
}

/// Classify a single entry. Read failures count as "fetch".
pub fn classify(root: &Path, entry: &ManifestEntry, policy: HashPolicy) -> SyncDecision {
    match inspect(root, entry, policy) {
        Ok(state) => decide(entry, &state),
        Err(e) => {
            warn!(path = %entry.path, error = %e, "Cannot inspect local file, scheduling download");
            SyncDecision::Fetch(FetchReason::Unreadable)
        }
    }
}

/// Compute the work set for `manifest` against the tree at `root`.
///
/// `on_progress` is invoked every `progress_every` entries and once at the end.
pub fn diff(
    manifest: &Manifest,
    root: &Path,
    policy: HashPolicy,
    progress_every: usize,
    on_progress: Option<InspectProgress<'_>>,
) -> WorkSet {
    let total = manifest.len();
    let every = progress_every.max(1);
    let mut work = WorkSet::default();

    for (i, entry) in manifest.files.iter().enumerate() {
        let decision = classify(root, entry, policy);
        if let SyncDecision::Fetch(reason) = decision {
            debug!(path = %entry.path, ?reason, "Needs download");
            work.push(entry.clone());
        }

        let checked = i + 1;
        if checked % every == 0 || checked == total {
            if let Some(cb) = on_progress {
                cb(checked, total);
            }
        }
    }

    info!(
        checked = total,
        to_fetch = work.len(),
        bytes = work.total_bytes,
        "Local state inspected"
    );
    work
}
