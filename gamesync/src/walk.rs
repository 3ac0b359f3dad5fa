//! Lazy directory-tree traversal.
//!
//! [`TreeWalk`] describes a traversal; each call to [`TreeWalk::files`] starts
//! a fresh walk, so the same value can be iterated any number of times.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{SyncError, SyncResult};

/// A restartable walk over the regular files under a root directory.
#[derive(Debug, Clone)]
pub struct TreeWalk {
    root: PathBuf,
    skip_suffix: Option<String>,
}

/// One regular file found by a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    /// Absolute path.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

impl TreeWalk {
    /// Walk every regular file under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skip_suffix: None,
        }
    }

    /// Skip files whose name ends with `suffix` (e.g. in-progress temporaries).
    pub fn skipping_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.skip_suffix = Some(suffix.into());
        self
    }

    /// Root of the walk.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily yield `(path, size)` for each regular file.
    ///
    /// A missing root yields nothing. Unreadable entries yield an error item
    /// and the walk continues.
    pub fn files(&self) -> impl Iterator<Item = SyncResult<TreeFile>> + '_ {
        let exists = self.root.exists();
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter(move |_| exists)
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() || self.is_skipped(entry.file_name()) {
                        return None;
                    }
                    Some(
                        entry
                            .metadata()
                            .map(|m| TreeFile {
                                path: entry.path().to_path_buf(),
                                size: m.len(),
                            })
                            .map_err(|e| SyncError::ReadFailed {
                                path: entry.path().to_path_buf(),
                                source: e.into(),
                            }),
                    )
                }
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    Some(Err(SyncError::ReadFailed {
                        path,
                        source: e.into(),
                    }))
                }
            })
    }

    /// Total size of all readable files, summed lazily.
    pub fn total_size(&self) -> u64 {
        self.files().filter_map(Result::ok).map(|f| f.size).sum()
    }

    /// Number of readable files.
    pub fn file_count(&self) -> usize {
        self.files().filter_map(Result::ok).count()
    }

    fn is_skipped(&self, name: &std::ffi::OsStr) -> bool {
        match (&self.skip_suffix, name.to_str()) {
            (Some(suffix), Some(name)) => name.ends_with(suffix.as_str()),
            _ => false,
        }
    }
}
