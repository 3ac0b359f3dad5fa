//! Archive extraction for the bulk first install.
//!
//! This module handles:
//! - Detecting the archive format from its file name
//! - Extracting zip and tar.gz archives entry by entry
//! - Stripping a known top-level root folder so differently packaged
//!   archives land in the same layout
//!
//! Extraction is blocking; async callers run it on the blocking pool.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{SyncError, SyncResult};

/// Callback receiving `(entries_processed, total_entries)`.
pub type ExtractProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// Supported bulk archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `.zip`
    Zip,
    /// `.tar.gz` or `.tgz`
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from a file name or URL path.
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }

    /// Canonical file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

/// What an extraction produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Entries processed, including directories and skipped entries.
    pub entries: usize,
    /// Regular files written.
    pub files: usize,
    /// Bytes written.
    pub bytes: u64,
}

/// Extracts bulk archives into the install root.
#[derive(Debug, Clone, Default)]
pub struct ArchiveExtractor {
    strip_roots: Vec<String>,
}

impl ArchiveExtractor {
    /// Create an extractor that strips any of `strip_roots` when it is the
    /// first component of an entry path.
    pub fn new(strip_roots: Vec<String>) -> Self {
        Self { strip_roots }
    }

    /// Extract `archive` into `dest`.
    pub fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        cancel: &CancellationToken,
        on_progress: Option<ExtractProgress<'_>>,
    ) -> SyncResult<ExtractSummary> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let format = ArchiveFormat::detect(&name).ok_or_else(|| SyncError::ExtractionFailed {
            path: archive.to_path_buf(),
            reason: "unsupported archive format".to_string(),
        })?;

        fs::create_dir_all(dest).map_err(|e| SyncError::CreateDirFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;

        info!(archive = %archive.display(), dest = %dest.display(), ?format, "Extracting archive");
        let summary = match format {
            ArchiveFormat::Zip => self.extract_zip(archive, dest, cancel, on_progress)?,
            ArchiveFormat::TarGz => self.extract_tar_gz(archive, dest, cancel, on_progress)?,
        };
        info!(
            entries = summary.entries,
            files = summary.files,
            bytes = summary.bytes,
            "Archive extracted"
        );
        Ok(summary)
    }

    fn extract_zip(
        &self,
        archive_path: &Path,
        dest: &Path,
        cancel: &CancellationToken,
        on_progress: Option<ExtractProgress<'_>>,
    ) -> SyncResult<ExtractSummary> {
        let corrupt = |reason: String| SyncError::ExtractionFailed {
            path: archive_path.to_path_buf(),
            reason,
        };

        let file = open_archive(archive_path)?;
        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| corrupt(e.to_string()))?;
        let total = archive.len();
        let mut summary = ExtractSummary::default();

        for i in 0..total {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let mut entry = archive.by_index(i).map_err(|e| corrupt(e.to_string()))?;
            let target = entry
                .enclosed_name()
                .and_then(|p| self.relative_target(&p));

            match target {
                None => debug!(entry = entry.name(), "Skipping archive entry"),
                Some(relative) => {
                    let out = dest.join(relative);
                    if entry.is_dir() {
                        create_dir(&out)?;
                    } else {
                        summary.bytes += write_entry(&mut entry, &out, archive_path)?;
                        summary.files += 1;

                        #[cfg(unix)]
                        {
                            if let Some(mode) = entry.unix_mode() {
                                set_mode(&out, mode)?;
                            }
                        }
                    }
                }
            }

            summary.entries += 1;
            if let Some(cb) = on_progress {
                cb(i + 1, total);
            }
        }

        Ok(summary)
    }

    fn extract_tar_gz(
        &self,
        archive_path: &Path,
        dest: &Path,
        cancel: &CancellationToken,
        on_progress: Option<ExtractProgress<'_>>,
    ) -> SyncResult<ExtractSummary> {
        let corrupt = |e: io::Error| SyncError::ExtractionFailed {
            path: archive_path.to_path_buf(),
            reason: e.to_string(),
        };

        // Counting pass: gzip streams do not announce an entry count.
        let total = tar_reader(archive_path)?
            .entries()
            .map_err(corrupt)?
            .try_fold(0usize, |n, entry| entry.map(|_| n + 1))
            .map_err(corrupt)?;

        let mut archive = tar_reader(archive_path)?;
        let mut summary = ExtractSummary::default();

        for (i, entry) in archive.entries().map_err(corrupt)?.enumerate() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let mut entry = entry.map_err(corrupt)?;
            let raw = entry.path().map_err(corrupt)?.into_owned();
            let target = sanitize(&raw).and_then(|p| self.relative_target(&p));
            let kind = entry.header().entry_type();

            match target {
                Some(relative) if kind == EntryType::Directory => {
                    create_dir(&dest.join(relative))?;
                }
                Some(relative) if kind.is_file() => {
                    let out = dest.join(relative);
                    if let Some(parent) = out.parent() {
                        create_dir(parent)?;
                    }
                    entry.unpack(&out).map_err(corrupt)?;
                    summary.bytes += entry.size();
                    summary.files += 1;
                }
                _ => debug!(entry = %raw.display(), ?kind, "Skipping archive entry"),
            }

            summary.entries += 1;
            if let Some(cb) = on_progress {
                cb(i + 1, total);
            }
        }

        Ok(summary)
    }

    /// Path of an entry relative to the destination, after root stripping.
    ///
    /// Returns `None` for the stripped root folder itself.
    pub fn relative_target(&self, path: &Path) -> Option<PathBuf> {
        let mut components = path.components();
        let first = components.next()?;
        let is_root = match first {
            Component::Normal(name) => self
                .strip_roots
                .iter()
                .any(|root| name.to_str() == Some(root.as_str())),
            _ => false,
        };

        let rest: PathBuf = if is_root {
            components.collect()
        } else {
            path.to_path_buf()
        };

        if rest.as_os_str().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Normalise an archive entry path, rejecting anything that could escape the
/// destination.
pub fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn open_archive(path: &Path) -> SyncResult<File> {
    File::open(path).map_err(|e| SyncError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

fn tar_reader(path: &Path) -> SyncResult<Archive<GzDecoder<BufReader<File>>>> {
    let file = open_archive(path)?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn create_dir(path: &Path) -> SyncResult<()> {
    fs::create_dir_all(path).map_err(|e| SyncError::CreateDirFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_entry(reader: &mut impl io::Read, out: &Path, archive_path: &Path) -> SyncResult<u64> {
    if let Some(parent) = out.parent() {
        create_dir(parent)?;
    }
    let mut file = File::create(out).map_err(|e| SyncError::WriteFailed {
        path: out.to_path_buf(),
        source: e,
    })?;
    io::copy(reader, &mut file).map_err(|e| SyncError::ExtractionFailed {
        path: archive_path.to_path_buf(),
        reason: format!("{}: {}", out.display(), e),
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> SyncResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| SyncError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}
