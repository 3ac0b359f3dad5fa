//! Installation state: the marker file and required-file checks.
//!
//! The marker is a small JSON document (`{"version": ..., "installedAt": ...}`)
//! under the install root. It is only ever written after a cycle completed, and
//! always through a temporary file and a rename, so a crash leaves either the
//! old marker or the new one.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Version reported when nothing (readable) is installed.
pub const UNKNOWN_VERSION: &str = "0.0.0";

/// Persisted install metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationMarker {
    /// Content version last applied.
    #[serde(default = "unknown_version")]
    pub version: String,
    /// When the first successful install finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
}

fn unknown_version() -> String {
    UNKNOWN_VERSION.to_string()
}

/// Coarse install status for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    /// No marker.
    Absent,
    /// Marker present but required files are missing.
    Incomplete { missing: Vec<String> },
    /// Marker present and every required file located.
    Installed { version: String },
}

/// Reads and writes the installation state under one root.
#[derive(Debug, Clone)]
pub struct InstallationState {
    root: PathBuf,
    marker_name: String,
    required_files: Vec<String>,
    nested_roots: Vec<String>,
}

impl InstallationState {
    /// State for `root` with the given marker file name.
    pub fn new(root: impl Into<PathBuf>, marker_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            marker_name: marker_name.into(),
            required_files: Vec::new(),
            nested_roots: Vec::new(),
        }
    }

    /// State described by the sync configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(&config.install_root, &config.marker_name)
            .with_required_files(config.required_files.clone())
            .with_nested_roots(config.nested_roots.clone())
    }

    /// File names that must be present for the install to count.
    pub fn with_required_files(mut self, files: Vec<String>) -> Self {
        self.required_files = files;
        self
    }

    /// Subfolders searched for required files when they are not in the root.
    pub fn with_nested_roots(mut self, roots: Vec<String>) -> Self {
        self.nested_roots = roots;
        self
    }

    /// The install root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the marker file.
    pub fn marker_path(&self) -> PathBuf {
        self.root.join(&self.marker_name)
    }

    /// Whether the marker exists and every required file is locatable.
    pub fn is_installed(&self) -> bool {
        self.marker_path().is_file() && self.missing_required_files().is_empty()
    }

    /// Current status.
    pub fn status(&self) -> InstallStatus {
        match self.read_marker() {
            None => InstallStatus::Absent,
            Some(marker) => {
                let missing = self.missing_required_files();
                if missing.is_empty() {
                    InstallStatus::Installed {
                        version: marker.version,
                    }
                } else {
                    InstallStatus::Incomplete { missing }
                }
            }
        }
    }

    /// Where each required file was found: the root first, then each nested root.
    pub fn locate_required_files(&self) -> BTreeMap<String, PathBuf> {
        let mut found = BTreeMap::new();
        let search: Vec<PathBuf> = std::iter::once(self.root.clone())
            .chain(self.nested_roots.iter().map(|dir| self.root.join(dir)))
            .collect();

        for name in &self.required_files {
            if let Some(path) = search.iter().map(|dir| dir.join(name)).find(|p| p.is_file()) {
                found.insert(name.clone(), path);
            }
        }
        found
    }

    /// Required files that could not be located.
    pub fn missing_required_files(&self) -> Vec<String> {
        let found = self.locate_required_files();
        self.required_files
            .iter()
            .filter(|name| !found.contains_key(*name))
            .cloned()
            .collect()
    }

    /// The marker, or `None` when absent or unreadable.
    pub fn read_marker(&self) -> Option<InstallationMarker> {
        let path = self.marker_path();
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read installation marker");
                return None;
            }
        };

        match serde_json::from_slice(&body) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring malformed installation marker");
                None
            }
        }
    }

    /// Installed version, `0.0.0` when absent or unreadable.
    pub fn read_version(&self) -> String {
        self.read_marker()
            .map(|m| m.version)
            .unwrap_or_else(unknown_version)
    }

    /// Record `version` as installed, keeping the original install time.
    pub fn write_marker(&self, version: &str) -> SyncResult<InstallationMarker> {
        let path = self.marker_path();
        let failed = |reason: String| SyncError::MarkerFailed {
            path: path.clone(),
            reason,
        };

        let installed_at = self
            .read_marker()
            .and_then(|m| m.installed_at)
            .unwrap_or_else(Utc::now);
        let marker = InstallationMarker {
            version: version.to_string(),
            installed_at: Some(installed_at),
        };

        fs::create_dir_all(&self.root).map_err(|e| SyncError::CreateDirFailed {
            path: self.root.clone(),
            source: e,
        })?;

        let body = serde_json::to_vec_pretty(&marker).map_err(|e| failed(e.to_string()))?;
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp = path.with_file_name(temp_name);

        fs::write(&temp, &body).map_err(|e| failed(e.to_string()))?;
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(failed(e.to_string()));
        }

        info!(version = %marker.version, "Installation marker written");
        Ok(marker)
    }

    /// Remove the whole install tree, marker included.
    pub fn erase_installation(&self) -> SyncResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                info!(root = %self.root.display(), "Installation erased");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(root = %self.root.display(), "Nothing to erase");
                Ok(())
            }
            Err(e) => Err(SyncError::WriteFailed {
                path: self.root.clone(),
                source: e,
            }),
        }
    }
}

/// Whether `remote` is a newer version than `local`.
///
/// Uses semantic versioning when both parse; otherwise compares dot-separated
/// numeric components, treating missing or non-numeric parts as zero.
pub fn is_newer(remote: &str, local: &str) -> bool {
    if let (Ok(r), Ok(l)) = (
        semver::Version::parse(remote.trim()),
        semver::Version::parse(local.trim()),
    ) {
        return r > l;
    }

    let r = numeric_parts(remote);
    let l = numeric_parts(local);
    for i in 0..r.len().max(l.len()) {
        let a = r.get(i).copied().unwrap_or(0);
        let b = l.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    false
}

fn numeric_parts(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches(['v', 'V'])
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}
