//! Remote manifest: the expected file set for one content version.
//!
//! The manifest is fetched fresh for every sync cycle and never persisted;
//! only the version it carries ends up in the installation marker.
//!
//! ```text
//! { "version": "1.2.3",
//!   "files": [ { "path": "models/car.dff", "size": 483920, "hash": "<sha256>" } ] }
//! ```

use std::collections::HashSet;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::download::TEMP_SUFFIX;
use crate::error::{SyncError, SyncResult};

/// Length of a hex-encoded SHA-256 digest.
const SHA256_HEX_LEN: usize = 64;

/// One expected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relative path, forward-slash separated, unique within the manifest.
    pub path: String,
    /// Expected length in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the expected content.
    pub hash: String,
}

impl ManifestEntry {
    /// Create an entry, normalising the path and hash.
    pub fn new(path: &str, size: u64, hash: &str) -> SyncResult<Self> {
        let entry = Self {
            path: normalize_path(path)?,
            size,
            hash: hash.trim().to_ascii_lowercase(),
        };
        if entry.path.ends_with(TEMP_SUFFIX) {
            return Err(SyncError::InvalidManifest(format!(
                "path {} uses the reserved {} suffix",
                entry.path, TEMP_SUFFIX
            )));
        }
        if entry.hash.len() != SHA256_HEX_LEN || !entry.hash.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(SyncError::InvalidManifest(format!(
                "hash for {} is not a SHA-256 hex digest",
                entry.path
            )));
        }
        Ok(entry)
    }
}

/// The remote descriptor of the expected file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Content version, if the publisher tags one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Expected files, in publisher order.
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest from already-validated entries.
    pub fn new(version: Option<String>, files: Vec<ManifestEntry>) -> SyncResult<Self> {
        let manifest = Self { version, files };
        manifest.check_unique()?;
        manifest.checked_total()?;
        Ok(manifest)
    }

    /// Parse and validate a manifest from JSON bytes.
    ///
    /// A body without a `files` array, an unsafe path, a malformed hash or a
    /// duplicated path all make the manifest invalid.
    pub fn from_slice(body: &[u8]) -> SyncResult<Self> {
        let raw: Manifest =
            serde_json::from_slice(body).map_err(|e| SyncError::InvalidManifest(e.to_string()))?;

        let files = raw
            .files
            .iter()
            .map(|f| ManifestEntry::new(&f.path, f.size, &f.hash))
            .collect::<SyncResult<Vec<_>>>()?;

        let version = raw
            .version
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self::new(version, files)
    }

    /// Sum of all entry sizes, saturating at `u64::MAX`.
    pub fn total_bytes(&self) -> u64 {
        self.files
            .iter()
            .fold(0u64, |total, f| total.saturating_add(f.size))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the manifest lists no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn checked_total(&self) -> SyncResult<u64> {
        self.files.iter().try_fold(0u64, |total, f| {
            total.checked_add(f.size).ok_or_else(|| {
                SyncError::InvalidManifest(format!(
                    "total size overflows at {} ({} bytes)",
                    f.path, f.size
                ))
            })
        })
    }

    fn check_unique(&self) -> SyncResult<()> {
        let mut seen = HashSet::with_capacity(self.files.len());
        for entry in &self.files {
            if !seen.insert(entry.path.as_str()) {
                return Err(SyncError::InvalidManifest(format!(
                    "duplicate path {}",
                    entry.path
                )));
            }
        }
        Ok(())
    }
}

/// Normalise a manifest path into a safe forward-slash relative path.
///
/// Backslashes become `/`, leading `./` and `/` are dropped, and empty or
/// `.` segments are skipped. Paths containing `..` or a drive colon are
/// rejected so no entry can escape the install root.
pub fn normalize_path(path: &str) -> SyncResult<String> {
    let unified = path.trim().replace('\\', "/");
    let mut parts = Vec::new();

    for segment in unified.split('/') {
        let segment = segment.trim();
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." {
            return Err(SyncError::InvalidPath(format!(
                "path traversal is not allowed: {}",
                path
            )));
        }
        if segment.contains(':') {
            return Err(SyncError::InvalidPath(format!(
                "absolute paths are not allowed: {}",
                path
            )));
        }
        parts.push(segment);
    }

    if parts.is_empty() {
        return Err(SyncError::InvalidPath(format!("empty path: {:?}", path)));
    }
    Ok(parts.join("/"))
}

/// Fetches the manifest over HTTP(S).
#[derive(Debug, Clone)]
pub struct ManifestFetcher {
    client: Client,
    timeout: Duration,
}

impl ManifestFetcher {
    /// Create a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    /// Request timeout in use.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch and parse the manifest at `url`.
    ///
    /// Any network error, non-2xx status, timeout or invalid body is reported
    /// as [`SyncError::ManifestUnavailable`]; callers must not assume the
    /// installation is up to date when this fails.
    pub async fn fetch(&self, url: &str) -> SyncResult<Manifest> {
        let unavailable = |reason: String| SyncError::ManifestUnavailable {
            url: url.to_string(),
            reason,
        };

        debug!(url, "Fetching manifest");
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                unavailable(format!("timed out after {}ms", self.timeout.as_millis()))
            } else {
                unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("HTTP {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| unavailable(format!("failed to read body: {}", e)))?;

        let manifest = Manifest::from_slice(&body).map_err(|e| unavailable(e.to_string()))?;
        info!(
            url,
            files = manifest.len(),
            bytes = manifest.total_bytes(),
            version = manifest.version.as_deref().unwrap_or("-"),
            "Manifest fetched"
        );
        Ok(manifest)
    }
}
