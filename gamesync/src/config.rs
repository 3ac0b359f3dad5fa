//! Configuration for the sync engine.
//!
//! [`SyncConfig`] is an immutable value built once (in code or from an INI
//! file) and shared as `Arc<SyncConfig>` by every component. Nothing in the
//! crate reads endpoints or paths from global state.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use reqwest::Url;

use crate::error::{SyncError, SyncResult};

/// INI section holding the sync settings.
pub const CONFIG_SECTION: &str = "sync";

/// Default name of the installation marker file.
pub const DEFAULT_MARKER_NAME: &str = ".gamesync";

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root directory of the installation.
    pub install_root: PathBuf,

    /// Directory for bulk archive downloads.
    pub staging_dir: PathBuf,

    /// URL of the JSON manifest.
    pub manifest_url: String,

    /// Base URL that manifest paths are appended to.
    pub content_base_url: String,

    /// URL of the bulk distribution archive, if first installs use one.
    pub archive_url: Option<String>,

    /// Total timeout for the manifest request.
    pub manifest_timeout: Duration,

    /// Connection timeout for file downloads.
    pub connect_timeout: Duration,

    /// Maximum gap between two received chunks before a transfer counts as stalled.
    pub idle_timeout: Duration,

    /// Maximum redirects followed per download request.
    pub max_redirects: usize,

    /// Number of download workers.
    pub max_concurrent_downloads: usize,

    /// Attempts per file, including the first.
    pub max_attempts: u32,

    /// Base of the linear backoff (`attempt * base`).
    pub retry_base_delay: Duration,

    /// How often download progress is sampled.
    pub progress_interval: Duration,

    /// Minimum window over which the transfer rate is recomputed.
    pub rate_window: Duration,

    /// Emit an inspection progress callback every N manifest entries.
    pub inspect_progress_every: usize,

    /// Files larger than this are compared by size only. `None` hashes everything.
    pub full_hash_limit: Option<u64>,

    /// Safety margin applied to required bytes, in percent (110 = 1.1x).
    pub space_margin_percent: u32,

    /// File name of the installation marker under `install_root`.
    pub marker_name: String,

    /// Files that must be present for the installation to count as installed.
    pub required_files: Vec<String>,

    /// Known top-level folder names that archives may nest content under.
    pub nested_roots: Vec<String>,

    /// Resume `.download` temporaries left behind by an interrupted process.
    pub resume_partial: bool,
}

impl SyncConfig {
    /// Create a configuration with default policy values.
    pub fn new(
        install_root: impl Into<PathBuf>,
        manifest_url: impl Into<String>,
        content_base_url: impl Into<String>,
    ) -> Self {
        Self {
            install_root: install_root.into(),
            staging_dir: default_staging_dir(),
            manifest_url: manifest_url.into(),
            content_base_url: content_base_url.into(),
            archive_url: None,
            manifest_timeout: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(30),
            max_redirects: 5,
            max_concurrent_downloads: 3,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(2000),
            progress_interval: Duration::from_millis(100),
            rate_window: Duration::from_millis(500),
            inspect_progress_every: 50,
            full_hash_limit: None,
            space_margin_percent: 110,
            marker_name: DEFAULT_MARKER_NAME.to_string(),
            required_files: Vec::new(),
            nested_roots: Vec::new(),
            resume_partial: true,
        }
    }

    /// Set the staging directory.
    pub fn with_staging_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.staging_dir = path.into();
        self
    }

    /// Set the bulk archive URL.
    pub fn with_archive_url(mut self, url: impl Into<String>) -> Self {
        self.archive_url = Some(url.into());
        self
    }

    /// Set the manifest request timeout.
    pub fn with_manifest_timeout(mut self, timeout: Duration) -> Self {
        self.manifest_timeout = timeout;
        self
    }

    /// Set the idle (stall) timeout for downloads.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum number of redirects per request.
    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Set the number of concurrent download workers.
    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_base_delay = base_delay;
        self
    }

    /// Set the progress sampling interval and rate window.
    pub fn with_progress_timing(mut self, interval: Duration, rate_window: Duration) -> Self {
        self.progress_interval = interval;
        self.rate_window = rate_window;
        self
    }

    /// Compare files above `limit` bytes by size only.
    pub fn with_full_hash_limit(mut self, limit: Option<u64>) -> Self {
        self.full_hash_limit = limit;
        self
    }

    /// Set the disk space safety margin in percent.
    pub fn with_space_margin_percent(mut self, percent: u32) -> Self {
        self.space_margin_percent = percent;
        self
    }

    /// Set the marker file name.
    pub fn with_marker_name(mut self, name: impl Into<String>) -> Self {
        self.marker_name = name.into();
        self
    }

    /// Set the files required for a valid installation.
    pub fn with_required_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Set the known nested root folder names.
    pub fn with_nested_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nested_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable resuming interrupted temporaries.
    pub fn with_resume_partial(mut self, resume: bool) -> Self {
        self.resume_partial = resume;
        self
    }

    /// Load a configuration from an INI file.
    pub fn from_ini_file(path: &Path) -> SyncResult<Self> {
        let ini = Ini::load_from_file(path).map_err(|e| {
            SyncError::InvalidConfig(format!("cannot load {}: {}", path.display(), e))
        })?;
        Self::from_ini(&ini)
    }

    /// Load a configuration from INI text.
    pub fn from_ini_str(text: &str) -> SyncResult<Self> {
        let ini = Ini::load_from_str(text)
            .map_err(|e| SyncError::InvalidConfig(format!("cannot parse config: {}", e)))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> SyncResult<Self> {
        let section = ini.section(Some(CONFIG_SECTION)).ok_or_else(|| {
            SyncError::InvalidConfig(format!("missing [{}] section", CONFIG_SECTION))
        })?;

        let mut config = Self::new(
            required(section, "install_root")?,
            required(section, "manifest_url")?,
            required(section, "content_base_url")?,
        );

        if let Some(dir) = section.get("staging_dir") {
            config.staging_dir = PathBuf::from(dir);
        }
        if let Some(url) = section.get("archive_url") {
            config.archive_url = Some(url.to_string());
        }
        if let Some(secs) = parsed::<u64>(section, "manifest_timeout_secs")? {
            config.manifest_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>(section, "connect_timeout_secs")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>(section, "idle_timeout_secs")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parsed(section, "max_redirects")? {
            config.max_redirects = max;
        }
        if let Some(max) = parsed(section, "max_concurrent_downloads")? {
            config.max_concurrent_downloads = max;
        }
        if let Some(max) = parsed(section, "max_attempts")? {
            config.max_attempts = max;
        }
        if let Some(ms) = parsed::<u64>(section, "retry_base_delay_ms")? {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed::<u64>(section, "progress_interval_ms")? {
            config.progress_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed::<u64>(section, "rate_window_ms")? {
            config.rate_window = Duration::from_millis(ms);
        }
        if let Some(every) = parsed(section, "inspect_progress_every")? {
            config.inspect_progress_every = every;
        }
        if let Some(limit) = parsed::<u64>(section, "full_hash_limit")? {
            // 0 disables the limit
            config.full_hash_limit = (limit > 0).then_some(limit);
        }
        if let Some(percent) = parsed(section, "space_margin_percent")? {
            config.space_margin_percent = percent;
        }
        if let Some(name) = section.get("marker_name") {
            config.marker_name = name.to_string();
        }
        if let Some(list) = section.get("required_files") {
            config.required_files = split_list(list);
        }
        if let Some(list) = section.get("nested_roots") {
            config.nested_roots = split_list(list);
        }
        if let Some(resume) = parsed(section, "resume_partial")? {
            config.resume_partial = resume;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(SyncError::InvalidConfig(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.space_margin_percent < 100 {
            return Err(SyncError::InvalidConfig(format!(
                "space_margin_percent must be >= 100, got {}",
                self.space_margin_percent
            )));
        }
        if self.marker_name.is_empty() || self.marker_name.contains(['/', '\\']) {
            return Err(SyncError::InvalidConfig(format!(
                "marker_name must be a plain file name, got {:?}",
                self.marker_name
            )));
        }
        for url in [&self.manifest_url, &self.content_base_url]
            .into_iter()
            .chain(self.archive_url.as_ref())
        {
            Url::parse(url)
                .map_err(|e| SyncError::InvalidConfig(format!("invalid URL {}: {}", url, e)))?;
        }
        Ok(())
    }

    /// Build the download URL for a manifest-relative path.
    ///
    /// Each path segment is percent-encoded and appended to
    /// `content_base_url`, whether or not the base ends in `/`.
    pub fn file_url(&self, relative_path: &str) -> SyncResult<String> {
        let mut url = Url::parse(&self.content_base_url).map_err(|e| {
            SyncError::InvalidConfig(format!(
                "invalid URL {}: {}",
                self.content_base_url, e
            ))
        })?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                SyncError::InvalidConfig(format!(
                    "content base URL cannot carry a path: {}",
                    self.content_base_url
                ))
            })?;
            segments.pop_if_empty();
            segments.extend(relative_path.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url.to_string())
    }

    /// Path of the installation marker file.
    pub fn marker_path(&self) -> PathBuf {
        self.install_root.join(&self.marker_name)
    }
}

fn default_staging_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("gamesync")
}

fn required(section: &Properties, key: &str) -> SyncResult<String> {
    section
        .get(key)
        .map(str::to_string)
        .ok_or_else(|| SyncError::InvalidConfig(format!("missing required key '{}'", key)))
}

fn parsed<T: FromStr>(section: &Properties, key: &str) -> SyncResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    section
        .get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                SyncError::InvalidConfig(format!("invalid value for '{}': {} ({})", key, raw, e))
            })
        })
        .transpose()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
