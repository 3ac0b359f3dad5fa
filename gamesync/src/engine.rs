//! Sync engine orchestrating the full update workflow.
//!
//! A sync cycle runs:
//! 1. Fetch the manifest
//! 2. Diff it against the install root
//! 3. Check disk space for the work set
//! 4. Download the work set with the worker pool
//! 5. Re-verify the downloaded files
//! 6. Update the installation marker
//!
//! The bulk first install downloads and extracts one archive, then runs the
//! same cycle to repair whatever the archive did not match.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::download::{
    download_with_retry, plan_tasks, ContentSource, DownloadReport, DownloadTask, FileDownloader,
    HttpSource, RetryPolicy, TransferCallback, TransferProgress, WorkerPool, TEMP_SUFFIX,
};
use crate::error::{SyncError, SyncResult};
use crate::events::{
    format_bytes, percent_of, scale_percent, EventSink, ProgressEvent, Stage, SyncEvent,
};
use crate::extractor::{ArchiveExtractor, ArchiveFormat};
use crate::inspector::{self, HashPolicy, WorkSet};
use crate::install::{is_newer, InstallStatus, InstallationState};
use crate::manifest::{Manifest, ManifestEntry, ManifestFetcher};
use crate::space::{DiskSpaceGuard, SpaceProbe};
use crate::walk::TreeWalk;

/// Result of a read-only update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    /// Files that would be downloaded.
    pub work_set: WorkSet,
    /// Version announced by the manifest.
    pub remote_version: Option<String>,
    /// Version recorded in the marker (`0.0.0` when absent).
    pub local_version: String,
    /// Whether the remote version is newer than the local one.
    pub version_newer: bool,
}

impl UpdateCheck {
    /// Whether a sync would download anything.
    pub fn needs_update(&self) -> bool {
        !self.work_set.is_empty()
    }
}

/// Result of a successful sync or install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Version recorded in the marker.
    pub version: String,
    /// Manifest entries checked.
    pub files_checked: usize,
    /// Files and bytes downloaded by the pool.
    pub downloaded: DownloadReport,
}

/// Slice of the 0-100 progress range owned by one phase.
#[derive(Debug, Clone, Copy)]
struct Band {
    start: u8,
    end: u8,
}

impl Band {
    const FULL: Band = Band { start: 0, end: 100 };

    fn at(&self, percent: u8) -> u8 {
        scale_percent(percent, self.start, self.end)
    }

    fn sub(&self, from: u8, to: u8) -> Band {
        Band {
            start: self.at(from),
            end: self.at(to),
        }
    }
}

/// Marks a cycle as running until dropped.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The sync engine.
///
/// One engine owns one install root. At most one sync, install or reset runs
/// at a time; a second call fails with [`SyncError::CycleInProgress`].
pub struct SyncEngine<S: ContentSource = HttpSource> {
    config: Arc<SyncConfig>,
    source: Arc<S>,
    fetcher: ManifestFetcher,
    state: InstallationState,
    space: DiskSpaceGuard,
    running: AtomicBool,
}

impl SyncEngine<HttpSource> {
    /// Create an engine downloading over HTTP.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let source = HttpSource::new(&config)?;
        Self::with_source(config, Arc::new(source))
    }
}

impl<S: ContentSource> SyncEngine<S> {
    /// Create an engine with a custom content source.
    pub fn with_source(config: SyncConfig, source: Arc<S>) -> SyncResult<Self> {
        config.validate()?;
        let fetcher = ManifestFetcher::new(config.manifest_timeout)?;
        let state = InstallationState::from_config(&config);
        let space = DiskSpaceGuard::new(config.space_margin_percent);

        Ok(Self {
            config: Arc::new(config),
            source,
            fetcher,
            state,
            space,
            running: AtomicBool::new(false),
        })
    }

    /// Query free disk space through `probe` instead of the filesystem.
    pub fn with_space_probe(mut self, probe: SpaceProbe) -> Self {
        self.space = self.space.with_probe(probe);
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The installation state under the install root.
    pub fn installation(&self) -> &InstallationState {
        &self.state
    }

    /// Whether a sync, install or reset is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the marker exists and every required file is present.
    pub fn is_installed(&self) -> bool {
        self.state.is_installed()
    }

    /// Installed version, `0.0.0` when nothing is installed.
    pub fn installed_version(&self) -> String {
        self.state.read_version()
    }

    /// Current install status.
    pub fn status(&self) -> InstallStatus {
        self.state.status()
    }

    /// Total size of the install tree, ignoring in-flight temporaries.
    pub async fn installed_size(&self) -> SyncResult<u64> {
        let root = self.config.install_root.clone();
        run_blocking(move || Ok(TreeWalk::new(root).skipping_suffix(TEMP_SUFFIX).total_size())).await
    }

    /// Fetch the manifest and report what a sync would do. Read-only.
    pub async fn check_for_update(
        &self,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> SyncResult<UpdateCheck> {
        let events = &events.monotonic();
        let result = async {
            let manifest = self.fetch_manifest(cancel, events, Band::FULL).await?;
            let work_set = self.diff(&manifest, events, Band::FULL.sub(10, 100)).await?;
            let local_version = self.state.read_version();
            let version_newer = manifest
                .version
                .as_deref()
                .is_some_and(|remote| is_newer(remote, &local_version));

            Ok::<_, SyncError>(UpdateCheck {
                work_set,
                remote_version: manifest.version,
                local_version,
                version_newer,
            })
        }
        .await;

        match &result {
            Ok(check) if check.needs_update() => events.emit(SyncEvent::UpdateAvailable {
                files: check.work_set.len(),
                total_bytes: check.work_set.total_bytes,
            }),
            Ok(_) => events.emit(SyncEvent::UpToDate),
            Err(e) => events.emit(SyncEvent::Error {
                message: e.to_string(),
            }),
        }
        result
    }

    /// Run a full sync cycle against the remote manifest.
    pub async fn sync(&self, cancel: &CancellationToken, events: &EventSink) -> SyncResult<SyncOutcome> {
        let events = &events.monotonic();
        let result = async {
            let _cycle = self.begin()?;
            let manifest = self.fetch_manifest(cancel, events, Band::FULL).await?;
            self.run_sync(&manifest, cancel, events, Band::FULL.sub(5, 100)).await
        }
        .await;
        finish(result, events)
    }

    /// Run a sync cycle against an already available manifest.
    pub async fn sync_with_manifest(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> SyncResult<SyncOutcome> {
        let events = &events.monotonic();
        let result = async {
            let _cycle = self.begin()?;
            self.run_sync(manifest, cancel, events, Band::FULL).await
        }
        .await;
        finish(result, events)
    }

    /// First install from the bulk archive, followed by a repair sync.
    pub async fn install_from_archive(
        &self,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> SyncResult<SyncOutcome> {
        let events = &events.monotonic();
        let result = async {
            let _cycle = self.begin()?;
            self.run_install(cancel, events).await
        }
        .await;
        finish(result, events)
    }

    /// Erase the installation. Refused while a cycle is running.
    pub async fn reset(&self) -> SyncResult<()> {
        let _cycle = self.begin()?;
        let state = self.state.clone();
        run_blocking(move || state.erase_installation()).await
    }

    fn begin(&self) -> SyncResult<CycleGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::CycleInProgress)?;
        Ok(CycleGuard(&self.running))
    }

    fn hash_policy(&self) -> HashPolicy {
        HashPolicy {
            full_hash_limit: self.config.full_hash_limit,
        }
    }

    async fn fetch_manifest(
        &self,
        cancel: &CancellationToken,
        events: &EventSink,
        band: Band,
    ) -> SyncResult<Manifest> {
        events.progress(ProgressEvent::new(
            Stage::FetchingManifest,
            band.at(0),
            "Fetching manifest",
        ));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            manifest = self.fetcher.fetch(&self.config.manifest_url) => manifest,
        }
    }

    async fn diff(&self, manifest: &Manifest, events: &EventSink, band: Band) -> SyncResult<WorkSet> {
        let manifest = manifest.clone();
        let root = self.config.install_root.clone();
        let policy = self.hash_policy();
        let every = self.config.inspect_progress_every;
        let sink = events.clone();

        events.progress(ProgressEvent::new(Stage::Inspecting, band.at(0), "Checking files"));
        run_blocking(move || {
            let on_progress = move |checked: usize, total: usize| {
                let percent = percent_of(checked as u64, total as u64);
                sink.progress(ProgressEvent::new(
                    Stage::Inspecting,
                    band.at(percent),
                    format!("Checking files ({}/{})", checked, total),
                ));
            };
            Ok(inspector::diff(&manifest, &root, policy, every, Some(&on_progress)))
        })
        .await
    }

    /// Diff, download, re-verify and record the manifest version.
    async fn run_sync(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
        events: &EventSink,
        band: Band,
    ) -> SyncResult<SyncOutcome> {
        let work_set = self.diff(manifest, events, band.sub(0, 10)).await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let downloaded = if work_set.is_empty() {
            events.emit(SyncEvent::UpToDate);
            DownloadReport::default()
        } else {
            events.emit(SyncEvent::UpdateAvailable {
                files: work_set.len(),
                total_bytes: work_set.total_bytes,
            });
            self.space
                .ensure_space(work_set.total_bytes, &self.config.install_root)?;

            let report = self
                .download_work_set(&work_set, cancel, events, band.sub(10, 90))
                .await?;
            self.verify(&work_set, events, band.sub(90, 100)).await?;
            report
        };

        let version = manifest
            .version
            .clone()
            .unwrap_or_else(|| self.state.read_version());
        self.state.write_marker(&version)?;

        events.progress(ProgressEvent::new(Stage::Complete, band.at(100), "Files up to date"));
        info!(
            version = %version,
            checked = manifest.len(),
            downloaded = downloaded.files,
            bytes = downloaded.bytes,
            "Sync complete"
        );

        Ok(SyncOutcome {
            version,
            files_checked: manifest.len(),
            downloaded,
        })
    }

    async fn download_work_set(
        &self,
        work_set: &WorkSet,
        cancel: &CancellationToken,
        events: &EventSink,
        band: Band,
    ) -> SyncResult<DownloadReport> {
        let tasks = plan_tasks(work_set, &self.config.install_root, |entry| {
            self.config.file_url(&entry.path)
        })?;
        let pool = WorkerPool::new(Arc::clone(&self.source), &self.config);

        let sink = events.clone();
        let on_progress: TransferCallback = Arc::new(move |p: &TransferProgress| {
            sink.progress(
                ProgressEvent::new(
                    Stage::Downloading,
                    band.at(p.percent()),
                    format!(
                        "Downloading files ({}/{}, {} of {})",
                        p.files_completed,
                        p.total_files,
                        format_bytes(p.bytes),
                        format_bytes(p.total_bytes)
                    ),
                )
                .with_bytes(p.bytes, p.total_bytes, Some(p.speed)),
            );
        });

        pool.download_all(tasks, cancel, Some(on_progress)).await
    }

    /// Re-check every downloaded entry against the manifest.
    async fn verify(&self, work_set: &WorkSet, events: &EventSink, band: Band) -> SyncResult<()> {
        events.progress(ProgressEvent::new(Stage::Verifying, band.at(0), "Verifying files"));

        let entries = work_set.entries.clone();
        let root = self.config.install_root.clone();
        let policy = self.hash_policy();
        let failed = run_blocking(move || Ok(unverified_paths(&entries, &root, policy))).await?;

        if !failed.is_empty() {
            error!(failed = failed.len(), "Files failed verification after download");
            return Err(SyncError::VerificationFailed { paths: failed });
        }
        Ok(())
    }

    async fn run_install(&self, cancel: &CancellationToken, events: &EventSink) -> SyncResult<SyncOutcome> {
        let archive_url = self
            .config
            .archive_url
            .clone()
            .ok_or_else(|| SyncError::InvalidConfig("no archive URL configured".to_string()))?;
        let format = archive_format(&archive_url)?;

        let manifest = self.fetch_manifest(cancel, events, Band::FULL).await?;
        self.space
            .ensure_space(manifest.total_bytes(), &self.config.install_root)?;

        let staged = self
            .config
            .staging_dir
            .join(format!("content.{}", format.extension()));
        info!(url = %archive_url, staged = %staged.display(), "Starting bulk install");

        let extracted = async {
            self.download_archive(&archive_url, &staged, cancel, events, Band { start: 0, end: 80 })
                .await?;
            self.extract_archive(&staged, cancel, events, Band { start: 80, end: 95 })
                .await
        }
        .await;
        remove_staged(&staged).await;
        extracted?;

        let outcome = self
            .run_sync(&manifest, cancel, events, Band { start: 95, end: 100 })
            .await?;

        let missing = self.state.missing_required_files();
        if !missing.is_empty() {
            error!(missing = ?missing, "Required files missing after install");
            return Err(SyncError::NotInstalled { missing });
        }

        info!(version = %outcome.version, "Bulk install complete");
        Ok(outcome)
    }

    async fn download_archive(
        &self,
        url: &str,
        staged: &Path,
        cancel: &CancellationToken,
        events: &EventSink,
        band: Band,
    ) -> SyncResult<u64> {
        let downloader = FileDownloader::new(Arc::clone(&self.source), self.config.idle_timeout)
            .with_resume(false);
        let mut task = DownloadTask::unverified("archive", url, staged.to_path_buf());

        let interval = self.config.progress_interval;
        let last_emit: Mutex<Option<Instant>> = Mutex::new(None);
        let on_bytes = |bytes: u64, total: Option<u64>| {
            let now = Instant::now();
            {
                let mut last = last_emit.lock();
                if last.is_some_and(|at| now.duration_since(at) < interval) {
                    return;
                }
                *last = Some(now);
            }

            let mut event = ProgressEvent::new(
                Stage::Downloading,
                band.at(total.map_or(0, |t| percent_of(bytes, t))),
                format!("Downloading game archive ({})", format_bytes(bytes)),
            );
            if let Some(total) = total {
                event = event.with_bytes(bytes, total, None);
            }
            events.progress(event);
        };

        events.progress(ProgressEvent::new(Stage::Downloading, band.at(0), "Downloading game archive"));
        download_with_retry(
            &downloader,
            &mut task,
            RetryPolicy::from_config(&self.config),
            cancel,
            &on_bytes,
        )
        .await
    }

    async fn extract_archive(
        &self,
        staged: &Path,
        cancel: &CancellationToken,
        events: &EventSink,
        band: Band,
    ) -> SyncResult<()> {
        events.progress(ProgressEvent::new(Stage::Extracting, band.at(0), "Extracting files"));

        let extractor = ArchiveExtractor::new(self.config.nested_roots.clone());
        let archive = staged.to_path_buf();
        let dest = self.config.install_root.clone();
        let cancel = cancel.clone();
        let sink = events.clone();
        let every = self.config.inspect_progress_every.max(1);

        run_blocking(move || {
            let on_progress = move |done: usize, total: usize| {
                if done % every == 0 || done == total {
                    sink.progress(ProgressEvent::new(
                        Stage::Extracting,
                        band.at(percent_of(done as u64, total as u64)),
                        format!("Extracting files ({}/{})", done, total),
                    ));
                }
            };
            extractor.extract(&archive, &dest, &cancel, Some(&on_progress))
        })
        .await?;
        Ok(())
    }
}

/// Paths of entries whose local copy still does not match.
fn unverified_paths(entries: &[ManifestEntry], root: &Path, policy: HashPolicy) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| inspector::classify(root, entry, policy).needs_fetch())
        .map(|entry| entry.path.clone())
        .collect()
}

fn archive_format(url: &str) -> SyncResult<ArchiveFormat> {
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    ArchiveFormat::detect(&path)
        .ok_or_else(|| SyncError::InvalidConfig(format!("unsupported archive type: {}", url)))
}

async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "Removed staged archive"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staged archive"),
    }
}

/// Emit the terminal event for an operation.
fn finish<T>(result: SyncResult<T>, events: &EventSink) -> SyncResult<T> {
    match &result {
        Ok(_) => events.emit(SyncEvent::Complete),
        Err(e) => {
            warn!(error = %e, "Operation failed");
            events.emit(SyncEvent::Error {
                message: e.to_string(),
            });
        }
    }
    result
}

/// Run blocking filesystem work off the async runtime.
async fn run_blocking<T, F>(f: F) -> SyncResult<T>
where
    F: FnOnce() -> SyncResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(SyncError::Cancelled),
    }
}
