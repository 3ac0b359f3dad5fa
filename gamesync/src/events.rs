//! Events emitted to the UI collaborator.
//!
//! Events are fire-and-forget: a closed or absent receiver never affects the
//! sync outcome. A sync or install ends with exactly one terminal event
//! ([`SyncEvent::Complete`] or [`SyncEvent::Error`]); an update check ends
//! with `UpdateAvailable`, `UpToDate` or `Error`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Phase of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Fetching the manifest.
    FetchingManifest,
    /// Comparing local files against the manifest.
    Inspecting,
    /// Downloading the work set or the bulk archive.
    Downloading,
    /// Unpacking the bulk archive.
    Extracting,
    /// Post-download verification.
    Verifying,
    /// Done.
    Complete,
}

impl Stage {
    /// Human-readable name of the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FetchingManifest => "Fetching manifest",
            Self::Inspecting => "Inspecting",
            Self::Downloading => "Downloading",
            Self::Extracting => "Extracting",
            Self::Verifying => "Verifying",
            Self::Complete => "Complete",
        }
    }
}

/// A progress update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Current stage.
    pub stage: Stage,
    /// 0-100.
    pub percent: u8,
    /// Human-readable status line.
    pub message: String,
    /// Bytes transferred so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    /// Bytes expected in total.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Transfer rate in bytes per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u64>,
}

impl ProgressEvent {
    /// A progress event without byte counters.
    pub fn new(stage: Stage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            message: message.into(),
            current: None,
            total: None,
            speed: None,
        }
    }

    /// Attach byte counters.
    pub fn with_bytes(mut self, current: u64, total: u64, speed: Option<u64>) -> Self {
        self.current = Some(current);
        self.total = Some(total);
        self.speed = speed;
        self
    }
}

/// Everything the engine reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// Progress within the current operation.
    Progress(ProgressEvent),
    /// The diff found files to download.
    UpdateAvailable { files: usize, total_bytes: u64 },
    /// The diff found nothing to do.
    UpToDate,
    /// The operation finished and every work-set file is verified present.
    #[serde(rename = "download-complete")]
    Complete,
    /// The operation failed; the message is suitable for the user.
    #[serde(rename = "download-error")]
    Error { message: String },
}

impl SyncEvent {
    /// Whether this event ends an operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error { .. })
    }
}

/// Sending half handed to the engine.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<SyncEvent>>,
    floor: Option<Arc<AtomicU8>>,
}

impl EventSink {
    /// A sink that drops every event.
    pub fn none() -> Self {
        Self::default()
    }

    /// A sink paired with its receiver.
    pub fn channel() -> (Self, UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = unbounded_channel();
        let sink = Self {
            tx: Some(tx),
            floor: None,
        };
        (sink, rx)
    }

    /// A sink for one operation: progress percent never drops below the
    /// highest percent already sent through it or its clones.
    pub fn monotonic(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            floor: Some(Arc::new(AtomicU8::new(0))),
        }
    }

    /// Emit an event, ignoring a gone receiver.
    pub fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Emit a progress event.
    pub fn progress(&self, mut event: ProgressEvent) {
        if let Some(floor) = &self.floor {
            let highest = floor.fetch_max(event.percent, Ordering::SeqCst);
            event.percent = event.percent.max(highest);
        }
        self.emit(SyncEvent::Progress(event));
    }
}

/// Scale a `done / total` ratio into a 0-100 percent. An empty total is 100.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

/// Map a 0-100 percent into the `[start, end]` band of a larger operation.
pub fn scale_percent(percent: u8, start: u8, end: u8) -> u8 {
    let span = end.saturating_sub(start) as u16;
    (start as u16 + span * percent.min(100) as u16 / 100) as u8
}

/// Human-readable byte count (`1.50 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
