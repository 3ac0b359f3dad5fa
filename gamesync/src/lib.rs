//! gamesync - Manifest-driven game content synchronisation
//!
//! This library keeps a local game installation in step with a remote
//! manifest of `(path, size, sha256)` entries. It diffs the local tree,
//! downloads what is missing or different with a bounded worker pool,
//! verifies every file before it becomes visible, and records the applied
//! version in a marker file. A bulk archive install covers the first run.
//!
//! # Example
//!
//! ```ignore
//! use gamesync::{EventSink, SyncConfig, SyncEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = SyncConfig::new(
//!     "/games/city",
//!     "https://cdn.example.com/manifest.json",
//!     "https://cdn.example.com/files/",
//! );
//! let engine = SyncEngine::new(config)?;
//! let (events, mut rx) = EventSink::channel();
//! let outcome = engine.sync(&CancellationToken::new(), &events).await?;
//! ```

pub mod checksum;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod extractor;
pub mod inspector;
pub mod install;
pub mod logging;
pub mod manifest;
pub mod space;
pub mod walk;

pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncOutcome, UpdateCheck};
pub use error::{SyncError, SyncResult};
pub use events::{EventSink, ProgressEvent, Stage, SyncEvent};
pub use install::{InstallStatus, InstallationState};
pub use manifest::{Manifest, ManifestEntry};
