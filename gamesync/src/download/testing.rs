//! In-memory content source used by the download tests.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::source::{ContentSource, SourceBody};
use crate::error::{SyncError, SyncResult};

/// Chunk size the mock splits bodies into.
const CHUNK: usize = 4;

/// What a single `open` call does. Consumed in order, one per call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Fail the open with this reason.
    Fail(String),
    /// Deliver this many bytes, then never yield again.
    StallAfter(usize),
    /// Deliver the body with its first byte flipped.
    Corrupt,
    /// Wait before answering.
    Delay(Duration),
}

/// A single recorded `open` call.
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub url: String,
    pub offset: u64,
    pub at: Instant,
}

#[derive(Debug, Default)]
pub struct MockSource {
    files: HashMap<String, Vec<u8>>,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    opens: Mutex<Vec<OpenRecord>>,
    no_range: bool,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, url: &str, data: Vec<u8>) -> Self {
        self.files.insert(url.to_string(), data);
        self
    }

    pub fn with_script(self, url: &str, scripts: Vec<Script>) -> Self {
        self.scripts
            .lock()
            .entry(url.to_string())
            .or_default()
            .extend(scripts);
        self
    }

    pub fn without_range_support(mut self) -> Self {
        self.no_range = true;
        self
    }

    pub fn open_count(&self, url: &str) -> usize {
        self.opens.lock().iter().filter(|r| r.url == url).count()
    }

    pub fn open_times(&self, url: &str) -> Vec<Instant> {
        self.opens
            .lock()
            .iter()
            .filter(|r| r.url == url)
            .map(|r| r.at)
            .collect()
    }

    pub fn offsets(&self, url: &str) -> Vec<u64> {
        self.opens
            .lock()
            .iter()
            .filter(|r| r.url == url)
            .map(|r| r.offset)
            .collect()
    }
}

impl ContentSource for MockSource {
    async fn open(&self, url: &str, offset: u64) -> SyncResult<SourceBody> {
        self.opens.lock().push(OpenRecord {
            url: url.to_string(),
            offset,
            at: Instant::now(),
        });
        let script = self.scripts.lock().get_mut(url).and_then(|q| q.pop_front());

        let failed = |reason: String| SyncError::DownloadFailed {
            path: url.to_string(),
            reason,
        };

        let mut data = self
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| failed("HTTP 404 Not Found".to_string()))?;

        let mut stall_after = None;
        match script {
            Some(Script::Fail(reason)) => return Err(failed(reason)),
            Some(Script::StallAfter(n)) => stall_after = Some(n),
            Some(Script::Corrupt) => {
                if let Some(first) = data.first_mut() {
                    *first ^= 0xff;
                }
            }
            Some(Script::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let resumed = offset > 0 && !self.no_range;
        if resumed {
            let start = (offset as usize).min(data.len());
            data.drain(..start);
        }
        if let Some(n) = stall_after {
            data.truncate(n);
        }

        let content_length = Some(data.len() as u64);
        let chunks: Vec<SyncResult<Bytes>> = data
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let body = stream::iter(chunks);

        let stream = match stall_after {
            Some(_) => body.chain(stream::pending()).boxed(),
            None => body.boxed(),
        };

        Ok(SourceBody {
            stream,
            content_length,
            resumed,
        })
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
