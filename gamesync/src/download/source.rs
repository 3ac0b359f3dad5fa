//! Content source abstraction for testability.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;

use crate::error::SyncResult;

/// A stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = SyncResult<Bytes>> + Send>>;

/// An opened response body.
pub struct SourceBody {
    /// Body chunks.
    pub stream: ByteStream,
    /// Length of the remaining body, when announced.
    pub content_length: Option<u64>,
    /// Whether the body starts at the requested offset rather than at zero.
    pub resumed: bool,
}

impl std::fmt::Debug for SourceBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBody")
            .field("content_length", &self.content_length)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

/// Where file content comes from.
///
/// This abstraction lets the download pipeline run against an in-memory
/// source in tests and against [`super::HttpSource`] in production.
pub trait ContentSource: Send + Sync + 'static {
    /// Open `url`, asking for the body from byte `offset` onward.
    ///
    /// Sources that cannot honour the offset return the whole body with
    /// `resumed = false`.
    fn open(&self, url: &str, offset: u64) -> impl Future<Output = SyncResult<SourceBody>> + Send;
}
