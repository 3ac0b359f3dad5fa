//! HTTP content source with bounded redirect following and Range resume.

use futures::TryStreamExt;
use reqwest::header::{LOCATION, RANGE};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use super::source::{ContentSource, SourceBody};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// HTTP-based content source.
///
/// Redirects are followed by an explicit loop capped at `max_redirects`, so a
/// redirect cycle always terminates. The client has no overall timeout: stall
/// detection is the downloader's idle timeout.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    max_redirects: usize,
}

impl HttpSource {
    /// Create a source from the sync configuration.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("gamesync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_redirects: config.max_redirects,
        })
    }

    /// Maximum redirects followed per request.
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }
}

impl ContentSource for HttpSource {
    async fn open(&self, url: &str, offset: u64) -> SyncResult<SourceBody> {
        let failed = |reason: String| SyncError::DownloadFailed {
            path: url.to_string(),
            reason,
        };

        let mut current = Url::parse(url).map_err(|e| failed(format!("invalid URL: {}", e)))?;

        for hop in 0..=self.max_redirects {
            let mut request = self.client.get(current.clone());
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={}-", offset));
            }

            let response = request.send().await.map_err(|e| failed(e.to_string()))?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| failed(format!("HTTP {} without a Location header", status)))?;
                let next = current
                    .join(location)
                    .map_err(|e| failed(format!("invalid redirect target {}: {}", location, e)))?;
                debug!(from = %current, to = %next, hop, "Following redirect");
                current = next;
                continue;
            }

            let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
            if !status.is_success() {
                return Err(failed(format!("HTTP {}", status)));
            }

            let content_length = response.content_length();
            let source_url = current.to_string();
            let stream = response.bytes_stream().map_err(move |e| SyncError::DownloadFailed {
                path: source_url.clone(),
                reason: format!("read error: {}", e),
            });

            return Ok(SourceBody {
                stream: Box::pin(stream),
                content_length,
                resumed,
            });
        }

        Err(SyncError::TooManyRedirects {
            url: url.to_string(),
            limit: self.max_redirects,
        })
    }
}
