//! HTTP fetching for external calendar feeds.
//!
//! This module provides the low-level client used by the importer:
//! - bounded request timeout (a slow feed must not block sync forever)
//! - conditional GET via `If-None-Match` / `If-Modified-Since` so unchanged
//!   feeds are not re-downloaded

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{FeedError, FeedResult};

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The seam between the feed registry and the network.
///
/// [`FeedFetcher`] is the production implementation; tests substitute canned
/// responses.
pub trait FetchFeed: Send + Sync {
    /// Downloads a feed, honoring the conditional-fetch validators.
    fn fetch_feed<'a>(
        &'a self,
        url: &'a str,
        validators: &'a Validators,
    ) -> BoxFuture<'a, FeedResult<FetchOutcome>>;
}

/// Fetch configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Hard timeout for one feed download.
    pub timeout: Duration,
    /// User agent sent to feed servers.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("tourflow/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Cache validators remembered per feed between syncs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    /// ETag from the last successful fetch.
    pub etag: Option<String>,
    /// Last-Modified from the last successful fetch.
    pub last_modified: Option<String>,
}

impl Validators {
    /// Returns true if no validator is known yet.
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Result of one feed download.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The feed body, with refreshed validators.
    Fetched {
        /// Raw iCalendar content.
        body: String,
        /// Validators to send on the next conditional fetch.
        validators: Validators,
    },
    /// The server reported the feed unchanged (304).
    NotModified,
}

/// HTTP client for feed downloads.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: Client,
}

impl FeedFetcher {
    /// Creates a fetcher with the given configuration.
    pub fn new(config: FetchConfig) -> FeedResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| FeedError::internal("failed to create HTTP client").with_source(e))?;
        Ok(Self { client })
    }

    /// Downloads a feed, sending conditional headers when validators are known.
    pub async fn fetch(&self, url: &str, validators: &Validators) -> FeedResult<FetchOutcome> {
        let mut request = self.client.get(url);
        if let Some(ref etag) = validators.etag {
            request = request.header("If-None-Match", etag);
        }
        if let Some(ref last_modified) = validators.last_modified {
            request = request.header("If-Modified-Since", last_modified);
        }

        trace!(url = %url, conditional = !validators.is_empty(), "Fetching feed");

        let response = request
            .send()
            .await
            .map_err(|e| FeedError::fetch(format!("request failed: {}", e)).with_source(e))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!(url = %url, "Feed not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if status.is_server_error() {
            return Err(FeedError::server(format!("feed server returned {}", status)));
        }
        if !status.is_success() {
            return Err(FeedError::fetch(format!("feed server returned {}", status)));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let fresh = Validators {
            etag: header("etag"),
            last_modified: header("last-modified"),
        };

        let body = response
            .text()
            .await
            .map_err(|e| FeedError::fetch("failed to read feed body").with_source(e))?;

        debug!(url = %url, bytes = body.len(), "Fetched feed");
        Ok(FetchOutcome::Fetched {
            body,
            validators: fresh,
        })
    }
}

impl FetchFeed for FeedFetcher {
    fn fetch_feed<'a>(
        &'a self,
        url: &'a str,
        validators: &'a Validators,
    ) -> BoxFuture<'a, FeedResult<FetchOutcome>> {
        Box::pin(self.fetch(url, validators))
    }
}
