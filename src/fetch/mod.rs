#![forbid(unsafe_code)]

//! Provider fetchers behind one contract.
//!
//! Both fetchers are blocking (they sit on `ureq`), so the pipeline drives them
//! through [`run_blocking`] to keep the async runtime free. Every transport or
//! status failure is folded into [`ImportError::SourceUnavailable`] here; no
//! raw HTTP error escapes this module.

pub mod aggregator;
pub mod official;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ImportError, Result};
use crate::normalize::RawCommentPayload;
use crate::source::{Provider, SourceRef};

pub use aggregator::AggregatorFetcher;
pub use official::OfficialApiFetcher;

/// Where a piece of video metadata came from. Scraped values are treated as
/// more authoritative than API values when refreshing an existing video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataOrigin {
    Api,
    Scraped,
}

impl MetadataOrigin {
    /// Aggregator pages are scraped; the official provider is an API.
    pub fn of(provider: Provider) -> Self {
        match provider {
            Provider::Official => Self::Api,
            Provider::Aggregator => Self::Scraped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Provider-reported comment total, when it offers one.
    pub comment_count: Option<u64>,
    pub origin: MetadataOrigin,
}

/// Admits comments published strictly after `after` or strictly before
/// `before`, i.e. everything outside an already stored `[before, after]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaWindow {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl DeltaWindow {
    /// Window outside the stored `[min, max]` published-at range.
    pub fn outside(min: DateTime<Utc>, max: DateTime<Utc>) -> Self {
        Self {
            after: Some(max),
            before: Some(min),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.after.is_none() && self.before.is_none()
    }

    /// Comments without a timestamp cannot be placed and only pass an unbounded window.
    pub fn admits(&self, published_at: Option<DateTime<Utc>>) -> bool {
        if self.is_unbounded() {
            return true;
        }
        let Some(at) = published_at else {
            return false;
        };
        self.after.is_some_and(|after| at > after) || self.before.is_some_and(|before| at < before)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub window: Option<DeltaWindow>,
    /// Stop once this many admitted comments were collected.
    pub max_results: Option<usize>,
}

impl FetchOptions {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn bounded(window: Option<DeltaWindow>, max_results: usize) -> Self {
        Self {
            window,
            max_results: Some(max_results),
        }
    }

    /// Upper edge of the stored window, when the fetch is after newer comments.
    pub(crate) fn newer_than(&self) -> Option<DateTime<Utc>> {
        self.window.and_then(|window| window.after)
    }

    pub(crate) fn admits(&self, published_at: Option<DateTime<Utc>>) -> bool {
        self.window.is_none_or(|window| window.admits(published_at))
    }
}

/// Common contract of the two provider fetchers.
pub trait CommentSource: Send + Sync {
    fn provider(&self) -> Provider;

    fn fetch_metadata(&self, source: &SourceRef) -> Result<VideoMetadata>;

    fn fetch_comments(&self, source: &SourceRef, options: &FetchOptions)
    -> Result<RawCommentPayload>;

    /// Whether `fetch_metadata` is a cheap way to learn the provider's comment total.
    fn reports_comment_total(&self) -> bool {
        true
    }
}

/// Picks the fetcher for a provider.
#[derive(Clone)]
pub struct SourceRegistry {
    official: Arc<dyn CommentSource>,
    aggregator: Arc<dyn CommentSource>,
}

impl SourceRegistry {
    pub fn new(official: Arc<dyn CommentSource>, aggregator: Arc<dyn CommentSource>) -> Self {
        Self {
            official,
            aggregator,
        }
    }

    pub fn for_provider(&self, provider: Provider) -> Arc<dyn CommentSource> {
        match provider {
            Provider::Official => self.official.clone(),
            Provider::Aggregator => self.aggregator.clone(),
        }
    }
}

/// Runs a blocking fetch on tokio's blocking pool.
pub async fn run_blocking<T, F>(provider: Provider, fetch: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(fetch)
        .await
        .map_err(|err| ImportError::unavailable(provider, format!("fetch task failed: {err}")))?
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    Status { code: u16, body: String },
    Transport(String),
    Decode(String),
}

/// Minimal outbound HTTP seam: GET a URL and decode the body as JSON.
pub trait HttpGet: Send + Sync {
    fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> std::result::Result<Value, HttpError>;
}

/// `ureq`-backed client shared by both fetchers.
pub struct UreqHttp {
    agent: ureq::Agent,
}

impl UreqHttp {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .user_agent(concat!("commentvault-tools/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Default for UreqHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpGet for UreqHttp {
    fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> std::result::Result<Value, HttpError> {
        let mut request = self.agent.get(url).timeout(timeout);
        for (key, value) in query {
            request = request.query(key, value);
        }
        match request.call() {
            Ok(response) => response
                .into_json::<Value>()
                .map_err(|err| HttpError::Decode(err.to_string())),
            Err(ureq::Error::Status(code, response)) => Err(HttpError::Status {
                code,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(transport)) => {
                Err(HttpError::Transport(transport.to_string()))
            }
        }
    }
}

/// Maps an HTTP failure into the pipeline taxonomy. A 404 means the video id
/// does not exist upstream; every other failure is transient from our side.
pub(crate) fn map_http_error(provider: Provider, video_id: &str, err: HttpError) -> ImportError {
    match err {
        HttpError::Status { code: 404, .. } => {
            ImportError::InvalidSource(format!("{provider} has no video {video_id}"))
        }
        HttpError::Status { code, body } => {
            let snippet: String = body.chars().take(200).collect();
            ImportError::unavailable(provider, format!("HTTP {code}: {snippet}"))
        }
        HttpError::Transport(reason) => ImportError::unavailable(provider, reason),
        HttpError::Decode(reason) => {
            ImportError::malformed(provider, format!("undecodable body: {reason}"))
        }
    }
}
