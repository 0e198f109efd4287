#![forbid(unsafe_code)]

//! Fetcher for the third-party aggregator, which answers one call with the
//! whole nested comment tree of a video.
//!
//! The aggregator authenticates a video lookup with the owning channel id
//! (the `token` query parameter), so every request needs the channel id the
//! source identifier extracted from the URL.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use super::{CommentSource, FetchOptions, HttpGet, MetadataOrigin, VideoMetadata, map_http_error};
use crate::error::{ImportError, Result};
use crate::normalize::{
    AUTHOR_ID, COMMENTS, PUBLISHED_AT, RawCommentPayload, TEXT, VIDEO_ID, FieldAliases,
    normalize_aggregator, parse_timestamp,
};
use crate::source::{Provider, SourceRef};

pub const DEFAULT_AGGREGATOR_BASE_URL: &str = "https://aggregator.example/api";

const TITLE: FieldAliases = FieldAliases(&["title", "videoTitle", "video_title"]);
const CHANNEL_NAME: FieldAliases = FieldAliases(&["channelName", "channel_name", "channelTitle"]);
const CHANNEL_ID: FieldAliases = FieldAliases(&["channelId", "channel_id"]);

pub struct AggregatorFetcher {
    http: Arc<dyn HttpGet>,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl AggregatorFetcher {
    pub fn new(http: Arc<dyn HttpGet>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Downloads the tree and checks its structural shape.
    fn fetch_tree(&self, source: &SourceRef) -> Result<Value> {
        let token = source
            .channel_id
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ImportError::MalformedSource(format!(
                    "aggregator lookup for {} needs a channel token",
                    source.video_id
                ))
            })?;

        let mut query = vec![
            ("videoId", source.video_id.clone()),
            ("token", token.to_owned()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("key", key.clone()));
        }
        let url = format!("{}/comments", self.base_url);
        let tree = self
            .http
            .get_json(&url, &query, self.timeout)
            .map_err(|err| map_http_error(Provider::Aggregator, &source.video_id, err))?;
        validate_shape(&tree)?;
        Ok(tree)
    }
}

/// The payload must name its video, and the first comment (if any) must carry
/// an author id and text under one of the accepted aliases.
pub fn validate_shape(tree: &Value) -> Result<()> {
    let root = tree.as_object().ok_or_else(|| {
        ImportError::malformed(Provider::Aggregator, "payload is not a JSON object")
    })?;
    if VIDEO_ID.string(root).is_none_or(|id| id.is_empty()) {
        return Err(ImportError::malformed(Provider::Aggregator, "missing video id"));
    }

    let Some(comments) = COMMENTS.lookup(root) else {
        return Ok(());
    };
    let comments = comments.as_object().ok_or_else(|| {
        ImportError::malformed(Provider::Aggregator, "`comments` is not an object")
    })?;
    let Some((key, first)) = comments.iter().next() else {
        return Ok(());
    };
    let first = first.as_object().ok_or_else(|| {
        ImportError::malformed(Provider::Aggregator, format!("comment {key} is not an object"))
    })?;
    if !has_alias(first, AUTHOR_ID) || !has_alias(first, TEXT) {
        return Err(ImportError::malformed(
            Provider::Aggregator,
            format!("comment {key} lacks a recognizable author id or text field"),
        ));
    }
    Ok(())
}

fn has_alias(object: &Map<String, Value>, aliases: FieldAliases) -> bool {
    aliases.lookup(object).is_some()
}

impl CommentSource for AggregatorFetcher {
    fn provider(&self) -> Provider {
        Provider::Aggregator
    }

    /// Metadata is scraped off the same tree; there is no separate endpoint.
    fn fetch_metadata(&self, source: &SourceRef) -> Result<VideoMetadata> {
        let tree = self.fetch_tree(source)?;
        let batch = normalize_aggregator(&tree)?;
        let root = tree.as_object().ok_or_else(|| {
            ImportError::malformed(Provider::Aggregator, "payload is not a JSON object")
        })?;

        debug!(
            video_id = %source.video_id,
            comments = batch.comments.len(),
            "scraped aggregator metadata"
        );
        Ok(VideoMetadata {
            video_id: source.video_id.clone(),
            title: TITLE.string(root).unwrap_or_default(),
            // the token is the channel id and is what later lookups must send
            channel_id: source
                .channel_id
                .clone()
                .or_else(|| CHANNEL_ID.string(root).filter(|id| !id.is_empty())),
            channel_name: CHANNEL_NAME.string(root),
            published_at: PUBLISHED_AT.lookup(root).and_then(parse_timestamp),
            comment_count: Some(batch.comments.len() as u64),
            origin: MetadataOrigin::Scraped,
        })
    }

    /// The tree itself is the total; a separate metadata call would download it twice.
    fn reports_comment_total(&self) -> bool {
        false
    }

    /// The aggregator has no paging or time filter; the window and cap are
    /// applied after normalization by the caller.
    fn fetch_comments(
        &self,
        source: &SourceRef,
        _options: &FetchOptions,
    ) -> Result<RawCommentPayload> {
        self.fetch_tree(source).map(RawCommentPayload::Aggregator)
    }
}
