#![forbid(unsafe_code)]

//! Classifies user-supplied URLs or ids into one of the two comment providers.
//!
//! Everything here is a pure string operation: no network access and the same
//! input always yields the same [`SourceRef`].

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ImportError, Result};

/// Host fragment that marks an aggregator (Provider B) URL unless configured otherwise.
pub const DEFAULT_AGGREGATOR_MARKER: &str = "aggregator.example";

static BARE_VIDEO_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid bare id regex"));

static OFFICIAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // watch?v= on any host, including m. and music. subdomains
        r"/watch\?(?:[^#]*&)?v=([A-Za-z0-9_-]{11})(?:[&#]|$)",
        // short links
        r"youtu\.be/([A-Za-z0-9_-]{11})(?:[?&#/]|$)",
        r"/shorts/([A-Za-z0-9_-]{11})(?:[?&#/]|$)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid official url regex"))
    .collect()
});

/// The two upstream comment providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Paginated official video/comment API.
    Official,
    /// Third-party aggregator returning a nested comment tree.
    Aggregator,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Official => "official",
            Self::Aggregator => "aggregator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "official" => Some(Self::Official),
            "aggregator" => Some(Self::Aggregator),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized `(provider, videoId, channelId?)` triple extracted from user input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub provider: Provider,
    pub video_id: String,
    /// Only known up front for aggregator URLs, where the `token` parameter is the channel id.
    pub channel_id: Option<String>,
}

/// Source classifier configured with the aggregator host marker.
#[derive(Debug, Clone)]
pub struct SourceIdentifier {
    aggregator_marker: String,
}

impl Default for SourceIdentifier {
    fn default() -> Self {
        Self::new(DEFAULT_AGGREGATOR_MARKER)
    }
}

impl SourceIdentifier {
    pub fn new(aggregator_marker: impl Into<String>) -> Self {
        Self {
            aggregator_marker: aggregator_marker.into().to_ascii_lowercase(),
        }
    }

    /// Builds an identifier whose marker is the host of the aggregator base URL.
    pub fn for_aggregator_base(base_url: &str) -> Self {
        Url::parse(base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .map(Self::new)
            .unwrap_or_default()
    }

    pub fn identify(&self, input: &str) -> Result<SourceRef> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ImportError::InvalidSource("empty source".into()));
        }

        if let Some(url) = self.aggregator_url(trimmed) {
            return parse_aggregator_url(trimmed, &url);
        }

        if BARE_VIDEO_ID.is_match(trimmed) {
            return Ok(SourceRef {
                provider: Provider::Official,
                video_id: trimmed.to_owned(),
                channel_id: None,
            });
        }

        OFFICIAL_PATTERNS
            .iter()
            .find_map(|pattern| pattern.captures(trimmed))
            .and_then(|captures| captures.get(1))
            .map(|id| SourceRef {
                provider: Provider::Official,
                video_id: id.as_str().to_owned(),
                channel_id: None,
            })
            .ok_or_else(|| ImportError::InvalidSource(format!("unrecognized source: {trimmed}")))
    }
}

impl SourceIdentifier {
    /// Parses `input` as a URL on the aggregator host or one of its subdomains.
    fn aggregator_url(&self, input: &str) -> Option<Url> {
        let url = Url::parse(&with_scheme(input)).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        let on_marker = host == self.aggregator_marker
            || host
                .strip_suffix(self.aggregator_marker.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'));
        on_marker.then_some(url)
    }
}

fn with_scheme(input: &str) -> String {
    if input.contains("://") {
        input.to_owned()
    } else {
        format!("https://{input}")
    }
}

/// Classifies `input` with the default aggregator marker.
pub fn identify(input: &str) -> Result<SourceRef> {
    SourceIdentifier::default().identify(input)
}

fn parse_aggregator_url(input: &str, url: &Url) -> Result<SourceRef> {
    let mut video_id = None;
    let mut token = None;
    for (key, value) in url.query_pairs() {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.as_ref() {
            "videoId" | "video_id" => video_id = Some(value.to_owned()),
            "token" => token = Some(value.to_owned()),
            _ => {}
        }
    }

    match (video_id, token) {
        (Some(video_id), Some(token)) => Ok(SourceRef {
            provider: Provider::Aggregator,
            video_id,
            channel_id: Some(token),
        }),
        (None, _) => Err(ImportError::MalformedSource(format!(
            "aggregator url is missing videoId: {input}"
        ))),
        (_, None) => Err(ImportError::MalformedSource(format!(
            "aggregator url is missing token: {input}"
        ))),
    }
}
