#![forbid(unsafe_code)]

//! Fetcher for the official, paginated video/comment API.
//!
//! Comment threads come 100 per page with up to 20 inline replies each. When a
//! thread reports more replies than it inlines, the full reply list is paged
//! separately by parent id. The API has no server-side "published after"
//! filter, so bounded fetches page in time order (newest first) and filter
//! client-side.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{CommentSource, FetchOptions, HttpGet, MetadataOrigin, VideoMetadata, map_http_error};
use crate::error::{ImportError, Result};
use crate::normalize::{OfficialComment, RawCommentPayload, parse_timestamp_str};
use crate::source::{Provider, SourceRef};

pub const DEFAULT_OFFICIAL_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
/// Replies the thread listing carries inline before a separate fetch is needed.
pub const INLINE_REPLY_CAP: usize = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    #[serde(default)]
    snippet: VideoSnippet,
    #[serde(default)]
    statistics: VideoStatistics,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: Option<String>,
    channel_id: Option<String>,
    channel_title: Option<String>,
    published_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    /// The API reports counts as decimal strings.
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadListResponse {
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<ThreadItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadItem {
    snippet: ThreadSnippet,
    #[serde(default)]
    replies: ThreadReplies,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadSnippet {
    top_level_comment: ApiComment,
    #[serde(default)]
    total_reply_count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ThreadReplies {
    #[serde(default)]
    comments: Vec<ApiComment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentListResponse {
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<ApiComment>,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    #[serde(default)]
    id: String,
    #[serde(default)]
    snippet: ApiCommentSnippet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCommentSnippet {
    author_display_name: Option<String>,
    author_channel_id: Option<AuthorChannelId>,
    text_original: Option<String>,
    text_display: Option<String>,
    like_count: Option<i64>,
    published_at: Option<String>,
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorChannelId {
    value: Option<String>,
}

impl ApiComment {
    fn into_official(self, parent_hint: Option<&str>) -> OfficialComment {
        let snippet = self.snippet;
        OfficialComment {
            id: self.id,
            parent_id: snippet
                .parent_id
                .or_else(|| parent_hint.map(str::to_owned)),
            author_channel_id: snippet.author_channel_id.and_then(|author| author.value),
            author_display_name: snippet.author_display_name,
            text: snippet.text_original.or(snippet.text_display),
            like_count: snippet.like_count,
            published_at: snippet.published_at,
        }
    }
}

/// Collects admitted comments until the cap is reached.
///
/// Time-ordered pages arrive newest first. Comments newer than the stored
/// window are therefore collected without a cap, so the caller can keep the
/// ones nearest to the window; the cap only applies once a top-level comment
/// at or before the window's upper edge shows up.
struct Collector<'a> {
    options: &'a FetchOptions,
    comments: Vec<OfficialComment>,
    collecting_newer: bool,
}

impl<'a> Collector<'a> {
    fn new(options: &'a FetchOptions) -> Self {
        Self {
            options,
            comments: Vec::new(),
            collecting_newer: options.newer_than().is_some(),
        }
    }

    fn is_full(&self) -> bool {
        !self.collecting_newer
            && self
                .options
                .max_results
                .is_some_and(|cap| self.comments.len() >= cap)
    }

    /// Ends the uncapped phase at the first top-level comment that is not
    /// newer than the stored window.
    fn observe_top_level(&mut self, published_at: Option<DateTime<Utc>>) {
        if !self.collecting_newer {
            return;
        }
        if let (Some(at), Some(after)) = (published_at, self.options.newer_than())
            && at <= after
        {
            self.collecting_newer = false;
            debug!(newer = self.comments.len(), "reached the stored window");
        }
    }

    fn offer(&mut self, comment: OfficialComment) {
        if self.is_full() {
            return;
        }
        let published_at = comment.published_at.as_deref().and_then(parse_timestamp_str);
        if self.options.admits(published_at) {
            self.comments.push(comment);
        }
    }
}

pub struct OfficialApiFetcher {
    http: Arc<dyn HttpGet>,
    base_url: String,
    api_key: Option<String>,
    page_size: u32,
    metadata_timeout: Duration,
    comments_timeout: Duration,
}

impl OfficialApiFetcher {
    pub fn new(http: Arc<dyn HttpGet>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
            page_size: MAX_PAGE_SIZE,
            metadata_timeout: Duration::from_secs(10),
            comments_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_timeouts(mut self, metadata: Duration, comments: Duration) -> Self {
        self.metadata_timeout = metadata;
        self.comments_timeout = comments;
        self
    }

    fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        video_id: &str,
        mut query: Vec<(&'static str, String)>,
        timeout: Duration,
    ) -> Result<T> {
        if let Some(key) = &self.api_key {
            query.push(("key", key.clone()));
        }
        let url = format!("{}/{endpoint}", self.base_url);
        let body = self
            .http
            .get_json(&url, &query, timeout)
            .map_err(|err| map_http_error(Provider::Official, video_id, err))?;
        serde_json::from_value(body).map_err(|err| {
            ImportError::malformed(Provider::Official, format!("{endpoint}: {err}"))
        })
    }

    /// Threads are always requested newest first; `Collector` relies on it.
    fn fetch_thread_page(
        &self,
        video_id: &str,
        page_token: Option<&str>,
    ) -> Result<ThreadListResponse> {
        let mut query = vec![
            ("part", "snippet,replies".to_owned()),
            ("videoId", video_id.to_owned()),
            ("maxResults", self.page_size.to_string()),
            ("order", "time".to_owned()),
            ("textFormat", "plainText".to_owned()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_owned()));
        }
        self.get("commentThreads", video_id, query, self.comments_timeout)
    }

    /// Pages through every reply of one thread, oldest API page first.
    fn fetch_all_replies(&self, video_id: &str, parent_id: &str) -> Result<Vec<ApiComment>> {
        let mut replies = Vec::new();
        let mut page_token: Option<String> = None;
        let mut seen_tokens = HashSet::new();
        loop {
            let mut query = vec![
                ("part", "snippet".to_owned()),
                ("parentId", parent_id.to_owned()),
                ("maxResults", self.page_size.to_string()),
                ("textFormat", "plainText".to_owned()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let page: CommentListResponse =
                self.get("comments", video_id, query, self.comments_timeout)?;
            replies.extend(page.items);
            match page.next_page_token {
                Some(token) if seen_tokens.insert(token.clone()) => page_token = Some(token),
                _ => break,
            }
        }
        Ok(replies)
    }
}

impl CommentSource for OfficialApiFetcher {
    fn provider(&self) -> Provider {
        Provider::Official
    }

    fn fetch_metadata(&self, source: &SourceRef) -> Result<VideoMetadata> {
        let query = vec![
            ("part", "snippet,statistics".to_owned()),
            ("id", source.video_id.clone()),
        ];
        let response: VideoListResponse =
            self.get("videos", &source.video_id, query, self.metadata_timeout)?;
        let item = response.items.into_iter().next().ok_or_else(|| {
            ImportError::InvalidSource(format!("official API has no video {}", source.video_id))
        })?;

        Ok(VideoMetadata {
            video_id: source.video_id.clone(),
            title: item.snippet.title.unwrap_or_default(),
            channel_id: item.snippet.channel_id.filter(|id| !id.is_empty()),
            channel_name: item.snippet.channel_title,
            published_at: item
                .snippet
                .published_at
                .as_deref()
                .and_then(parse_timestamp_str),
            comment_count: item
                .statistics
                .comment_count
                .and_then(|count| count.trim().parse().ok()),
            origin: MetadataOrigin::Api,
        })
    }

    fn fetch_comments(
        &self,
        source: &SourceRef,
        options: &FetchOptions,
    ) -> Result<RawCommentPayload> {
        let video_id = source.video_id.as_str();
        let mut collector = Collector::new(options);
        let mut page_token: Option<String> = None;
        let mut seen_tokens = HashSet::new();
        let mut pages = 0usize;

        'pages: loop {
            let page = self.fetch_thread_page(video_id, page_token.as_deref())?;
            pages += 1;
            debug!(
                video_id,
                page = pages,
                threads = page.items.len(),
                collected = collector.comments.len(),
                "fetched comment thread page"
            );

            for thread in page.items {
                let parent_id = thread.snippet.top_level_comment.id.clone();
                let inline = thread.replies.comments;
                let needs_full_replies = thread.snippet.total_reply_count as usize > inline.len()
                    && !parent_id.is_empty();

                let top = thread.snippet.top_level_comment;
                collector.observe_top_level(
                    top.snippet.published_at.as_deref().and_then(parse_timestamp_str),
                );
                collector.offer(top.into_official(None));

                let replies = if needs_full_replies {
                    debug!(
                        video_id,
                        parent_id = %parent_id,
                        total = thread.snippet.total_reply_count,
                        inline_cap = INLINE_REPLY_CAP,
                        "paging replies beyond the inline cap"
                    );
                    self.fetch_all_replies(video_id, &parent_id)?
                } else {
                    inline
                };
                for reply in replies {
                    collector.offer(reply.into_official(Some(&parent_id)));
                }

                if collector.is_full() {
                    break 'pages;
                }
            }

            match page.next_page_token {
                Some(token) if seen_tokens.insert(token.clone()) => page_token = Some(token),
                _ => break,
            }
        }

        Ok(RawCommentPayload::Official {
            video_id: video_id.to_owned(),
            comments: collector.comments,
        })
    }
}
