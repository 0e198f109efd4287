#![forbid(unsafe_code)]

//! Turns both provider payload shapes into one flat list of canonical comments.
//!
//! The official API already hands us a flat list with explicit parent ids, so
//! that side is a rename pass. The aggregator nests replies under their parent
//! and spells field names in either camelCase or snake_case; each logical field
//! is resolved through an ordered [`FieldAliases`] list so the lookup rules live
//! in one place.
//!
//! Aggregator nesting is assumed to be exactly two levels deep (comment and
//! replies). Anything nested below a reply is dropped and counted in
//! [`NormalizedBatch::dropped_deep_replies`] instead of being threaded under
//! the wrong parent.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ImportError, Result};
use crate::source::Provider;

/// Storage format for every timestamp: UTC, second precision, `Z` suffix.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Ordered list of accepted spellings for one logical field.
#[derive(Debug, Clone, Copy)]
pub struct FieldAliases(pub &'static [&'static str]);

impl FieldAliases {
    /// Returns the first alias present with a non-null value.
    pub fn lookup<'a>(&self, object: &'a Map<String, Value>) -> Option<&'a Value> {
        self.0
            .iter()
            .filter_map(|alias| object.get(*alias))
            .find(|value| !value.is_null())
    }

    pub fn string(&self, object: &Map<String, Value>) -> Option<String> {
        self.lookup(object).and_then(value_to_string)
    }
}

pub const VIDEO_ID: FieldAliases = FieldAliases(&["videoId", "video_id"]);
pub const COMMENT_ID: FieldAliases = FieldAliases(&["commentId", "comment_id", "id"]);
pub const AUTHOR_ID: FieldAliases = FieldAliases(&[
    "authorId",
    "author_id",
    "authorChannelId",
    "author_channel_id",
]);
pub const AUTHOR_NAME: FieldAliases = FieldAliases(&[
    "authorName",
    "author_name",
    "authorDisplayName",
    "author_display_name",
    "author",
]);
pub const TEXT: FieldAliases = FieldAliases(&[
    "text",
    "textDisplay",
    "text_display",
    "textOriginal",
    "text_original",
    "content",
]);
pub const LIKE_COUNT: FieldAliases = FieldAliases(&["likeCount", "like_count", "likes"]);
pub const PUBLISHED_AT: FieldAliases =
    FieldAliases(&["publishedAt", "published_at", "timestamp", "time"]);
pub const REPLIES: FieldAliases = FieldAliases(&["replies"]);
pub const COMMENTS: FieldAliases = FieldAliases(&["comments"]);

/// Canonical, provider-independent comment row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalComment {
    pub comment_id: String,
    pub video_id: String,
    pub author_id: Option<String>,
    pub text: String,
    pub like_count: i64,
    pub published_at: Option<DateTime<Utc>>,
    /// `None` for top-level comments.
    pub parent_comment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorRecord {
    pub author_id: String,
    pub display_name: String,
}

/// One entry of the official API's flat comment list, as produced by the fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfficialComment {
    pub id: String,
    pub parent_id: Option<String>,
    pub author_channel_id: Option<String>,
    pub author_display_name: Option<String>,
    pub text: Option<String>,
    pub like_count: Option<i64>,
    pub published_at: Option<String>,
}

/// Raw comment payload as returned by one of the fetchers.
#[derive(Debug, Clone)]
pub enum RawCommentPayload {
    Official {
        video_id: String,
        comments: Vec<OfficialComment>,
    },
    Aggregator(Value),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub comments: Vec<CanonicalComment>,
    /// One entry per distinct author id, first-seen display name wins.
    pub authors: Vec<AuthorRecord>,
    /// Entries that could not be persisted (no id, or no id field and no text).
    pub skipped_entries: usize,
    /// Replies nested below the second level.
    pub dropped_deep_replies: usize,
}

impl NormalizedBatch {
    pub fn comment_ids(&self) -> Vec<String> {
        self.comments
            .iter()
            .map(|comment| comment.comment_id.clone())
            .collect()
    }

    /// Keeps only the listed comments and the authors they reference.
    pub fn retain_comments(&mut self, keep: impl Fn(&CanonicalComment) -> bool) {
        self.comments.retain(|comment| keep(comment));
        let referenced: HashSet<&str> = self
            .comments
            .iter()
            .filter_map(|comment| comment.author_id.as_deref())
            .collect();
        self.authors
            .retain(|author| referenced.contains(author.author_id.as_str()));
    }

    fn push(&mut self, comment: CanonicalComment, author_name: Option<String>, seen: &mut Seen) {
        if !seen.comments.insert(comment.comment_id.clone()) {
            return;
        }
        if let Some(author_id) = comment.author_id.as_deref()
            && seen.authors.insert(author_id.to_owned())
        {
            self.authors.push(AuthorRecord {
                author_id: author_id.to_owned(),
                display_name: author_name.unwrap_or_default(),
            });
        }
        self.comments.push(comment);
    }
}

#[derive(Default)]
struct Seen {
    comments: HashSet<String>,
    authors: HashSet<String>,
}

/// Normalizes whichever payload a fetcher produced.
pub fn normalize(payload: &RawCommentPayload) -> Result<NormalizedBatch> {
    match payload {
        RawCommentPayload::Official { video_id, comments } => {
            Ok(normalize_official(video_id, comments))
        }
        RawCommentPayload::Aggregator(value) => normalize_aggregator(value),
    }
}

pub fn normalize_official(video_id: &str, comments: &[OfficialComment]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut seen = Seen::default();
    for raw in comments {
        if raw.id.trim().is_empty() {
            batch.skipped_entries += 1;
            continue;
        }
        let comment = CanonicalComment {
            comment_id: raw.id.clone(),
            video_id: video_id.to_owned(),
            author_id: raw.author_channel_id.clone().filter(|id| !id.is_empty()),
            text: raw.text.clone().unwrap_or_default(),
            like_count: raw.like_count.unwrap_or(0),
            published_at: raw.published_at.as_deref().and_then(parse_timestamp_str),
            parent_comment_id: raw.parent_id.clone().filter(|id| !id.is_empty()),
        };
        batch.push(comment, raw.author_display_name.clone(), &mut seen);
    }
    batch
}

/// Flattens an aggregator payload: `{ videoId, comments: { id: { ..., replies: { id: {...} } } } }`.
pub fn normalize_aggregator(payload: &Value) -> Result<NormalizedBatch> {
    let root = payload.as_object().ok_or_else(|| {
        ImportError::malformed(Provider::Aggregator, "payload is not a JSON object")
    })?;
    let video_id = VIDEO_ID
        .string(root)
        .ok_or_else(|| ImportError::malformed(Provider::Aggregator, "missing video id"))?;

    let mut batch = NormalizedBatch::default();
    let Some(comments) = COMMENTS.lookup(root) else {
        return Ok(batch);
    };
    let comments = comments.as_object().ok_or_else(|| {
        ImportError::malformed(Provider::Aggregator, "`comments` is not an object")
    })?;

    let mut seen = Seen::default();
    for (key, entry) in comments {
        let Some(entry) = entry.as_object() else {
            batch.skipped_entries += 1;
            continue;
        };
        let Some((comment, author_name)) = aggregator_entry(&video_id, key, entry, None) else {
            // its replies have no parent to hang from
            batch.skipped_entries += 1 + reply_subtree_len(entry);
            continue;
        };
        let parent_id = comment.comment_id.clone();
        batch.push(comment, author_name, &mut seen);

        let Some(replies) = REPLIES.lookup(entry).and_then(Value::as_object) else {
            continue;
        };
        for (reply_key, reply) in replies {
            let Some(reply) = reply.as_object() else {
                batch.skipped_entries += 1;
                continue;
            };
            if let Some(nested) = REPLIES.lookup(reply).and_then(Value::as_object) {
                batch.dropped_deep_replies += nested.len();
            }
            match aggregator_entry(&video_id, reply_key, reply, Some(&parent_id)) {
                Some((comment, author_name)) => batch.push(comment, author_name, &mut seen),
                None => batch.skipped_entries += 1,
            }
        }
    }

    if batch.dropped_deep_replies > 0 {
        warn!(
            video_id = %video_id,
            dropped = batch.dropped_deep_replies,
            "aggregator payload nests replies deeper than two levels; dropping them"
        );
    }
    Ok(batch)
}

fn reply_subtree_len(entry: &Map<String, Value>) -> usize {
    REPLIES
        .lookup(entry)
        .and_then(Value::as_object)
        .map(|replies| {
            replies
                .values()
                .map(|reply| 1 + reply.as_object().map_or(0, reply_subtree_len))
                .sum()
        })
        .unwrap_or(0)
}

fn aggregator_entry(
    video_id: &str,
    key: &str,
    entry: &Map<String, Value>,
    parent: Option<&str>,
) -> Option<(CanonicalComment, Option<String>)> {
    let explicit_id = COMMENT_ID.string(entry).filter(|id| !id.trim().is_empty());
    let text = TEXT.string(entry).unwrap_or_default();
    if explicit_id.is_none() && text.trim().is_empty() {
        return None;
    }
    let comment_id = explicit_id.unwrap_or_else(|| key.to_owned());
    if comment_id.trim().is_empty() {
        return None;
    }

    let comment = CanonicalComment {
        comment_id,
        video_id: video_id.to_owned(),
        author_id: AUTHOR_ID
            .lookup(entry)
            .and_then(author_id_value)
            .filter(|id| !id.is_empty()),
        text,
        like_count: LIKE_COUNT.lookup(entry).and_then(value_to_i64).unwrap_or(0),
        published_at: PUBLISHED_AT.lookup(entry).and_then(parse_timestamp),
        parent_comment_id: parent.map(str::to_owned),
    };
    Some((comment, AUTHOR_NAME.string(entry)))
}

/// Author ids arrive either as a plain string or as `{ "value": "..." }`.
pub fn author_id_value(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map.get("value").and_then(value_to_string),
        other => value_to_string(other),
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts RFC 3339 strings, `YYYY-MM-DD HH:MM:SS` (UTC) and epoch seconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number.as_i64().and_then(epoch_to_datetime),
        Value::String(text) => parse_timestamp_str(text),
        _ => None,
    }
}

pub fn parse_timestamp_str(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(datetime.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    trimmed.parse::<i64>().ok().and_then(epoch_to_datetime)
}

/// Epoch values above 1e12 are treated as milliseconds.
fn epoch_to_datetime(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch.abs() >= 1_000_000_000_000 {
        DateTime::<Utc>::from_timestamp_millis(epoch)
    } else {
        DateTime::<Utc>::from_timestamp(epoch, 0)
    }
}

pub fn format_timestamp(datetime: &DateTime<Utc>) -> String {
    datetime.format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_one_reply_under_its_parent() {
        let payload = json!({
            "videoId": "vid1",
            "comments": {
                "c1": {
                    "authorId": "UCa",
                    "authorName": "Alice",
                    "text": "top",
                    "likeCount": 3,
                    "publishedAt": "2024-03-01T10:00:00Z",
                    "replies": {
                        "r1": {
                            "author_id": "UCb",
                            "author_name": "Bob",
                            "text": "reply",
                            "published_at": 1709287200
                        }
                    }
                }
            }
        });

        let batch = normalize_aggregator(&payload).unwrap();
        assert_eq!(batch.comments.len(), 2);
        assert_eq!(batch.comments[0].comment_id, "c1");
        assert_eq!(batch.comments[0].parent_comment_id, None);
        assert_eq!(batch.comments[0].like_count, 3);
        assert_eq!(batch.comments[1].comment_id, "r1");
        assert_eq!(batch.comments[1].parent_comment_id.as_deref(), Some("c1"));
        assert_eq!(batch.comments[1].video_id, "vid1");
        assert_eq!(
            batch.comments[1].published_at,
            DateTime::<Utc>::from_timestamp(1_709_287_200, 0)
        );
        assert_eq!(batch.authors.len(), 2);
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let payload = json!({
            "video_id": "vid1",
            "comments": { "c1": { "commentId": "c1" } }
        });
        let batch = normalize_aggregator(&payload).unwrap();
        let comment = &batch.comments[0];
        assert_eq!(comment.text, "");
        assert_eq!(comment.like_count, 0);
        assert_eq!(comment.author_id, None);
        assert_eq!(comment.published_at, None);
        assert!(batch.authors.is_empty());
    }

    #[test]
    fn skips_entries_without_id_field_or_text() {
        let payload = json!({
            "videoId": "vid1",
            "comments": {
                "ghost": { "likeCount": 1 },
                "c2": { "text": "kept" },
                "c3": "not an object"
            }
        });
        let batch = normalize_aggregator(&payload).unwrap();
        assert_eq!(batch.comment_ids(), vec!["c2".to_string()]);
        assert_eq!(batch.skipped_entries, 2);
    }

    #[test]
    fn skipped_top_level_entry_counts_its_replies() {
        let payload = json!({
            "videoId": "vid1",
            "comments": {
                "ghost": {
                    "likeCount": 1,
                    "replies": {
                        "r1": { "text": "orphan" },
                        "r2": { "text": "orphan too", "replies": { "g1": { "text": "deep" } } }
                    }
                },
                "c2": { "text": "kept" }
            }
        });
        let batch = normalize_aggregator(&payload).unwrap();
        assert_eq!(batch.comment_ids(), vec!["c2".to_string()]);
        assert_eq!(batch.skipped_entries, 4);
    }

    #[test]
    fn drops_replies_nested_below_two_levels() {
        let payload = json!({
            "videoId": "vid1",
            "comments": {
                "c1": {
                    "text": "top",
                    "replies": {
                        "r1": {
                            "text": "reply",
                            "replies": { "g1": { "text": "grandchild" } }
                        }
                    }
                }
            }
        });
        let batch = normalize_aggregator(&payload).unwrap();
        assert_eq!(batch.comment_ids(), vec!["c1".to_string(), "r1".to_string()]);
        assert_eq!(batch.dropped_deep_replies, 1);
    }

    #[test]
    fn first_seen_author_name_wins() {
        let comments = vec![
            OfficialComment {
                id: "a".into(),
                author_channel_id: Some("UC1".into()),
                author_display_name: Some("First".into()),
                ..OfficialComment::default()
            },
            OfficialComment {
                id: "b".into(),
                parent_id: Some("a".into()),
                author_channel_id: Some("UC1".into()),
                author_display_name: Some("Renamed".into()),
                like_count: Some(9),
                published_at: Some("2024-01-02T03:04:05.000Z".into()),
                ..OfficialComment::default()
            },
        ];
        let batch = normalize_official("vid", &comments);
        assert_eq!(batch.authors.len(), 1);
        assert_eq!(batch.authors[0].display_name, "First");
        assert_eq!(batch.comments[1].parent_comment_id.as_deref(), Some("a"));
        assert_eq!(batch.comments[1].like_count, 9);
        assert_eq!(
            batch.comments[1].published_at.map(|at| format_timestamp(&at)),
            Some("2024-01-02T03:04:05Z".to_string())
        );
    }

    #[test]
    fn duplicate_ids_within_one_payload_collapse() {
        let comments = vec![
            OfficialComment {
                id: "a".into(),
                text: Some("one".into()),
                ..OfficialComment::default()
            },
            OfficialComment {
                id: "a".into(),
                text: Some("two".into()),
                ..OfficialComment::default()
            },
        ];
        let batch = normalize_official("vid", &comments);
        assert_eq!(batch.comments.len(), 1);
        assert_eq!(batch.comments[0].text, "one");
    }

    #[test]
    fn aggregator_payload_without_video_id_is_rejected() {
        let err = normalize_aggregator(&json!({ "comments": {} })).unwrap_err();
        assert!(matches!(err, ImportError::MalformedResponse { .. }));
    }

    #[test]
    fn parses_the_accepted_timestamp_shapes() {
        let expected = DateTime::<Utc>::from_timestamp(1_700_000_000, 0);
        assert_eq!(parse_timestamp(&json!(1_700_000_000)), expected);
        assert_eq!(parse_timestamp(&json!(1_700_000_000_000i64)), expected);
        assert_eq!(parse_timestamp(&json!("2023-11-14T22:13:20Z")), expected);
        assert_eq!(parse_timestamp(&json!("2023-11-14 22:13:20")), expected);
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }
}
