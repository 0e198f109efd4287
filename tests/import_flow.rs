#![forbid(unsafe_code)]

//! End-to-end import scenarios against a temp-file store and a scripted
//! comment source.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use commentvault_tools::{
    ImportError, ImportPipeline,
    commit::CommitRequest,
    fetch::{CommentSource, FetchOptions, MetadataOrigin, SourceRegistry, VideoMetadata},
    metadata::{MetadataStore, TagId},
    normalize::{
        CanonicalComment, NormalizedBatch, OfficialComment, RawCommentPayload, format_timestamp,
        normalize_aggregator,
    },
    source::{Provider, SourceIdentifier, SourceRef},
    staging::{DEFAULT_STAGING_TTL, StagingCache},
};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

const VIDEO: &str = "ABCDEFGHIJK";
const SOURCE_URL: &str = "https://provider-a.example/watch?v=ABCDEFGHIJK";

/// Returns its whole comment list on every call, like a provider without
/// server-side paging; the pipeline applies window and cap itself.
struct ScriptedSource {
    channel_id: String,
    comments: Mutex<Vec<OfficialComment>>,
}

impl ScriptedSource {
    fn new(channel_id: &str) -> Arc<Self> {
        Arc::new(Self {
            channel_id: channel_id.into(),
            comments: Mutex::new(Vec::new()),
        })
    }

    /// Adds comments `c{start}..c{end}` published `start..end` seconds after the base time.
    fn publish(&self, start: usize, end: usize) {
        self.comments.lock().extend((start..end).map(|i| OfficialComment {
            id: format!("c{i:05}"),
            author_channel_id: Some(format!("UCauthor{}", i % 7)),
            author_display_name: Some(format!("Author {}", i % 7)),
            text: Some(format!("comment number {i}")),
            like_count: Some((i % 5) as i64),
            published_at: Some(format_timestamp(&at(i))),
            ..OfficialComment::default()
        }));
    }
}

fn at(offset: usize) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap_or_default()
        + Duration::seconds(offset as i64)
}

impl CommentSource for ScriptedSource {
    fn provider(&self) -> Provider {
        Provider::Official
    }

    fn fetch_metadata(&self, source: &SourceRef) -> commentvault_tools::Result<VideoMetadata> {
        Ok(VideoMetadata {
            video_id: source.video_id.clone(),
            title: "Scripted video".into(),
            channel_id: Some(self.channel_id.clone()),
            channel_name: Some("Scripted channel".into()),
            published_at: Some(at(0)),
            comment_count: Some(self.comments.lock().len() as u64),
            origin: MetadataOrigin::Api,
        })
    }

    fn fetch_comments(
        &self,
        source: &SourceRef,
        _options: &FetchOptions,
    ) -> commentvault_tools::Result<RawCommentPayload> {
        Ok(RawCommentPayload::Official {
            video_id: source.video_id.clone(),
            comments: self.comments.lock().clone(),
        })
    }

    fn reports_comment_total(&self) -> bool {
        false
    }
}

struct Harness {
    _dir: TempDir,
    store: MetadataStore,
    source: Arc<ScriptedSource>,
    pipeline: ImportPipeline,
}

async fn harness(reconcile_cap: usize) -> Result<Harness> {
    let dir = tempfile::tempdir()?;
    let store = MetadataStore::open(&dir.path().join("comments.db")).await?;
    let source = ScriptedSource::new("UCscripted");
    let pipeline = ImportPipeline::new(
        store.clone(),
        StagingCache::in_memory(DEFAULT_STAGING_TTL),
        SourceRegistry::new(source.clone(), source.clone()),
        SourceIdentifier::default(),
        reconcile_cap,
    );
    Ok(Harness {
        _dir: dir,
        store,
        source,
        pipeline,
    })
}

/// prepare on a never-seen channel asks for tags, an empty confirm is
/// rejected, and a tagged confirm stores everything with exactly one tag.
#[tokio::test]
async fn first_import_of_a_new_channel_requires_a_tag() -> Result<()> {
    let h = harness(1000).await?;
    let tag1 = h.store.create_tag("tag1").await?;
    h.source.publish(0, 12);

    let prepared = h.pipeline.prepare(SOURCE_URL).await?;
    assert!(prepared.requires_tags);
    assert_eq!(prepared.video_id, VIDEO);
    assert_eq!(prepared.channel_id.as_deref(), Some("UCscripted"));

    let err = h.pipeline.confirm(prepared.import_id, &[]).await.unwrap_err();
    assert!(matches!(err, ImportError::Validation(_)));

    let stats = h.pipeline.confirm(prepared.import_id, &[tag1]).await?;
    assert_eq!(stats.newly_added, 12);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.total_processed, 12);

    let channel = h.store.get_channel("UCscripted").await?.context("channel")?;
    assert_eq!(channel.tag_ids, vec![tag1]);
    assert_eq!(channel.video_count, 1);
    assert_eq!(channel.comment_count, 12);
    Ok(())
}

#[tokio::test]
async fn unknown_tag_fails_the_whole_confirm() -> Result<()> {
    let h = harness(1000).await?;
    let tag1 = h.store.create_tag("tag1").await?;
    h.source.publish(0, 3);

    let prepared = h.pipeline.prepare(VIDEO).await?;
    let err = h
        .pipeline
        .confirm(prepared.import_id, &[tag1, TagId(9999)])
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::InvalidTag(ref ids) if ids == &vec![9999_i64]));
    assert!(h.store.get_video(VIDEO).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn unknown_tag_fails_confirm_for_a_known_channel_too() -> Result<()> {
    let h = harness(1000).await?;
    let tag = h.store.create_tag("tag1").await?;
    h.source.publish(0, 3);
    let first = h.pipeline.prepare(VIDEO).await?;
    h.pipeline.confirm(first.import_id, &[tag]).await?;

    let second = h.pipeline.prepare(VIDEO).await?;
    assert!(!second.requires_tags);
    let err = h
        .pipeline
        .confirm(second.import_id, &[TagId(9999)])
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::InvalidTag(ref ids) if ids == &vec![9999_i64]));

    let channel = h.store.get_channel("UCscripted").await?.context("channel")?;
    assert_eq!(channel.tag_ids, vec![tag]);
    Ok(())
}

/// Whichever of cancel and confirm reaches the staging entry first wins; a
/// losing confirm is expired and stores nothing.
#[tokio::test]
async fn racing_cancel_and_confirm_agree_on_one_winner() -> Result<()> {
    let h = harness(1000).await?;
    let tag = h.store.create_tag("tag1").await?;
    h.source.publish(0, 8);
    let prepared = h.pipeline.prepare(VIDEO).await?;

    let tags = [tag];
    let (confirmed, cancelled) = tokio::join!(
        h.pipeline.confirm(prepared.import_id, &tags),
        async { h.pipeline.cancel(prepared.import_id) }
    );
    match confirmed {
        Ok(stats) => {
            assert_eq!(stats.newly_added, 8);
            assert_eq!(h.store.comment_count(VIDEO).await?, 8);
        }
        Err(err) => {
            assert!(cancelled);
            assert!(matches!(err, ImportError::ImportExpired(id) if id == prepared.import_id));
            assert!(h.store.get_video(VIDEO).await?.is_none());
        }
    }
    assert!(!h.pipeline.cancel(prepared.import_id));

    let err = h.pipeline.confirm(prepared.import_id, &[tag]).await.unwrap_err();
    assert!(matches!(err, ImportError::ImportExpired(_)));
    Ok(())
}

#[tokio::test]
async fn second_confirm_with_the_same_id_is_expired() -> Result<()> {
    let h = harness(1000).await?;
    let tag = h.store.create_tag("tag1").await?;
    h.source.publish(0, 5);

    let prepared = h.pipeline.prepare(VIDEO).await?;
    h.pipeline.confirm(prepared.import_id, &[tag]).await?;
    let err = h.pipeline.confirm(prepared.import_id, &[tag]).await.unwrap_err();
    assert!(matches!(err, ImportError::ImportExpired(id) if id == prepared.import_id));
    assert!(!err.is_retryable());
    assert_eq!(h.store.comment_count(VIDEO).await?, 5);
    Ok(())
}

#[tokio::test]
async fn importing_the_same_payload_twice_skips_everything() -> Result<()> {
    let h = harness(1000).await?;
    let tag = h.store.create_tag("tag1").await?;
    h.source.publish(0, 20);

    let first = h.pipeline.prepare(VIDEO).await?;
    h.pipeline.confirm(first.import_id, &[tag]).await?;

    let second = h.pipeline.prepare(VIDEO).await?;
    assert!(!second.requires_tags);
    let stats = h.pipeline.confirm(second.import_id, &[]).await?;
    assert_eq!(stats.newly_added, 0);
    assert_eq!(stats.skipped, stats.total_processed);
    assert_eq!(stats.total_processed, 20);
    assert_eq!(h.store.comment_count(VIDEO).await?, 20);

    let channel = h.store.get_channel("UCscripted").await?.context("channel")?;
    assert_eq!(channel.video_count, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_confirms_of_the_same_video_never_double_insert() -> Result<()> {
    let h = harness(1000).await?;
    let tag = h.store.create_tag("tag1").await?;
    h.source.publish(0, 50);

    let a = h.pipeline.prepare(VIDEO).await?;
    let b = h.pipeline.prepare(VIDEO).await?;
    let tags = [tag];
    let (left, right) = tokio::join!(
        h.pipeline.confirm(a.import_id, &tags),
        h.pipeline.confirm(b.import_id, &tags)
    );
    let added: u64 = [left, right]
        .into_iter()
        .filter_map(|result| result.ok())
        .map(|stats| stats.newly_added)
        .sum();
    assert_eq!(added, 50);
    assert_eq!(h.store.comment_count(VIDEO).await?, 50);
    Ok(())
}

/// 1,500 new comments with a cap of 1,000: the first call stops at the cap
/// and reports the rest, the second call finishes the job.
#[tokio::test]
async fn reconciliation_is_bounded_per_call() -> Result<()> {
    let h = harness(1000).await?;
    let tag = h.store.create_tag("tag1").await?;
    h.source.publish(0, 10);
    let prepared = h.pipeline.prepare(VIDEO).await?;
    h.pipeline.confirm(prepared.import_id, &[tag]).await?;

    h.source.publish(10, 1510);
    let first = h.pipeline.reconcile(VIDEO).await?;
    assert_eq!(first.imported_count, 1000);
    assert_eq!(first.total_available, 1500);
    assert!(first.has_more);
    assert_eq!(first.remaining, 500);
    assert_eq!(first.updated_comment_count, 1010);

    let second = h.pipeline.reconcile(VIDEO).await?;
    assert_eq!(second.imported_count, 500);
    assert!(!second.has_more);
    assert_eq!(second.remaining, 0);
    assert_eq!(second.updated_comment_count, 1510);

    let video = h.store.get_video(VIDEO).await?.context("video")?;
    assert_eq!(video.comment_count, 1510);
    Ok(())
}

#[tokio::test]
async fn reconcile_until_complete_drains_the_backlog() -> Result<()> {
    let h = harness(100).await?;
    let tag = h.store.create_tag("tag1").await?;
    h.source.publish(0, 10);
    let prepared = h.pipeline.prepare(VIDEO).await?;
    h.pipeline.confirm(prepared.import_id, &[tag]).await?;

    h.source.publish(10, 260);
    let reports = h.pipeline.reconcile_until_complete(VIDEO, 10).await?;
    let imported: u64 = reports.iter().map(|report| report.imported_count).sum();
    assert_eq!(reports.len(), 3);
    assert_eq!(imported, 250);
    assert_eq!(h.store.comment_count(VIDEO).await?, 260);
    Ok(())
}

#[tokio::test]
async fn reconcile_also_backfills_older_comments() -> Result<()> {
    let h = harness(1000).await?;
    let tag = h.store.create_tag("tag1").await?;
    h.source.publish(100, 110);
    let prepared = h.pipeline.prepare(VIDEO).await?;
    h.pipeline.confirm(prepared.import_id, &[tag]).await?;

    h.source.publish(0, 5);
    let report = h.pipeline.reconcile(VIDEO).await?;
    assert_eq!(report.imported_count, 5);
    let (min, _) = h.store.comment_time_range(VIDEO).await?.context("range")?;
    assert_eq!(min, at(0));
    Ok(())
}

/// A constraint violation on comment #7 of 10 leaves no channel, video or
/// comment behind for a previously unseen video.
#[tokio::test]
async fn failed_commit_leaves_nothing_behind() -> Result<()> {
    let h = harness(1000).await?;
    let video = VideoMetadata {
        video_id: "fresh-video".into(),
        title: "Fresh".into(),
        channel_id: Some("UCfresh".into()),
        channel_name: None,
        published_at: None,
        comment_count: None,
        origin: MetadataOrigin::Api,
    };
    let comments = (1..=10)
        .map(|i| CanonicalComment {
            comment_id: if i == 7 { String::new() } else { format!("f{i}") },
            video_id: "fresh-video".into(),
            author_id: None,
            text: "x".into(),
            like_count: 0,
            published_at: Some(at(i)),
            parent_comment_id: None,
        })
        .collect();
    let batch = NormalizedBatch {
        comments,
        ..NormalizedBatch::default()
    };

    let err = h
        .store
        .commit_import(CommitRequest {
            video: &video,
            provider: Provider::Official,
            batch: &batch,
            tags: &[],
            skipped: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::ImportFailed { .. }));
    assert!(h.store.get_channel("UCfresh").await?.is_none());
    assert!(h.store.get_video("fresh-video").await?.is_none());
    assert_eq!(h.store.comment_count("fresh-video").await?, 0);
    Ok(())
}

#[test]
fn nested_reply_is_flattened_under_its_parent() -> Result<()> {
    let payload = json!({
        "videoId": "tree",
        "comments": {
            "c1": {
                "authorId": "UCa",
                "text": "parent",
                "replies": { "r1": { "author_id": "UCb", "text": "child" } }
            }
        }
    });
    let batch = normalize_aggregator(&payload)?;
    assert_eq!(batch.comments.len(), 2);
    assert_eq!(batch.comments[0].comment_id, "c1");
    assert_eq!(batch.comments[0].parent_comment_id, None);
    assert_eq!(batch.comments[1].comment_id, "r1");
    assert_eq!(batch.comments[1].parent_comment_id.as_deref(), Some("c1"));
    Ok(())
}
