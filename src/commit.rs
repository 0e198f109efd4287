#![forbid(unsafe_code)]

//! Atomic persistence of one import.
//!
//! A full import writes the channel, video, authors, comments, counters, tags
//! and import timestamps inside a single `BEGIN IMMEDIATE` transaction. A delta
//! import (reconciliation) reuses the author/comment/counter steps only. Every
//! insert is insert-if-absent, so two imports of the same video racing each
//! other end with fewer rows inserted rather than with an error.

use chrono::Utc;
use libsql::{Connection, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ImportError, Result};
use crate::fetch::{MetadataOrigin, VideoMetadata};
use crate::metadata::{MetadataStore, TagId};
use crate::normalize::{NormalizedBatch, format_timestamp};
use crate::source::Provider;

/// Everything a confirmed import writes.
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest<'a> {
    pub video: &'a VideoMetadata,
    pub provider: Provider,
    pub batch: &'a NormalizedBatch,
    /// Already validated by the tagging gate; only applied to a new channel.
    pub tags: &'a [TagId],
    /// Duplicates found by the pre-commit existence check.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStats {
    pub newly_added: u64,
    pub updated: u64,
    pub skipped: u64,
    pub total_processed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaCommit {
    pub newly_added: u64,
    /// True stored row count after the commit.
    pub comment_count: i64,
}

impl MetadataStore {
    pub async fn commit_import(&self, request: CommitRequest<'_>) -> Result<CommitStats> {
        let video_id = request.video.video_id.clone();
        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        match apply_import(&tx, &request).await {
            Ok(stats) => {
                tx.commit().await.map_err(|err| failed(&video_id, err))?;
                info!(
                    video_id = %video_id,
                    newly_added = stats.newly_added,
                    skipped = stats.skipped,
                    total = stats.total_processed,
                    "committed import"
                );
                Ok(stats)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(video_id = %video_id, error = %rollback_err, "rollback failed");
                }
                warn!(video_id = %video_id, error = %err, "import rolled back");
                Err(failed(&video_id, err))
            }
        }
    }

    /// Inserts reconciliation comments for an existing video.
    pub async fn commit_delta(&self, video_id: &str, batch: &NormalizedBatch) -> Result<DeltaCommit> {
        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        match apply_delta(&tx, video_id, batch).await {
            Ok(delta) => {
                tx.commit().await.map_err(|err| failed(video_id, err))?;
                Ok(delta)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(video_id, error = %rollback_err, "rollback failed");
                }
                warn!(video_id, error = %err, "delta import rolled back");
                Err(failed(video_id, err))
            }
        }
    }
}

fn failed(video_id: &str, err: impl std::fmt::Display) -> ImportError {
    ImportError::ImportFailed {
        video_id: video_id.to_owned(),
        reason: err.to_string(),
    }
}

async fn apply_import(conn: &Connection, request: &CommitRequest<'_>) -> Result<CommitStats> {
    let now = format_timestamp(&Utc::now());
    let video = request.video;
    let channel_id = video.channel_id.as_deref().filter(|id| !id.is_empty());
    let mut updated = 0;

    // 1. channel
    let channel_created = match channel_id {
        Some(channel_id) => {
            conn.execute(
                r#"
                INSERT INTO channels (id, name, video_count, comment_count, created_at)
                VALUES (?1, ?2, 0, 0, ?3)
                ON CONFLICT(id) DO NOTHING
                "#,
                params![channel_id, video.channel_name.as_deref().unwrap_or(""), now.as_str()],
            )
            .await?
                == 1
        }
        None => false,
    };

    // 2. video
    let published_at = video.published_at.as_ref().map(format_timestamp);
    let video_created = conn
        .execute(
            r#"
            INSERT INTO videos (id, channel_id, provider, title, published_at, comment_count,
                                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                video.video_id.as_str(),
                channel_id,
                request.provider.as_str(),
                video.title.as_str(),
                published_at.as_deref(),
                now.as_str(),
            ],
        )
        .await?
        == 1;
    if !video_created && video.origin == MetadataOrigin::Scraped && !video.title.is_empty() {
        updated += conn
            .execute(
                r#"
                UPDATE videos
                SET title = ?2, published_at = COALESCE(?3, published_at), updated_at = ?4
                WHERE id = ?1
                  AND (title IS NOT ?2 OR (?3 IS NOT NULL AND published_at IS NOT ?3))
                "#,
                params![
                    video.video_id.as_str(),
                    video.title.as_str(),
                    published_at.as_deref(),
                    now.as_str(),
                ],
            )
            .await?;
    }

    // 3 + 4. authors and comments
    let newly_added = insert_authors_and_comments(conn, request.batch).await?;

    // 5. counters
    refresh_video_count(conn, &video.video_id, &now).await?;
    if let Some(channel_id) = channel_id {
        conn.execute(
            r#"
            UPDATE channels
            SET comment_count = (
                    SELECT COUNT(*) FROM comments c
                    JOIN videos v ON v.id = c.video_id
                    WHERE v.channel_id = ?1
                ),
                video_count = (SELECT COUNT(*) FROM videos WHERE channel_id = ?1)
            WHERE id = ?1
            "#,
            [channel_id],
        )
        .await?;

        // 6. tags, first discovery only
        if channel_created {
            for tag in request.tags {
                conn.execute(
                    "INSERT INTO channel_tags (channel_id, tag_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                    params![channel_id, tag.0],
                )
                .await?;
            }
        }

        // 7. import timestamps
        conn.execute(
            r#"
            UPDATE channels
            SET first_import_at = COALESCE(first_import_at, ?2), last_import_at = ?2
            WHERE id = ?1
            "#,
            params![channel_id, now.as_str()],
        )
        .await?;
    }

    Ok(CommitStats {
        newly_added,
        updated,
        skipped: request.skipped as u64,
        total_processed: request.batch.comments.len() as u64,
    })
}

async fn apply_delta(conn: &Connection, video_id: &str, batch: &NormalizedBatch) -> Result<DeltaCommit> {
    let now = format_timestamp(&Utc::now());
    let newly_added = insert_authors_and_comments(conn, batch).await?;
    let comment_count = refresh_video_count(conn, video_id, &now).await?;

    let mut rows = conn
        .query("SELECT channel_id FROM videos WHERE id = ?1", [video_id])
        .await?;
    let channel_id: Option<String> = match rows.next().await? {
        Some(row) => row.get(0)?,
        None => None,
    };
    if let Some(channel_id) = channel_id {
        conn.execute(
            r#"
            UPDATE channels
            SET comment_count = (
                    SELECT COUNT(*) FROM comments c
                    JOIN videos v ON v.id = c.video_id
                    WHERE v.channel_id = ?1
                ),
                last_import_at = ?2
            WHERE id = ?1
            "#,
            params![channel_id.as_str(), now.as_str()],
        )
        .await?;
    }

    Ok(DeltaCommit {
        newly_added,
        comment_count,
    })
}

/// Authors never get their name overwritten; comments are never updated.
async fn insert_authors_and_comments(conn: &Connection, batch: &NormalizedBatch) -> Result<u64> {
    for author in &batch.authors {
        conn.execute(
            "INSERT INTO authors (id, name) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
            params![author.author_id.as_str(), author.display_name.as_str()],
        )
        .await?;
    }

    let mut inserted = 0;
    for comment in &batch.comments {
        inserted += conn
            .execute(
                r#"
                INSERT INTO comments (id, video_id, author_id, text, like_count, published_at,
                                      parent_comment_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO NOTHING
                "#,
                params![
                    comment.comment_id.as_str(),
                    comment.video_id.as_str(),
                    comment.author_id.as_deref(),
                    comment.text.as_str(),
                    comment.like_count,
                    comment.published_at.as_ref().map(format_timestamp),
                    comment.parent_comment_id.as_deref(),
                ],
            )
            .await?;
    }
    Ok(inserted)
}

/// Rewrites `videos.comment_count` from the true row count and bumps `updated_at`.
async fn refresh_video_count(conn: &Connection, video_id: &str, now: &str) -> Result<i64> {
    conn.execute(
        r#"
        UPDATE videos
        SET comment_count = (SELECT COUNT(*) FROM comments WHERE video_id = ?1), updated_at = ?2
        WHERE id = ?1
        "#,
        params![video_id, now],
    )
    .await?;
    let mut rows = conn
        .query("SELECT comment_count FROM videos WHERE id = ?1", [video_id])
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(0),
    }
}
