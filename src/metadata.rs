#![forbid(unsafe_code)]

//! Relational persistence for channels, videos, authors, comments and tags.
//!
//! Every unit of work opens its own connection from the shared [`Database`],
//! so concurrent imports never interleave statements on one SQLite handle.
//! Writes that must be atomic go through [`crate::commit`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};
use crate::normalize::{CanonicalComment, parse_timestamp_str};
use crate::source::Provider;

/// SQLite caps bound parameters per statement; existence checks are chunked below it.
const EXISTENCE_CHUNK: usize = 500;

/// Catalog tag id. Tags are informational labels attached to a channel on first discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(pub i64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub id: TagId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    pub video_count: i64,
    pub comment_count: i64,
    pub first_import_at: Option<DateTime<Utc>>,
    pub last_import_at: Option<DateTime<Utc>>,
    pub tag_ids: Vec<TagId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub channel_id: Option<String>,
    pub provider: Provider,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub comment_count: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Result of the duplicate check over a batch of candidate ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentPartition {
    pub existing: HashSet<String>,
    pub new: HashSet<String>,
}

async fn configure_connection(conn: &Connection) -> libsql::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        PRAGMA busy_timeout=5000;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> libsql::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY CHECK (length(id) > 0),
            name TEXT NOT NULL DEFAULT '',
            video_count INTEGER NOT NULL DEFAULT 0,
            comment_count INTEGER NOT NULL DEFAULT 0,
            first_import_at TEXT,
            last_import_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY CHECK (length(id) > 0),
            channel_id TEXT REFERENCES channels(id),
            provider TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            published_at TEXT,
            comment_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS authors (
            id TEXT PRIMARY KEY CHECK (length(id) > 0),
            name TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS comments (
            id TEXT PRIMARY KEY CHECK (length(id) > 0),
            video_id TEXT NOT NULL REFERENCES videos(id),
            author_id TEXT REFERENCES authors(id),
            text TEXT NOT NULL DEFAULT '',
            like_count INTEGER NOT NULL DEFAULT 0,
            published_at TEXT,
            parent_comment_id TEXT
        );

        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE CHECK (length(name) > 0)
        );

        CREATE TABLE IF NOT EXISTS channel_tags (
            channel_id TEXT NOT NULL REFERENCES channels(id),
            tag_id INTEGER NOT NULL REFERENCES tags(id),
            PRIMARY KEY (channel_id, tag_id)
        );

        CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id);
        CREATE INDEX IF NOT EXISTS idx_comments_video_published ON comments(video_id, published_at);
        CREATE INDEX IF NOT EXISTS idx_comments_parent ON comments(parent_comment_id);
        "#,
    )
    .await?;
    Ok(())
}

/// Cloneable handle on the comment database.
#[derive(Clone)]
pub struct MetadataStore {
    db: Arc<Database>,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening comment DB {}", path.display()))?;

        let store = Self { db: Arc::new(db) };
        let conn = store.connect().await.context("connecting to comment DB")?;
        ensure_schema(&conn).await.context("creating schema")?;
        Ok(store)
    }

    /// Opens a fresh, configured connection for one unit of work.
    pub(crate) async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect()?;
        configure_connection(&conn).await?;
        Ok(conn)
    }

    pub async fn channel_exists(&self, channel_id: &str) -> Result<bool> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query("SELECT 1 FROM channels WHERE id = ?1", [channel_id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, name, video_count, comment_count, first_import_at, last_import_at
                FROM channels
                WHERE id = ?1
                "#,
                [channel_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let mut channel = row_to_channel(&row)?;
        channel.tag_ids = channel_tags_on(&conn, channel_id).await?;
        Ok(Some(channel))
    }

    pub async fn channel_tags(&self, channel_id: &str) -> Result<Vec<TagId>> {
        let conn = self.connect().await?;
        channel_tags_on(&conn, channel_id).await
    }

    pub async fn get_video(&self, video_id: &str) -> Result<Option<VideoRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, channel_id, provider, title, published_at, comment_count,
                       created_at, updated_at
                FROM videos
                WHERE id = ?1
                "#,
                [video_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated first.
    pub async fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, channel_id, provider, title, published_at, comment_count,
                       created_at, updated_at
                FROM videos
                ORDER BY updated_at DESC, rowid DESC
                "#,
                params![],
            )
            .await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }

    /// True number of stored comments for the video.
    pub async fn comment_count(&self, video_id: &str) -> Result<i64> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM comments WHERE video_id = ?1", [video_id])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// `(min, max)` published-at across the video's stored comments, if any carry a timestamp.
    pub async fn comment_time_range(
        &self,
        video_id: &str,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT MIN(published_at), MAX(published_at)
                FROM comments
                WHERE video_id = ?1 AND published_at IS NOT NULL
                "#,
                [video_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let min: Option<String> = row.get(0)?;
        let max: Option<String> = row.get(1)?;
        Ok(min
            .as_deref()
            .and_then(parse_timestamp_str)
            .zip(max.as_deref().and_then(parse_timestamp_str)))
    }

    /// Oldest first; comments without a timestamp sort last.
    pub async fn comments_for_video(&self, video_id: &str) -> Result<Vec<CanonicalComment>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, video_id, author_id, text, like_count, published_at, parent_comment_id
                FROM comments
                WHERE video_id = ?1
                ORDER BY published_at IS NULL, published_at ASC, rowid ASC
                "#,
                [video_id],
            )
            .await?;
        let mut comments = Vec::new();
        while let Some(row) = rows.next().await? {
            comments.push(row_to_comment(&row)?);
        }
        Ok(comments)
    }

    /// Splits candidate ids into those already stored and those that are new.
    pub async fn partition_comment_ids(&self, candidates: &[String]) -> Result<CommentPartition> {
        let conn = self.connect().await?;
        let unique: Vec<&String> = {
            let mut seen = HashSet::new();
            candidates
                .iter()
                .filter(|id| seen.insert(id.as_str()))
                .collect()
        };

        let mut existing = HashSet::new();
        for chunk in unique.chunks(EXISTENCE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("SELECT id FROM comments WHERE id IN ({placeholders})");
            let ids: Vec<String> = chunk.iter().map(|id| (*id).clone()).collect();
            let mut rows = conn.query(&sql, params_from_iter(ids)).await?;
            while let Some(row) = rows.next().await? {
                existing.insert(row.get::<String>(0)?);
            }
        }

        let new = unique
            .into_iter()
            .filter(|id| !existing.contains(id.as_str()))
            .cloned()
            .collect();
        Ok(CommentPartition { existing, new })
    }

    /// Returns the id of the tag called `name`, creating it if needed.
    pub async fn create_tag(&self, name: &str) -> Result<TagId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ImportError::Validation("tag name must not be empty".into()));
        }
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO tags (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            [name],
        )
        .await?;
        let mut rows = conn
            .query("SELECT id FROM tags WHERE name = ?1", [name])
            .await?;
        let Some(row) = rows.next().await? else {
            return Err(ImportError::Validation(format!("tag {name:?} could not be created")));
        };
        Ok(TagId(row.get(0)?))
    }

    pub async fn list_tags(&self) -> Result<Vec<TagRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query("SELECT id, name FROM tags ORDER BY id ASC", params![])
            .await?;
        let mut tags = Vec::new();
        while let Some(row) = rows.next().await? {
            tags.push(TagRecord {
                id: TagId(row.get(0)?),
                name: row.get(1)?,
            });
        }
        Ok(tags)
    }

    /// Ids from `requested` that are not in the catalog, in request order.
    pub async fn unknown_tags(&self, requested: &[TagId]) -> Result<Vec<TagId>> {
        if requested.is_empty() {
            return Ok(Vec::new());
        }
        let known: HashSet<TagId> = self.list_tags().await?.into_iter().map(|tag| tag.id).collect();
        Ok(requested
            .iter()
            .copied()
            .filter(|id| !known.contains(id))
            .collect())
    }
}

async fn channel_tags_on(conn: &Connection, channel_id: &str) -> Result<Vec<TagId>> {
    let mut rows = conn
        .query(
            "SELECT tag_id FROM channel_tags WHERE channel_id = ?1 ORDER BY tag_id ASC",
            [channel_id],
        )
        .await?;
    let mut tags = Vec::new();
    while let Some(row) = rows.next().await? {
        tags.push(TagId(row.get(0)?));
    }
    Ok(tags)
}

fn optional_timestamp(row: &Row, index: i32) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    Ok(raw.as_deref().and_then(parse_timestamp_str))
}

fn row_to_channel(row: &Row) -> Result<ChannelRecord> {
    Ok(ChannelRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        video_count: row.get(2)?,
        comment_count: row.get(3)?,
        first_import_at: optional_timestamp(row, 4)?,
        last_import_at: optional_timestamp(row, 5)?,
        tag_ids: Vec::new(),
    })
}

/// Column order must match the SELECT statements in get_video/list_videos.
fn row_to_video(row: &Row) -> Result<VideoRecord> {
    let provider: String = row.get(2)?;
    Ok(VideoRecord {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        provider: Provider::parse(&provider).unwrap_or(Provider::Official),
        title: row.get(3)?,
        published_at: optional_timestamp(row, 4)?,
        comment_count: row.get(5)?,
        created_at: optional_timestamp(row, 6)?,
        updated_at: optional_timestamp(row, 7)?,
    })
}

fn row_to_comment(row: &Row) -> Result<CanonicalComment> {
    Ok(CanonicalComment {
        comment_id: row.get(0)?,
        video_id: row.get(1)?,
        author_id: row.get(2)?,
        text: row.get(3)?,
        like_count: row.get(4)?,
        published_at: optional_timestamp(row, 5)?,
        parent_comment_id: row.get(6)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    /// Opens a brand-new store inside a temp directory; keep the `TempDir`
    /// alive for as long as the store is used.
    pub(crate) async fn create_store() -> Result<(tempfile::TempDir, MetadataStore)> {
        let dir = tempdir()?;
        let store = MetadataStore::open(&dir.path().join("db/comments.db")).await?;
        Ok((dir, store))
    }

    /// Inserts a bare video row (and its channel) so read helpers have data.
    pub(crate) async fn seed_video(store: &MetadataStore, video_id: &str, channel_id: &str) -> Result<()> {
        let conn = store.connect().await?;
        conn.execute(
            "INSERT OR IGNORE INTO channels (id, name, created_at) VALUES (?1, 'seed', '2024-01-01T00:00:00Z')",
            [channel_id],
        )
        .await?;
        conn.execute(
            r#"
            INSERT INTO videos (id, channel_id, provider, title, created_at, updated_at)
            VALUES (?1, ?2, 'official', 'seeded', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')
            "#,
            [video_id, channel_id],
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn seed_comment(
        store: &MetadataStore,
        video_id: &str,
        comment_id: &str,
        published_at: Option<&str>,
    ) -> Result<()> {
        let conn = store.connect().await?;
        conn.execute(
            "INSERT INTO comments (id, video_id, published_at) VALUES (?1, ?2, ?3)",
            params![comment_id, video_id, published_at],
        )
        .await?;
        Ok(())
    }

    /// Opening a store provisions every table and leaves WAL mode and
    /// foreign keys switched on.
    #[tokio::test]
    async fn opens_store_and_creates_schema() -> Result<()> {
        let (dir, store) = create_store().await?;
        assert!(dir.path().join("db/comments.db").exists());

        let conn = store.connect().await?;
        let mut rows = conn.query("PRAGMA journal_mode", params![]).await?;
        let journal: String = rows.next().await?.context("missing journal_mode row")?.get(0)?;
        assert_eq!(journal.to_lowercase(), "wal");

        let mut rows = conn.query("PRAGMA foreign_keys", params![]).await?;
        let fk: i64 = rows.next().await?.context("missing foreign_keys row")?.get(0)?;
        assert_eq!(fk, 1);

        for table in ["channels", "videos", "authors", "comments", "tags", "channel_tags"] {
            let mut rows = conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                )
                .await?;
            assert!(rows.next().await?.is_some(), "missing table {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn reopening_existing_store_keeps_data() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("comments.db");
        let store = MetadataStore::open(&path).await?;
        store.create_tag("music").await?;
        drop(store);

        let reopened = MetadataStore::open(&path).await?;
        assert_eq!(reopened.list_tags().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn partition_splits_existing_and_new_ids() -> Result<()> {
        let (_dir, store) = create_store().await?;
        seed_video(&store, "vid", "UC1").await?;
        seed_comment(&store, "vid", "a", None).await?;
        seed_comment(&store, "vid", "b", None).await?;

        let candidates = vec!["a".to_string(), "c".to_string(), "b".to_string(), "c".to_string()];
        let partition = store.partition_comment_ids(&candidates).await?;
        assert_eq!(partition.existing, HashSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(partition.new, HashSet::from(["c".to_string()]));
        Ok(())
    }

    /// The IN list is chunked, so large candidate sets still resolve.
    #[tokio::test]
    async fn partition_handles_more_ids_than_one_chunk() -> Result<()> {
        let (_dir, store) = create_store().await?;
        seed_video(&store, "vid", "UC1").await?;
        seed_comment(&store, "vid", "id-1200", None).await?;

        let candidates: Vec<String> = (0..1300).map(|i| format!("id-{i}")).collect();
        let partition = store.partition_comment_ids(&candidates).await?;
        assert_eq!(partition.existing.len(), 1);
        assert_eq!(partition.new.len(), 1299);
        Ok(())
    }

    #[tokio::test]
    async fn time_range_ignores_comments_without_timestamp() -> Result<()> {
        let (_dir, store) = create_store().await?;
        seed_video(&store, "vid", "UC1").await?;
        assert_eq!(store.comment_time_range("vid").await?, None);

        seed_comment(&store, "vid", "a", None).await?;
        seed_comment(&store, "vid", "b", Some("2024-02-01T00:00:00Z")).await?;
        seed_comment(&store, "vid", "c", Some("2024-01-01T00:00:00Z")).await?;
        seed_comment(&store, "vid", "d", Some("2024-03-01T00:00:00Z")).await?;

        let (min, max) = store.comment_time_range("vid").await?.context("range")?;
        assert_eq!(min, parse_timestamp_str("2024-01-01T00:00:00Z").context("min")?);
        assert_eq!(max, parse_timestamp_str("2024-03-01T00:00:00Z").context("max")?);
        assert_eq!(store.comment_count("vid").await?, 4);

        let ordered: Vec<String> = store
            .comments_for_video("vid")
            .await?
            .into_iter()
            .map(|comment| comment.comment_id)
            .collect();
        assert_eq!(ordered, vec!["c", "b", "d", "a"]);
        Ok(())
    }

    #[tokio::test]
    async fn tag_catalog_is_idempotent_by_name() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let music = store.create_tag("music").await?;
        let again = store.create_tag(" music ").await?;
        let gaming = store.create_tag("gaming").await?;
        assert_eq!(music, again);
        assert_ne!(music, gaming);

        let unknown = store.unknown_tags(&[gaming, TagId(999), music]).await?;
        assert_eq!(unknown, vec![TagId(999)]);
        Ok(())
    }

    #[tokio::test]
    async fn reader_returns_none_for_missing_entries() -> Result<()> {
        let (_dir, store) = create_store().await?;
        assert!(store.get_video("ghost").await?.is_none());
        assert!(store.get_channel("ghost").await?.is_none());
        assert!(!store.channel_exists("ghost").await?);
        assert!(store.channel_tags("ghost").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn seeded_video_reads_back() -> Result<()> {
        let (_dir, store) = create_store().await?;
        seed_video(&store, "vid", "UC1").await?;
        let video = store.get_video("vid").await?.context("video")?;
        assert_eq!(video.provider, Provider::Official);
        assert_eq!(video.channel_id.as_deref(), Some("UC1"));
        assert_eq!(store.list_videos().await?.len(), 1);
        assert!(store.channel_exists("UC1").await?);
        Ok(())
    }
}
