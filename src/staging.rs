#![forbid(unsafe_code)]

//! Time-boxed staging of prepared imports between `prepare` and `confirm`.
//!
//! The cache sits on top of a [`KeyValueStore`] with per-key TTL. Records are
//! stored as JSON so any external key-value service can stand in for the
//! in-process [`MemoryKeyValueStore`]. Losing an entry is acceptable: callers
//! see [`ImportError::ImportExpired`] and start over with `prepare`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ImportError, Result};
use crate::source::Provider;

pub const DEFAULT_STAGING_TTL: Duration = Duration::from_secs(10 * 60);
const KEY_PREFIX: &str = "import:pending:";

/// Key-value collaborator with per-key expiry.
///
/// `get` and `delete` are not atomic with respect to each other; the pipeline
/// treats a missing key as final rather than retrying.
pub trait KeyValueStore: Send + Sync {
    fn set_with_ttl(&self, key: &str, value: String, ttl: Duration);
    fn get(&self, key: &str) -> Option<String>;
    /// Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> bool;
    /// Drops expired entries, returning how many were removed.
    fn purge_expired(&self) -> usize;
}

/// In-process store used by the binaries and tests.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, (Instant, String)>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .insert(key.to_owned(), (expires_at, value));
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((expires_at, value)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn delete(&self, key: &str) -> bool {
        match self.entries.lock().remove(key) {
            Some((expires_at, _)) => expires_at > Instant::now(),
            None => false,
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (expires_at, _)| *expires_at > now);
        before - entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    /// The channel is known; confirm needs no tags.
    Ready,
    /// First sighting of the channel; confirm must carry at least one tag.
    AwaitingTags,
}

/// Fields `prepare` hands to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPendingImport {
    pub provider: Provider,
    pub video_id: String,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub video_title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub comment_count_estimate: u64,
    pub status: PendingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingImport {
    pub import_id: Uuid,
    #[serde(flatten)]
    pub fields: NewPendingImport,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingImport {
    pub fn requires_tags(&self) -> bool {
        self.fields.status == PendingStatus::AwaitingTags
    }
}

/// Explicit staging service injected into the pipeline.
#[derive(Clone)]
pub struct StagingCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl StagingCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn create(&self, fields: NewPendingImport) -> Result<PendingImport> {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|err| ImportError::Staging(format!("invalid staging ttl: {err}")))?;
        let record = PendingImport {
            import_id: Uuid::new_v4(),
            fields,
            created_at,
            expires_at: created_at + ttl,
        };
        let encoded = serde_json::to_string(&record)
            .map_err(|err| ImportError::Staging(format!("encoding pending import: {err}")))?;
        self.store
            .set_with_ttl(&staging_key(record.import_id), encoded, self.ttl);
        debug!(import_id = %record.import_id, video_id = %record.fields.video_id, "staged pending import");
        Ok(record)
    }

    pub fn get(&self, import_id: Uuid) -> Result<Option<PendingImport>> {
        let Some(raw) = self.store.get(&staging_key(import_id)) else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| ImportError::Staging(format!("decoding pending import {import_id}: {err}")))
    }

    /// Like [`StagingCache::get`] but a missing entry is [`ImportError::ImportExpired`].
    pub fn require(&self, import_id: Uuid) -> Result<PendingImport> {
        self.get(import_id)?
            .ok_or(ImportError::ImportExpired(import_id))
    }

    pub fn delete(&self, import_id: Uuid) -> bool {
        self.store.delete(&staging_key(import_id))
    }

    /// Best-effort cancel; a missing entry is not an error.
    pub fn cancel_pending_import(&self, import_id: Uuid) -> bool {
        let removed = self.delete(import_id);
        debug!(import_id = %import_id, removed, "cancelled pending import");
        removed
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}

fn staging_key(import_id: Uuid) -> String {
    format!("{KEY_PREFIX}{import_id}")
}
