#![forbid(unsafe_code)]

//! First-discovery tagging: a channel the store has never seen may only be
//! created together with at least one catalog tag.

use tracing::debug;

use crate::error::{ImportError, Result};
use crate::metadata::{MetadataStore, TagId};

#[derive(Clone)]
pub struct TaggingGate {
    store: MetadataStore,
}

impl TaggingGate {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    pub async fn is_new_channel(&self, channel_id: Option<&str>) -> Result<bool> {
        match channel_id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(!self.store.channel_exists(id).await?),
            None => Ok(false),
        }
    }

    /// Dedups `tags` (keeping request order) and rejects ids missing from the catalog.
    pub async fn validate_tags(&self, tags: &[TagId]) -> Result<Vec<TagId>> {
        let mut unique = Vec::with_capacity(tags.len());
        for tag in tags {
            if !unique.contains(tag) {
                unique.push(*tag);
            }
        }
        let unknown = self.store.unknown_tags(&unique).await?;
        if !unknown.is_empty() {
            return Err(ImportError::InvalidTag(
                unknown.into_iter().map(|tag| tag.0).collect(),
            ));
        }
        Ok(unique)
    }

    /// Enforces the rule for a confirm: new channels need tags, known channels
    /// do not get any applied. Unknown ids fail the request either way.
    pub async fn require_tags_if_new(
        &self,
        channel_id: Option<&str>,
        tags: &[TagId],
    ) -> Result<Vec<TagId>> {
        let validated = self.validate_tags(tags).await?;
        if !self.is_new_channel(channel_id).await? {
            if !validated.is_empty() {
                debug!(?channel_id, "ignoring tags for an already known channel");
            }
            return Ok(Vec::new());
        }
        if validated.is_empty() {
            return Err(ImportError::Validation(
                "at least one tag required for a newly discovered channel".into(),
            ));
        }
        Ok(validated)
    }
}
