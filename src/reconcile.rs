#![forbid(unsafe_code)]

//! Incremental ("delta") reconciliation of an already imported video.
//!
//! Only comments published strictly outside the stored `[min, max]` window are
//! fetched. Comments missing from inside that window (for example after an
//! interrupted earlier reconciliation) cannot be detected this way and are not
//! backfilled.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fetch::DeltaWindow;
use crate::normalize::{CanonicalComment, NormalizedBatch};

pub const DEFAULT_RECONCILE_MAX_RESULTS: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub imported_count: u64,
    pub total_available: u64,
    pub remaining: u64,
    pub has_more: bool,
    pub updated_comment_count: i64,
}

impl ReconcileReport {
    /// `delta_total` is what the fetch admitted (before the cap), `provider_hint`
    /// the provider's own estimate of comments not yet stored.
    pub fn new(
        imported_count: u64,
        selected: usize,
        delta_total: usize,
        provider_hint: Option<u64>,
        max_results: usize,
        updated_comment_count: i64,
    ) -> Self {
        let total_available = (delta_total as u64).max(provider_hint.unwrap_or(0));
        let remaining = total_available.saturating_sub(selected as u64);
        if remaining > 0 && selected < max_results {
            debug!(
                total_available,
                selected,
                "provider reports more comments than the fetch could reach"
            );
        }
        Self {
            imported_count,
            total_available,
            remaining,
            has_more: remaining > 0,
            updated_comment_count,
        }
    }
}

/// Keeps the admitted comments of `batch` closest to the stored window, at
/// most `max_results` of them. Newer comments go oldest-first and older ones
/// newest-first, so the stored window keeps growing without holes when a
/// capped run is continued. Returns how many comments were admitted before
/// the cap was applied.
pub fn select_delta(batch: &mut NormalizedBatch, window: Option<DeltaWindow>, max_results: usize) -> usize {
    if let Some(window) = window {
        batch.retain_comments(|comment| window.admits(comment.published_at));
    }
    let admitted = batch.comments.len();
    if admitted <= max_results {
        return admitted;
    }

    let mut ordered: Vec<&CanonicalComment> = batch.comments.iter().collect();
    ordered.sort_by(|left, right| nearest_first(window, left, right));
    let keep: std::collections::HashSet<String> = ordered
        .into_iter()
        .take(max_results)
        .map(|comment| comment.comment_id.clone())
        .collect();
    batch.retain_comments(|comment| keep.contains(&comment.comment_id));
    admitted
}

fn nearest_first(
    window: Option<DeltaWindow>,
    left: &CanonicalComment,
    right: &CanonicalComment,
) -> Ordering {
    let after = window.and_then(|window| window.after);
    let side = |comment: &CanonicalComment| match (comment.published_at, after) {
        (Some(at), Some(after)) if at > after => 0,
        (Some(_), _) => 1,
        (None, _) => 2,
    };
    side(left)
        .cmp(&side(right))
        .then_with(|| match side(left) {
            0 => left.published_at.cmp(&right.published_at),
            _ => right.published_at.cmp(&left.published_at),
        })
}
