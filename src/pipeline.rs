#![forbid(unsafe_code)]

//! The four operations callers drive: `prepare`, `confirm`, `cancel` and
//! `reconcile`.
//!
//! All provider I/O for an import happens before the commit transaction opens,
//! so the transaction itself only ever touches SQLite.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commit::{CommitRequest, CommitStats};
use crate::config::{PipelineSettings, RuntimeConfig};
use crate::error::{ImportError, Result};
use crate::fetch::{
    AggregatorFetcher, DeltaWindow, FetchOptions, HttpGet, MetadataOrigin, OfficialApiFetcher,
    SourceRegistry, UreqHttp, VideoMetadata, run_blocking,
};
use crate::metadata::{MetadataStore, TagId};
use crate::normalize::normalize;
use crate::reconcile::{ReconcileReport, select_delta};
use crate::source::{Provider, SourceIdentifier, SourceRef};
use crate::staging::{NewPendingImport, PendingImport, PendingStatus, StagingCache};
use crate::tagging::TaggingGate;

/// What `prepare` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResponse {
    pub import_id: Uuid,
    pub provider: Provider,
    pub video_id: String,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub video_title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub comment_count_estimate: u64,
    pub requires_tags: bool,
    pub expires_at: DateTime<Utc>,
}

impl From<&PendingImport> for PrepareResponse {
    fn from(pending: &PendingImport) -> Self {
        let fields = &pending.fields;
        Self {
            import_id: pending.import_id,
            provider: fields.provider,
            video_id: fields.video_id.clone(),
            channel_id: fields.channel_id.clone(),
            channel_name: fields.channel_name.clone(),
            video_title: fields.video_title.clone(),
            published_at: fields.published_at,
            comment_count_estimate: fields.comment_count_estimate,
            requires_tags: pending.requires_tags(),
            expires_at: pending.expires_at,
        }
    }
}

#[derive(Clone)]
pub struct ImportPipeline {
    store: MetadataStore,
    staging: StagingCache,
    sources: SourceRegistry,
    identifier: SourceIdentifier,
    gate: TaggingGate,
    reconcile_max_results: usize,
}

impl ImportPipeline {
    pub fn new(
        store: MetadataStore,
        staging: StagingCache,
        sources: SourceRegistry,
        identifier: SourceIdentifier,
        reconcile_max_results: usize,
    ) -> Self {
        Self {
            gate: TaggingGate::new(store.clone()),
            store,
            staging,
            sources,
            identifier,
            reconcile_max_results: reconcile_max_results.max(1),
        }
    }

    /// Opens the store and wires both `ureq` fetchers from runtime configuration.
    pub async fn from_config(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let store = MetadataStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening store at {}", config.database_path.display()))?;
        let settings: &PipelineSettings = &config.settings;
        let http: Arc<dyn HttpGet> = Arc::new(UreqHttp::new());

        let official = OfficialApiFetcher::new(
            http.clone(),
            config.official_base_url.clone(),
            config.official_api_key.clone(),
        )
        .with_page_size(settings.page_size)
        .with_timeouts(settings.metadata_timeout(), settings.comments_timeout());
        let aggregator = AggregatorFetcher::new(
            http,
            config.aggregator_base_url.clone(),
            config.aggregator_api_key.clone(),
        )
        .with_timeout(settings.comments_timeout());

        Ok(Self::new(
            store,
            StagingCache::in_memory(settings.staging_ttl()),
            SourceRegistry::new(Arc::new(official), Arc::new(aggregator)),
            SourceIdentifier::for_aggregator_base(&config.aggregator_base_url),
            settings.reconcile_max_results,
        ))
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn staging(&self) -> &StagingCache {
        &self.staging
    }

    /// Identifies the source, fetches its metadata and stages a pending
    /// import. Writes nothing durable.
    pub async fn prepare(&self, source: &str) -> Result<PrepareResponse> {
        let source = self.identifier.identify(source)?;
        let fetcher = self.sources.for_provider(source.provider);
        let metadata = {
            let source = source.clone();
            run_blocking(source.provider, move || fetcher.fetch_metadata(&source)).await?
        };

        let channel_id = metadata.channel_id.clone().or(source.channel_id.clone());
        let requires_tags = self.gate.is_new_channel(channel_id.as_deref()).await?;
        let pending = self.staging.create(NewPendingImport {
            provider: source.provider,
            video_id: metadata.video_id.clone(),
            channel_id,
            channel_name: metadata.channel_name.clone(),
            video_title: metadata.title.clone(),
            published_at: metadata.published_at,
            comment_count_estimate: metadata.comment_count.unwrap_or(0),
            status: if requires_tags {
                PendingStatus::AwaitingTags
            } else {
                PendingStatus::Ready
            },
        })?;

        info!(
            import_id = %pending.import_id,
            video_id = %pending.fields.video_id,
            provider = %source.provider,
            requires_tags,
            "prepared import"
        );
        Ok(PrepareResponse::from(&pending))
    }

    /// Fetches, normalizes and commits a staged import. The staging entry is
    /// consumed only on success, so a failed confirm can be retried with the
    /// same id until it expires.
    pub async fn confirm(&self, import_id: Uuid, tags: &[TagId]) -> Result<CommitStats> {
        let pending = self.staging.require(import_id)?;
        let fields = &pending.fields;
        let tags = self
            .gate
            .require_tags_if_new(fields.channel_id.as_deref(), tags)
            .await?;

        let source = SourceRef {
            provider: fields.provider,
            video_id: fields.video_id.clone(),
            channel_id: fields.channel_id.clone(),
        };
        let fetcher = self.sources.for_provider(source.provider);
        let payload = {
            let source = source.clone();
            run_blocking(source.provider, move || {
                fetcher.fetch_comments(&source, &FetchOptions::full())
            })
            .await?
        };
        let batch = normalize(&payload)?;
        if batch.skipped_entries > 0 {
            warn!(
                import_id = %import_id,
                skipped = batch.skipped_entries,
                "provider entries without id or text were skipped, replies included"
            );
        }

        // cancelled or expired while the comments were being fetched
        if self.staging.get(import_id)?.is_none() {
            debug!(import_id = %import_id, "pending import gone before commit");
            return Err(ImportError::ImportExpired(import_id));
        }

        let partition = self.store.partition_comment_ids(&batch.comment_ids()).await?;
        let video = VideoMetadata {
            video_id: fields.video_id.clone(),
            title: fields.video_title.clone(),
            channel_id: fields.channel_id.clone(),
            channel_name: fields.channel_name.clone(),
            published_at: fields.published_at,
            comment_count: Some(fields.comment_count_estimate),
            origin: MetadataOrigin::of(fields.provider),
        };
        let stats = self
            .store
            .commit_import(CommitRequest {
                video: &video,
                provider: fields.provider,
                batch: &batch,
                tags: &tags,
                skipped: partition.existing.len(),
            })
            .await?;

        if !self.staging.delete(import_id) {
            debug!(import_id = %import_id, "staging entry vanished during confirm");
        }
        info!(
            import_id = %import_id,
            video_id = %video.video_id,
            newly_added = stats.newly_added,
            skipped = stats.skipped,
            "confirmed import"
        );
        Ok(stats)
    }

    /// Best-effort; cancelling an unknown or expired import is not an error.
    pub fn cancel(&self, import_id: Uuid) -> bool {
        self.staging.cancel_pending_import(import_id)
    }

    /// Imports comments published outside the stored window, at most
    /// `reconcile_max_results` per call.
    pub async fn reconcile(&self, video_id: &str) -> Result<ReconcileReport> {
        let video = self
            .store
            .get_video(video_id)
            .await?
            .ok_or_else(|| ImportError::VideoNotFound(video_id.to_owned()))?;
        let stored_before = self.store.comment_count(video_id).await?;
        let window = self
            .store
            .comment_time_range(video_id)
            .await?
            .map(|(min, max)| DeltaWindow::outside(min, max));
        let max_results = self.reconcile_max_results;

        let source = SourceRef {
            provider: video.provider,
            video_id: video.id.clone(),
            channel_id: video.channel_id.clone(),
        };
        let fetcher = self.sources.for_provider(source.provider);
        let (payload, provider_total) = {
            let source = source.clone();
            run_blocking(source.provider, move || {
                let provider_total = if fetcher.reports_comment_total() {
                    fetcher.fetch_metadata(&source)?.comment_count
                } else {
                    None
                };
                let options = FetchOptions::bounded(window, max_results);
                Ok((fetcher.fetch_comments(&source, &options)?, provider_total))
            })
            .await?
        };

        let mut batch = normalize(&payload)?;
        let partition = self.store.partition_comment_ids(&batch.comment_ids()).await?;
        batch.retain_comments(|comment| partition.new.contains(&comment.comment_id));
        let delta_total = select_delta(&mut batch, window, max_results);
        let selected = batch.comments.len();

        let delta = self.store.commit_delta(video_id, &batch).await?;
        let provider_hint =
            provider_total.map(|total| total.saturating_sub(stored_before.max(0) as u64));
        let report = ReconcileReport::new(
            delta.newly_added,
            selected,
            delta_total,
            provider_hint,
            max_results,
            delta.comment_count,
        );

        info!(
            video_id,
            imported = report.imported_count,
            remaining = report.remaining,
            has_more = report.has_more,
            "reconciled video"
        );
        Ok(report)
    }

    /// Calls [`ImportPipeline::reconcile`] until nothing is left or
    /// `max_rounds` calls were made.
    pub async fn reconcile_until_complete(
        &self,
        video_id: &str,
        max_rounds: usize,
    ) -> Result<Vec<ReconcileReport>> {
        let mut reports = Vec::new();
        for round in 1..=max_rounds.max(1) {
            let report = self.reconcile(video_id).await?;
            reports.push(report);
            if !report.has_more || report.imported_count == 0 {
                break;
            }
            debug!(video_id, round, remaining = report.remaining, "continuing reconciliation");
        }
        Ok(reports)
    }
}
