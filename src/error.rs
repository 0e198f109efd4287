#![forbid(unsafe_code)]

//! Error taxonomy shared by every stage of the import pipeline.

use thiserror::Error;
use uuid::Uuid;

use crate::source::Provider;

pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Debug, Error)]
pub enum ImportError {
    /// Empty input or a string that is neither provider's shape.
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// The provider host matched but required parameters are missing.
    #[error("malformed source: {0}")]
    MalformedSource(String),

    #[error("malformed response from {provider}: {reason}")]
    MalformedResponse { provider: Provider, reason: String },

    #[error("{provider} unavailable: {reason}")]
    SourceUnavailable { provider: Provider, reason: String },

    #[error("pending import {0} expired or was already consumed")]
    ImportExpired(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown tag ids: {0:?}")]
    InvalidTag(Vec<i64>),

    #[error("import of video {video_id} rolled back: {reason}")]
    ImportFailed { video_id: String, reason: String },

    #[error("video {0} has never been imported")]
    VideoNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] libsql::Error),

    #[error("staging store error: {0}")]
    Staging(String),
}

impl ImportError {
    /// Whether the caller may retry the same request after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::ImportFailed { .. }
        )
    }

    /// Stable machine-readable name for the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSource(_) => "invalid_source",
            Self::MalformedSource(_) => "malformed_source",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::ImportExpired(_) => "import_expired",
            Self::Validation(_) => "validation",
            Self::InvalidTag(_) => "invalid_tag",
            Self::ImportFailed { .. } => "import_failed",
            Self::VideoNotFound(_) => "video_not_found",
            Self::Storage(_) => "storage",
            Self::Staging(_) => "staging",
        }
    }

    pub(crate) fn malformed(provider: Provider, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            provider,
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(provider: Provider, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            provider,
            reason: reason.into(),
        }
    }
}
