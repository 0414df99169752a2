//! Typed error surface shared by the MCP tools and the HTTP control plane.
//!
//! Every variant carries a stable machine-readable kind string so clients can
//! branch without parsing prose. Degrade-tolerant failures (embedding, rerank,
//! LLM) never appear here — they fall back and surface as `degrade_reasons`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error payload for HTTP responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum PalaceError {
    // Address errors
    #[error("unknown domain '{0}'")]
    InvalidDomain(String),
    #[error("invalid path '{0}': segments must match [a-z0-9_-]+")]
    InvalidPath(String),
    #[error("address not found: {0}")]
    AddressNotFound(String),

    // Patch conflicts
    #[error("old string not found in content at '{0}'")]
    PatchNotFound(String),
    #[error("old string found {count} times at '{uri}'; provide more context")]
    PatchAmbiguous { uri: String, count: usize },

    // Concurrency
    #[error("write lane wait exceeded {0} ms")]
    LaneTimeout(u64),
    #[error("state hash mismatch for memory {0}")]
    StaleState(i64),

    // Queue / jobs
    #[error("index job queue is full")]
    QueueFull,
    #[error("index job '{0}' not found")]
    JobNotFound(String),
    #[error("index job '{0}' already reached a terminal state")]
    JobAlreadyFinalized(String),

    // Auth
    #[error("invalid or missing API key")]
    InvalidOrMissingApiKey,
    #[error("maintenance API key is not configured")]
    ApiKeyNotConfigured,
    #[error("insecure local override requires a loopback client")]
    InsecureLocalOverrideRequiresLoopback,

    // Cleanup review
    #[error("confirmation phrase mismatch")]
    ConfirmationPhraseMismatch,
    #[error("review expired")]
    ReviewExpired,
    #[error("review not found")]
    ReviewNotFound,
    #[error("too many pending cleanup reviews")]
    PendingReviewsFull,

    // Snapshot review
    #[error("no snapshot for session '{session}' resource '{resource}'")]
    SnapshotNotFound { session: String, resource: String },

    // Validation
    #[error("{0}")]
    InvalidArgument(String),

    // Migration (fatal)
    #[error("timed out waiting for migration lock: {0}")]
    MigrationLockTimeout(String),
    #[error("checksum mismatch for migration {version}: recorded={recorded} current={current}")]
    MigrationChecksumMismatch {
        version: String,
        recorded: String,
        current: String,
    },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PalaceError {
    /// Stable machine-readable kind, matching the wire contract.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidDomain(_) => "invalid_domain",
            Self::InvalidPath(_) => "invalid_path",
            Self::AddressNotFound(_) => "address_not_found",
            Self::PatchNotFound(_) => "patch_not_found",
            Self::PatchAmbiguous { .. } => "patch_ambiguous",
            Self::LaneTimeout(_) => "lane_timeout",
            Self::StaleState(_) => "stale_state",
            Self::QueueFull => "queue_full",
            Self::JobNotFound(_) => "job_not_found",
            Self::JobAlreadyFinalized(_) => "job_already_finalized",
            Self::InvalidOrMissingApiKey => "invalid_or_missing_api_key",
            Self::ApiKeyNotConfigured => "api_key_not_configured",
            Self::InsecureLocalOverrideRequiresLoopback => {
                "insecure_local_override_requires_loopback"
            }
            Self::ConfirmationPhraseMismatch => "confirmation_phrase_mismatch",
            Self::ReviewExpired => "review_expired",
            Self::ReviewNotFound => "review_not_found",
            Self::PendingReviewsFull => "pending_reviews_full",
            Self::SnapshotNotFound { .. } => "snapshot_not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::MigrationLockTimeout(_) => "migration_lock_timeout",
            Self::MigrationChecksumMismatch { .. } => "migration_checksum_mismatch",
            Self::Db(_) => "database_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidDomain(_)
            | Self::InvalidPath(_)
            | Self::InvalidArgument(_) => StatusCode::UNPROCESSABLE_ENTITY,

            Self::AddressNotFound(_)
            | Self::JobNotFound(_)
            | Self::ReviewNotFound
            | Self::SnapshotNotFound { .. } => StatusCode::NOT_FOUND,

            Self::PatchNotFound(_)
            | Self::PatchAmbiguous { .. }
            | Self::StaleState(_)
            | Self::JobAlreadyFinalized(_)
            | Self::ConfirmationPhraseMismatch
            | Self::ReviewExpired
            | Self::PendingReviewsFull => StatusCode::CONFLICT,

            Self::LaneTimeout(_) | Self::QueueFull => StatusCode::SERVICE_UNAVAILABLE,

            Self::InvalidOrMissingApiKey
            | Self::ApiKeyNotConfigured
            | Self::InsecureLocalOverrideRequiresLoopback => StatusCode::UNAUTHORIZED,

            Self::MigrationLockTimeout(_)
            | Self::MigrationChecksumMismatch { .. }
            | Self::Db(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind().to_string(),
            reason: self.to_string(),
            detail: None,
        }
    }
}

impl IntoResponse for PalaceError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, PalaceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(PalaceError::LaneTimeout(500).kind(), "lane_timeout");
        assert_eq!(
            PalaceError::PatchAmbiguous {
                uri: "core://x".into(),
                count: 2
            }
            .kind(),
            "patch_ambiguous"
        );
        assert_eq!(PalaceError::ReviewExpired.kind(), "review_expired");
        assert_eq!(PalaceError::QueueFull.kind(), "queue_full");
    }

    #[test]
    fn status_codes_map_by_category() {
        assert_eq!(
            PalaceError::InvalidOrMissingApiKey.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(PalaceError::QueueFull.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            PalaceError::AddressNotFound("core://x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PalaceError::StaleState(7).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn body_serializes_kind() {
        let body = PalaceError::ReviewNotFound.body();
        assert_eq!(body.error, "review_not_found");
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("review_not_found"));
    }
}
