//! Error types for persisted endpoint state.

use crate::rules::RuleError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    /// State document is not valid JSON for its schema version
    #[error("failed to parse endpoint state: {0}")]
    Json(#[from] serde_json::Error),

    /// Written by a newer version of this crate
    #[error("unsupported state schema version {found} (latest is {latest})")]
    UnsupportedVersion { found: u64, latest: u32 },

    /// Import identifier could not be parsed
    #[error("invalid import id '{id}': {reason}")]
    InvalidImportId { id: String, reason: String },

    /// A rule in the document or import id is invalid
    #[error(transparent)]
    InvalidRule(#[from] RuleError),
}
