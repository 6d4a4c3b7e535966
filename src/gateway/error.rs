//! Error types for namespace gateway calls.

use crate::retry::Retryable;
use thiserror::Error;

/// Errors a namespace gateway can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Entity (queue, subscription or rule) does not exist
    #[error("{entity} not found")]
    NotFound { entity: String },

    /// Entity already exists
    #[error("{entity} already exists")]
    Conflict { entity: String },

    /// Another operation on the entity is still in progress
    #[error("{entity} is busy with another operation")]
    Busy { entity: String },

    /// Namespace is rate limiting requests
    #[error("request throttled by the namespace")]
    Throttled,

    /// Request exceeded its deadline
    #[error("request timeout after {0}ms")]
    Timeout(u64),

    /// Connectivity failure before a response was received
    #[error("network error: {0}")]
    Network(String),

    /// Namespace returned an unexpected error response
    #[error("namespace error {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Request was rejected as invalid
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Credentials were missing or lacked the required rights
    #[error("not authorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },
}

impl GatewayError {
    pub fn not_found(entity: impl Into<String>) -> Self {
        GatewayError::NotFound {
            entity: entity.into(),
        }
    }

    pub fn conflict(entity: impl Into<String>) -> Self {
        GatewayError::Conflict {
            entity: entity.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, GatewayError::Conflict { .. })
    }

    /// Whether a failed rule create may succeed later.
    ///
    /// The namespace rejects rule creates with a plain 400 while another
    /// operation on the subscription is still running.
    pub fn is_retryable_create(&self) -> bool {
        self.is_retryable() || matches!(self, GatewayError::InvalidRequest(_))
    }

    /// Whether a failed rule delete may succeed later.
    ///
    /// Deletes report 409 while another operation on the subscription is
    /// still running.
    pub fn is_retryable_delete(&self) -> bool {
        self.is_retryable() || self.is_conflict()
    }

    /// Classify an HTTP-style status returned by a namespace client.
    ///
    /// A 400 or 409 whose message says another operation is in progress
    /// becomes [`GatewayError::Busy`].
    pub fn from_status(status: u16, entity: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if matches!(status, 400 | 409) && mentions_operation_in_progress(&message) {
            return GatewayError::Busy {
                entity: entity.to_string(),
            };
        }

        match status {
            400 => GatewayError::InvalidRequest(message),
            401 | 403 => GatewayError::Unauthorized { status, message },
            404 => GatewayError::not_found(entity),
            409 => GatewayError::conflict(entity),
            423 => GatewayError::Busy {
                entity: entity.to_string(),
            },
            429 => GatewayError::Throttled,
            _ => GatewayError::Upstream { status, message },
        }
    }
}

fn mentions_operation_in_progress(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("in progress") || message.contains("another operation")
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::NotFound { .. }
            | GatewayError::Conflict { .. }
            | GatewayError::InvalidRequest(_)
            | GatewayError::Unauthorized { .. } => false,
            GatewayError::Upstream { status, .. } => *status >= 500 || *status == 408,
            GatewayError::Busy { .. }
            | GatewayError::Throttled
            | GatewayError::Timeout(_)
            | GatewayError::Network(_) => true,
        }
    }
}
