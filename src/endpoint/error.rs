//! Error types for endpoint lifecycle operations.

use crate::gateway::GatewayError;
use crate::reconcile::ReconcileError;
use crate::rules::RuleError;
use crate::state::{PersistedState, StateError};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointError {
    /// Primary queue exists but is not in the host's state
    #[error(
        "queue '{queue}' already exists and is tracked outside of the host; \
         import it with id '{import_id}' to manage it"
    )]
    QueueAlreadyExists { queue: String, import_id: String },

    /// Endpoint subscription exists but is not in the host's state
    #[error(
        "endpoint '{endpoint}' already exists on topic '{topic}' and is tracked outside of \
         the host; import it with id '{topic},{endpoint}' to manage it"
    )]
    EndpointAlreadyExists { topic: String, endpoint: String },

    /// A namespace call failed after retries
    #[error("{operation} of '{target}' failed: {source}")]
    Gateway {
        operation: &'static str,
        target: String,
        #[source]
        source: GatewayError,
    },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    InvalidRules(#[from] RuleError),

    #[error(transparent)]
    State(#[from] StateError),

    /// The pass did not finish within its deadline
    #[error("reconciliation pass exceeded its {0}s deadline")]
    Timeout(u64),
}

impl EndpointError {
    pub(crate) fn gateway(operation: &'static str, target: &str, source: GatewayError) -> Self {
        EndpointError::Gateway {
            operation,
            target: target.to_string(),
            source,
        }
    }
}

/// A failed lifecycle pass, with the state the host should persist anyway.
#[derive(Debug)]
pub struct PassFailure {
    pub state: Box<PersistedState>,
    pub error: EndpointError,
}

impl PassFailure {
    pub(crate) fn new(state: PersistedState, error: impl Into<EndpointError>) -> Self {
        Self {
            state: Box::new(state),
            error: error.into(),
        }
    }
}

impl fmt::Display for PassFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "endpoint '{}' pass failed: {}",
            self.state.endpoint_name, self.error
        )
    }
}

impl std::error::Error for PassFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_conflict_explains_how_to_import() {
        let err = EndpointError::QueueAlreadyExists {
            queue: "billing".to_string(),
            import_id: "events,billing".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("already exists and is tracked outside"));
        assert!(message.contains("'events,billing'"));
    }

    #[test]
    fn gateway_errors_keep_their_source() {
        use std::error::Error as _;
        let err = EndpointError::gateway("create_queue", "billing", GatewayError::Throttled);
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("create_queue of 'billing' failed"));
    }
}
