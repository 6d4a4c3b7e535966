//! Error types for reconciliation passes.

use crate::gateway::GatewayError;
use crate::rules::RuleError;
use thiserror::Error;

/// Why a reconciliation pass stopped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    /// Desired rule set failed validation; nothing was changed
    #[error("invalid rule set: {0}")]
    InvalidRules(#[from] RuleError),

    /// A namespace call failed after retries
    #[error("{operation} of '{target}' failed: {source}")]
    Gateway {
        operation: &'static str,
        target: String,
        #[source]
        source: GatewayError,
    },
}

impl ReconcileError {
    pub(crate) fn gateway(operation: &'static str, target: &str, source: GatewayError) -> Self {
        ReconcileError::Gateway {
            operation,
            target: target.to_string(),
            source,
        }
    }

    /// Gateway error behind this failure, if any.
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            ReconcileError::Gateway { source, .. } => Some(source),
            ReconcileError::InvalidRules(_) => None,
        }
    }
}
