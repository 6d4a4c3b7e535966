//! Error types for rule values and rule names.

use super::FilterKind;
use thiserror::Error;

/// Errors raised while validating filter values or decoding rule names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// A filter value was empty.
    #[error("filter value cannot be empty")]
    EmptyFilterValue,

    /// A filter value is not acceptable for its kind.
    #[error("invalid {kind} filter value '{value}': {reason}")]
    InvalidFilterValue {
        value: String,
        kind: FilterKind,
        reason: String,
    },

    /// A filter kind string did not name a supported kind.
    #[error("unknown filter kind '{0}', expected 'correlation' or 'sql'")]
    UnknownFilterKind(String),

    /// Two distinct desired values would be stored under the same rule name.
    #[error("filter values '{first}' and '{second}' both map to rule name '{identifier}'")]
    IdentifierCollision {
        identifier: String,
        first: String,
        second: String,
    },

    /// The same value is desired under both filter kinds.
    #[error("filter value '{value}' is declared with more than one filter kind")]
    ConflictingKinds { value: String },

    /// A live rule name decodes to more than one known value.
    #[error("rule name '{identifier}' matches several known filter values: {candidates:?}")]
    AmbiguousIdentifier {
        identifier: String,
        candidates: Vec<String>,
    },
}
