//! Subscription rule model.
//!
//! A rule is a named filter attached to an endpoint's topic subscription. The
//! name is derived from the filter value by [`RuleNameCodec`], the filter
//! expression by [`FilterBuilder`].

pub mod codec;
pub mod error;
pub mod filter;
pub mod validation;

pub use codec::RuleNameCodec;
pub use error::RuleError;
pub use filter::{FilterBuilder, FilterExpression};
pub use validation::{validate_rule, validate_rule_set};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the rule every subscription is created with. It matches nothing
/// and is never part of a rule set.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Which filter style a rule uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    /// Single application-property match (correlation filter)
    #[serde(rename = "correlation")]
    StructuredMatch,
    /// `LIKE` pattern over the enclosed message types header (SQL filter)
    #[serde(rename = "sql")]
    TextPattern,
}

impl FilterKind {
    /// Persisted spelling of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::StructuredMatch => "correlation",
            FilterKind::TextPattern => "sql",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterKind {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "correlation" | "structured" => Ok(FilterKind::StructuredMatch),
            "sql" | "text" => Ok(FilterKind::TextPattern),
            _ => Err(RuleError::UnknownFilterKind(s.to_string())),
        }
    }
}

/// One desired rule: a filter value tagged with its filter kind.
///
/// Persisted as `{"filter_type": "correlation", "filter": "Orders.Created"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "filter_type", content = "filter")]
pub enum RuleSpec {
    #[serde(rename = "correlation")]
    StructuredMatch(String),
    #[serde(rename = "sql")]
    TextPattern(String),
}

impl RuleSpec {
    pub fn new(value: impl Into<String>, kind: FilterKind) -> Self {
        match kind {
            FilterKind::StructuredMatch => RuleSpec::StructuredMatch(value.into()),
            FilterKind::TextPattern => RuleSpec::TextPattern(value.into()),
        }
    }

    /// The filter value, e.g. a fully qualified message type name.
    pub fn value(&self) -> &str {
        match self {
            RuleSpec::StructuredMatch(value) | RuleSpec::TextPattern(value) => value,
        }
    }

    pub fn kind(&self) -> FilterKind {
        match self {
            RuleSpec::StructuredMatch(_) => FilterKind::StructuredMatch,
            RuleSpec::TextPattern(_) => FilterKind::TextPattern,
        }
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// Parses `kind:value`; a bare value is a text pattern rule.
impl FromStr for RuleSpec {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, value) = match s.split_once(':') {
            Some((kind, value)) => (kind.parse()?, value.trim()),
            None => (FilterKind::TextPattern, s),
        };
        if value.is_empty() {
            return Err(RuleError::EmptyFilterValue);
        }
        Ok(RuleSpec::new(value, kind))
    }
}

/// A rule as it currently exists on the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRule {
    /// Rule name as returned by the platform
    pub name: String,
    /// Raw filter attached to the rule
    pub filter: FilterExpression,
}

impl LiveRule {
    pub fn new(name: impl Into<String>, filter: FilterExpression) -> Self {
        Self {
            name: name.into(),
            filter,
        }
    }

    /// Whether this is the subscription's default-deny rule.
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_RULE_NAME
    }
}
