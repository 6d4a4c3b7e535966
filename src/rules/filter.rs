//! Filter expressions attached to subscription rules.

use super::{FilterKind, RuleSpec};
use crate::config::FilterConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A rule filter as the namespace stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterExpression {
    /// SQL-like boolean expression
    Sql { expression: String },
    /// Exact match on application properties
    Correlation { properties: BTreeMap<String, String> },
    /// Matches every message
    True,
    /// Matches no message (the default-deny rule)
    False,
}

impl FilterExpression {
    /// Rule kind this expression style belongs to, if any.
    pub fn kind(&self) -> Option<FilterKind> {
        match self {
            FilterExpression::Sql { .. } => Some(FilterKind::TextPattern),
            FilterExpression::Correlation { .. } => Some(FilterKind::StructuredMatch),
            FilterExpression::True | FilterExpression::False => None,
        }
    }
}

/// Builds the canonical filter for a rule and checks live filters against it.
#[derive(Debug, Clone, Default)]
pub struct FilterBuilder {
    config: FilterConfig,
}

impl FilterBuilder {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Canonical filter expression for `rule`.
    ///
    /// Text pattern values are embedded verbatim; `%` and `'` are rejected
    /// earlier by [`validate_rule`](super::validate_rule).
    pub fn build(&self, rule: &RuleSpec) -> FilterExpression {
        match rule {
            RuleSpec::StructuredMatch(value) => FilterExpression::Correlation {
                properties: BTreeMap::from([(
                    self.config.correlation_property.clone(),
                    value.clone(),
                )]),
            },
            RuleSpec::TextPattern(value) => FilterExpression::Sql {
                expression: format!("{}{}{}", self.sql_prefix(), value, SQL_SUFFIX),
            },
        }
    }

    /// Whether a live filter is exactly what [`build`](Self::build) produces.
    pub fn is_equivalent(&self, live: &FilterExpression, rule: &RuleSpec) -> bool {
        *live == self.build(rule)
    }

    /// Recover the rule a canonical filter was built from.
    ///
    /// Returns `None` for filters this crate would never generate.
    pub fn extract(&self, live: &FilterExpression) -> Option<RuleSpec> {
        match live {
            FilterExpression::Correlation { properties } if properties.len() == 1 => properties
                .get(&self.config.correlation_property)
                .filter(|value| !value.is_empty())
                .map(|value| RuleSpec::StructuredMatch(value.clone())),
            FilterExpression::Sql { expression } => {
                let prefix = self.sql_prefix();
                let value = expression.strip_prefix(&prefix)?.strip_suffix(SQL_SUFFIX)?;
                let rule = RuleSpec::new(value, FilterKind::TextPattern);
                super::validate_rule(&rule).ok().map(|_| rule)
            }
            _ => None,
        }
    }

    fn sql_prefix(&self) -> String {
        format!("[{}] LIKE '%", self.config.sql_header)
    }
}

const SQL_SUFFIX: &str = "%'";
