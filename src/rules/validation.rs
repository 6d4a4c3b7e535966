//! Validation of desired rules before any remote call is made.

use super::{FilterKind, RuleError, RuleNameCodec, RuleSpec};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static QUALIFIED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("qualified name pattern is valid")
});

/// Characters that would change the meaning of a `LIKE` pattern.
const PATTERN_METACHARACTERS: [char; 2] = ['%', '\''];

/// Check a single rule value against the rules of its kind.
pub fn validate_rule(rule: &RuleSpec) -> Result<(), RuleError> {
    let value = rule.value();
    if value.trim().is_empty() {
        return Err(RuleError::EmptyFilterValue);
    }

    match rule {
        RuleSpec::StructuredMatch(_) if !QUALIFIED_NAME.is_match(value) => {
            Err(RuleError::InvalidFilterValue {
                value: value.to_string(),
                kind: FilterKind::StructuredMatch,
                reason: "must be a fully qualified name, e.g. 'MyNamespace.MyEvent'".to_string(),
            })
        }
        RuleSpec::TextPattern(_) if value.contains(PATTERN_METACHARACTERS) => {
            Err(RuleError::InvalidFilterValue {
                value: value.to_string(),
                kind: FilterKind::TextPattern,
                reason: "must not contain '%' or a single quote".to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Check every rule and make sure distinct rules get distinct rule names.
///
/// Repeated identical entries are allowed and tracked independently.
pub fn validate_rule_set(rules: &[RuleSpec], codec: &RuleNameCodec) -> Result<(), RuleError> {
    let mut kinds: HashMap<&str, FilterKind> = HashMap::new();
    let mut names: HashMap<String, &str> = HashMap::new();

    for rule in rules {
        validate_rule(rule)?;

        let value = rule.value();
        match kinds.get(value) {
            Some(kind) if *kind != rule.kind() => {
                return Err(RuleError::ConflictingKinds {
                    value: value.to_string(),
                });
            }
            Some(_) => continue,
            None => {
                kinds.insert(value, rule.kind());
            }
        }

        let identifier = codec.encode(value);
        if let Some(first) = names.get(&identifier) {
            return Err(RuleError::IdentifierCollision {
                identifier,
                first: first.to_string(),
                second: value.to_string(),
            });
        }
        names.insert(identifier, value);
    }

    Ok(())
}
