//! Drift detection on a live rule listing.

use crate::rules::{FilterBuilder, LiveRule, RuleError, RuleNameCodec, RuleSpec};
use serde::{Deserialize, Serialize};

/// A live rule whose filter differs from the canonical one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedRule {
    pub name: String,
    /// The rule the name decodes to
    pub expected: RuleSpec,
}

/// What a live listing looks like compared to a known rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub malformed: Vec<MalformedRule>,
    /// Names of live rules that decode to no known rule
    pub unrecognized: Vec<String>,
}

impl Diagnosis {
    pub fn has_malformed(&self) -> bool {
        !self.malformed.is_empty()
    }

    /// Whether a repair pass has anything to do.
    pub fn needs_repair(&self) -> bool {
        self.has_malformed() || !self.unrecognized.is_empty()
    }
}

/// Rule a live name decodes to among `known`, if exactly one does.
pub(crate) fn resolve<'a>(
    codec: &RuleNameCodec,
    known: &'a [RuleSpec],
    name: &str,
) -> Result<Option<&'a RuleSpec>, RuleError> {
    let values: Vec<&str> = known.iter().map(RuleSpec::value).collect();
    let decoded = codec.decode(&values, name)?;
    Ok(decoded.and_then(|value| known.iter().find(|rule| rule.value() == value)))
}

/// Compare every live rule against the canonical form of its decoded rule.
///
/// The default rule must already be filtered out of `live`.
pub fn diagnose(
    live: &[LiveRule],
    known: &[RuleSpec],
    codec: &RuleNameCodec,
    builder: &FilterBuilder,
) -> Diagnosis {
    let mut diagnosis = Diagnosis::default();

    for rule in live {
        match resolve(codec, known, &rule.name) {
            Ok(Some(expected)) => {
                if !builder.is_equivalent(&rule.filter, expected) {
                    tracing::warn!(
                        rule = %rule.name,
                        expected = %expected,
                        "Live rule filter does not match its canonical form"
                    );
                    diagnosis.malformed.push(MalformedRule {
                        name: rule.name.clone(),
                        expected: expected.clone(),
                    });
                }
            }
            Ok(None) => {
                tracing::info!(rule = %rule.name, "Live rule is not managed by this endpoint");
                diagnosis.unrecognized.push(rule.name.clone());
            }
            Err(error) => {
                tracing::warn!(rule = %rule.name, error = %error, "Live rule name is ambiguous");
                diagnosis.unrecognized.push(rule.name.clone());
            }
        }
    }

    if diagnosis.has_malformed() {
        metrics::counter!("busrules_malformed_rules_total")
            .increment(diagnosis.malformed.len() as u64);
    }

    diagnosis
}
