//! Persisted endpoint state.
//!
//! The host stores a [`PersistedState`] between passes. It is the only memory
//! the engine has: the rule set recorded here becomes the previous rule set of
//! the next pass, and the drift flags decide whether that pass repairs.

pub mod error;

pub use error::StateError;

use crate::reconcile::{EndpointRef, PassOptions, ReconcileReport};
use crate::rules::{validate_rule, RuleSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version of [`PersistedState`].
pub const SCHEMA_VERSION: u32 = 1;

/// State of one endpoint as the host persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub schema_version: u32,
    pub topic_name: String,
    pub endpoint_name: String,
    /// Rules considered applied
    pub subscriptions: Vec<RuleSpec>,
    #[serde(default)]
    pub additional_queues: Vec<String>,
    pub queue_exists: bool,
    pub endpoint_exists: bool,
    /// A live rule's filter differs from its canonical form
    #[serde(default)]
    pub has_malformed_filters: bool,
    /// Live rule names that match no applied rule
    #[serde(default)]
    pub unrecognized_rules: Vec<String>,
    #[serde(default)]
    pub reconciled_at: Option<DateTime<Utc>>,
}

/// Existence of the endpoint's entities, as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Existence {
    pub queue_exists: bool,
    pub endpoint_exists: bool,
}

impl Existence {
    pub fn present() -> Self {
        Self {
            queue_exists: true,
            endpoint_exists: true,
        }
    }
}

/// What the next pass has to do besides reconciling rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassFlags {
    pub should_create_queue: bool,
    pub should_create_endpoint: bool,
    pub should_repair: bool,
}

impl PassFlags {
    pub fn pass_options(&self) -> PassOptions {
        PassOptions {
            should_repair: self.should_repair,
        }
    }
}

impl PersistedState {
    /// Fresh state for an endpoint that has not been reconciled yet.
    pub fn new(topic: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            topic_name: topic.into(),
            endpoint_name: endpoint.into(),
            subscriptions: Vec::new(),
            additional_queues: Vec::new(),
            queue_exists: true,
            endpoint_exists: true,
            has_malformed_filters: false,
            unrecognized_rules: Vec::new(),
            reconciled_at: None,
        }
    }

    pub fn target(&self) -> EndpointRef {
        EndpointRef::new(&self.topic_name, &self.endpoint_name)
    }

    pub fn existence(&self) -> Existence {
        Existence {
            queue_exists: self.queue_exists,
            endpoint_exists: self.endpoint_exists,
        }
    }

    /// Flags for the next pass towards `desired`.
    ///
    /// An endpoint subscription only exists while it has rules, so adding the
    /// first rule also creates the endpoint.
    pub fn pass_flags(&self, desired: &[RuleSpec]) -> PassFlags {
        PassFlags {
            should_create_queue: !self.queue_exists,
            should_create_endpoint: !self.endpoint_exists
                || (self.subscriptions.is_empty() && !desired.is_empty()),
            should_repair: self.has_malformed_filters || !self.unrecognized_rules.is_empty(),
        }
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a state document, upgrading older schema versions.
    pub fn from_json(document: &str) -> Result<Self, StateError> {
        let value: serde_json::Value = serde_json::from_str(document)?;
        let version = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);

        match version {
            0 => {
                let legacy: StateV0 = serde_json::from_value(value)?;
                tracing::info!(
                    endpoint = %legacy.endpoint_name,
                    subscriptions = legacy.subscriptions.len(),
                    "Upgrading endpoint state from schema version 0"
                );
                Ok(legacy.upgrade())
            }
            1 => Ok(serde_json::from_value(value)?),
            found => Err(StateError::UnsupportedVersion {
                found,
                latest: SCHEMA_VERSION,
            }),
        }
    }
}

/// Schema version 0: subscriptions were plain strings, always text patterns.
#[derive(Debug, Deserialize)]
struct StateV0 {
    topic_name: String,
    endpoint_name: String,
    #[serde(default)]
    subscriptions: Vec<String>,
    #[serde(default)]
    additional_queues: Vec<String>,
    #[serde(default = "default_true")]
    queue_exists: bool,
    #[serde(default = "default_true")]
    endpoint_exists: bool,
    #[serde(default)]
    has_malformed_filters: bool,
}

fn default_true() -> bool {
    true
}

impl StateV0 {
    fn upgrade(self) -> PersistedState {
        PersistedState {
            schema_version: SCHEMA_VERSION,
            topic_name: self.topic_name,
            endpoint_name: self.endpoint_name,
            subscriptions: self
                .subscriptions
                .into_iter()
                .map(RuleSpec::TextPattern)
                .collect(),
            additional_queues: self.additional_queues,
            queue_exists: self.queue_exists,
            endpoint_exists: self.endpoint_exists,
            has_malformed_filters: self.has_malformed_filters,
            unrecognized_rules: Vec::new(),
            reconciled_at: None,
        }
    }
}

/// Fold the outcome of a pass into the state persisted for the next one.
///
/// Drift flags come from the pass's final listing. A pass that aborted before
/// listing keeps the previous flags so the next pass still repairs.
pub fn project(
    desired: &[RuleSpec],
    previous: &PersistedState,
    report: &ReconcileReport,
    existence: Existence,
) -> PersistedState {
    let subscriptions = report.applied(desired, &previous.subscriptions);
    let (has_malformed_filters, unrecognized_rules) = match &report.diagnosis {
        Some(diagnosis) => (diagnosis.has_malformed(), diagnosis.unrecognized.clone()),
        None => (
            previous.has_malformed_filters,
            previous.unrecognized_rules.clone(),
        ),
    };

    PersistedState {
        schema_version: SCHEMA_VERSION,
        topic_name: previous.topic_name.clone(),
        endpoint_name: previous.endpoint_name.clone(),
        subscriptions,
        additional_queues: previous.additional_queues.clone(),
        queue_exists: existence.queue_exists,
        endpoint_exists: existence.endpoint_exists,
        has_malformed_filters,
        unrecognized_rules,
        reconciled_at: Some(Utc::now()),
    }
}

/// Parse an import identifier of the form `topic,endpoint[,filterList]`.
///
/// `filterList` is a `;`-separated list of `value` or `kind:value` entries;
/// bare values are text patterns. No live state is read: the returned state
/// is a guess that the next read or pass corrects.
pub fn parse_import_id(id: &str) -> Result<PersistedState, StateError> {
    let invalid = |reason: &str| StateError::InvalidImportId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = id.splitn(3, ',');
    let topic = parts.next().map(str::trim).unwrap_or_default();
    let endpoint = parts.next().map(str::trim).unwrap_or_default();
    if topic.is_empty() || endpoint.is_empty() {
        return Err(invalid("expected 'topic,endpoint[,filterList]'"));
    }

    let mut state = PersistedState::new(topic, endpoint);
    if let Some(filters) = parts.next() {
        for entry in filters.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let rule: RuleSpec = entry.parse()?;
            validate_rule(&rule)?;
            state.subscriptions.push(rule);
        }
    }

    Ok(state)
}
