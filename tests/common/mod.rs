//! Shared test utilities for busrules integration tests.
//!
//! Provides an in-memory namespace wired to a reconciler whose retries never
//! actually sleep.

#![allow(dead_code)]

use busrules::config::BusRulesConfig;
use busrules::endpoint::EndpointSync;
use busrules::gateway::{GatewayOp, InMemoryNamespace};
use busrules::reconcile::{EndpointRef, RuleReconciler};
use busrules::retry::{RecordingSleeper, RetryPolicy, RetryingExecutor};
use busrules::rules::{FilterBuilder, LiveRule, RuleNameCodec, RuleSpec};
use std::sync::Arc;

// =============================================================================
// Well-Known Test Constants
// =============================================================================

pub const TOPIC: &str = "bundle-1";
pub const ENDPOINT: &str = "billing";

// =============================================================================
// Rule Builders
// =============================================================================

pub fn structured(value: &str) -> RuleSpec {
    RuleSpec::StructuredMatch(value.to_string())
}

pub fn text(value: &str) -> RuleSpec {
    RuleSpec::TextPattern(value.to_string())
}

/// Live rule exactly as the engine would have created it.
pub fn canonical(rule: &RuleSpec) -> LiveRule {
    LiveRule::new(
        RuleNameCodec::default().encode(rule.value()),
        FilterBuilder::default().build(rule),
    )
}

pub fn target() -> EndpointRef {
    EndpointRef::new(TOPIC, ENDPOINT)
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub namespace: Arc<InMemoryNamespace>,
    pub sleeper: Arc<RecordingSleeper>,
    pub reconciler: RuleReconciler<InMemoryNamespace>,
}

impl Harness {
    /// Namespace with the endpoint queue and subscription already present.
    pub fn new() -> Self {
        Self::with_namespace(InMemoryNamespace::new())
    }

    pub fn with_namespace(namespace: InMemoryNamespace) -> Self {
        let namespace = Arc::new(namespace);
        namespace.add_queue(ENDPOINT);
        namespace.add_endpoint(TOPIC, ENDPOINT);

        let sleeper = Arc::new(RecordingSleeper::new());
        let reconciler = RuleReconciler::new(namespace.clone()).with_executor(executor(&sleeper));

        Self {
            namespace,
            sleeper,
            reconciler,
        }
    }

    pub fn seed(&self, rule: &RuleSpec) {
        self.namespace.put_rule(TOPIC, ENDPOINT, canonical(rule));
    }

    /// Ops of every mutating call, in order.
    pub fn mutation_ops(&self) -> Vec<GatewayOp> {
        self.namespace.mutations().iter().map(|call| call.op).collect()
    }

    /// Live rule names, default rule excluded.
    pub fn live_names(&self) -> Vec<String> {
        self.namespace
            .rules(TOPIC, ENDPOINT)
            .into_iter()
            .filter(|rule| !rule.is_default())
            .map(|rule| rule.name)
            .collect()
    }
}

pub fn executor(sleeper: &Arc<RecordingSleeper>) -> RetryingExecutor {
    RetryingExecutor::new(RetryPolicy::default(), sleeper.clone())
}

/// Lifecycle surface over `namespace` with non-sleeping retries.
pub fn endpoint_sync(namespace: Arc<InMemoryNamespace>) -> (EndpointSync, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let sync = EndpointSync::new(namespace, &BusRulesConfig::default()).with_executor(executor(&sleeper));
    (sync, sleeper)
}
