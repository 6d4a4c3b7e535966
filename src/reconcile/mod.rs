//! Reconciliation engine.
//!
//! One pass converges the rules of a single endpoint subscription from what
//! was previously applied to what is now desired:
//!
//! 1. Fetch the live rules (all pages, default rule excluded)
//! 2. Create new rules, adopting any that already exist
//! 3. Take over rules whose name a new rule needs (kind change, or another
//!    value mapping to the same name)
//! 4. Delete rules no longer desired, tolerating ones already gone
//! 5. Repair drifted or foreign rules, when the previous pass asked for it
//! 6. Re-list and diagnose drift for the next pass
//!
//! Creates always run before deletes, so swapping one rule for another never
//! leaves the endpoint without a route. A rule name shared by an old and a
//! new rule is never deleted: its filter is rewritten in place, or, when the
//! filter kind changes, deleted and immediately recreated.
//!
//! A failing call aborts the pass. The partial [`ReconcileReport`] travels with
//! the error so the caller can persist what was applied; the next pass picks
//! up from there.

pub mod diagnosis;
pub mod error;
pub mod plan;

pub use diagnosis::{diagnose, Diagnosis, MalformedRule};
pub use error::ReconcileError;
pub use plan::{compute_plan, EntryState, PlannedEntry, ReconcilePlan};

use crate::config::BusRulesConfig;
use crate::gateway::{GatewayError, RuleGateway};
use crate::logging::generate_pass_id;
use crate::retry::{RetryPolicy, RetryingExecutor};
use crate::rules::{
    validate_rule_set, FilterBuilder, FilterExpression, LiveRule, RuleNameCodec, RuleSpec,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Topic subscription an endpoint's rules live on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointRef {
    pub topic: String,
    pub endpoint: String,
}

impl EndpointRef {
    pub fn new(topic: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl std::fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.endpoint)
    }
}

/// A mutation (or deliberate non-mutation) performed during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedOperation {
    Created { name: String, rule: RuleSpec },
    /// A rule with the computed name already existed and was kept
    AdoptedExisting {
        name: String,
        rule: RuleSpec,
        /// Whether its filter matched the canonical one
        equivalent: bool,
    },
    Deleted { name: String, rule: RuleSpec },
    /// Delete target was already gone
    AlreadyAbsent { name: String, rule: RuleSpec },
    /// Filter rewritten to its canonical form
    Repaired { name: String, rule: RuleSpec },
    /// Rule not belonging to the desired set was removed
    RemovedOrphan { name: String },
    /// A rule name moved from a previously applied rule to a new one
    TakenOver {
        name: String,
        from: RuleSpec,
        to: RuleSpec,
        /// Whether the live filter had to be rewritten
        rewritten: bool,
    },
}

impl AppliedOperation {
    /// Label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            AppliedOperation::Created { .. } => "create",
            AppliedOperation::AdoptedExisting { .. } => "adopt",
            AppliedOperation::Deleted { .. } => "delete",
            AppliedOperation::AlreadyAbsent { .. } => "already_absent",
            AppliedOperation::Repaired { .. } => "repair",
            AppliedOperation::RemovedOrphan { .. } => "remove_orphan",
            AppliedOperation::TakenOver { .. } => "take_over",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AppliedOperation::Created { name, .. }
            | AppliedOperation::AdoptedExisting { name, .. }
            | AppliedOperation::Deleted { name, .. }
            | AppliedOperation::AlreadyAbsent { name, .. }
            | AppliedOperation::Repaired { name, .. }
            | AppliedOperation::RemovedOrphan { name }
            | AppliedOperation::TakenOver { name, .. } => name,
        }
    }
}

/// Per-pass options derived from the previous pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOptions {
    /// Run the repair phase
    pub should_repair: bool,
}

/// Outcome of a pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub pass_id: String,
    pub plan: ReconcilePlan,
    /// Operations in execution order
    pub operations: Vec<AppliedOperation>,
    /// Rules confirmed present after this pass
    pub created: Vec<RuleSpec>,
    /// Rules confirmed absent after this pass
    pub deleted: Vec<RuleSpec>,
    /// Drift seen on the final listing; `None` if the pass did not get there
    pub diagnosis: Option<Diagnosis>,
    /// Whether every phase ran to completion
    pub completed: bool,
}

impl ReconcileReport {
    fn new(pass_id: String) -> Self {
        Self {
            pass_id,
            ..Self::default()
        }
    }

    /// Number of operations that changed remote state.
    pub fn mutation_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| {
                !matches!(
                    op,
                    AppliedOperation::AdoptedExisting { .. }
                        | AppliedOperation::AlreadyAbsent { .. }
                        | AppliedOperation::TakenOver {
                            rewritten: false,
                            ..
                        }
                )
            })
            .count()
    }

    /// Rules considered applied, starting from `previous`.
    ///
    /// A completed pass has applied `desired` exactly. An aborted pass has
    /// applied `previous`, plus what it created, minus what it deleted.
    pub fn applied(&self, desired: &[RuleSpec], previous: &[RuleSpec]) -> Vec<RuleSpec> {
        if self.completed {
            return desired.to_vec();
        }

        let mut applied: Vec<RuleSpec> = previous
            .iter()
            .filter(|rule| !self.deleted.contains(*rule))
            .cloned()
            .collect();
        for rule in &self.created {
            if !applied.contains(rule) {
                applied.push(rule.clone());
            }
        }
        applied
    }

    /// Count `rule` as removed from the endpoint.
    fn retire(&mut self, rule: &RuleSpec) {
        self.created.retain(|r| r != rule);
        if !self.deleted.contains(rule) {
            self.deleted.push(rule.clone());
        }
    }

    fn record(&mut self, operation: AppliedOperation) {
        metrics::counter!(
            "busrules_rule_operations_total",
            "operation" => operation.label(),
        )
        .increment(1);
        self.operations.push(operation);
    }
}

/// An aborted pass: the error plus everything applied before it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileFailure {
    pub report: Box<ReconcileReport>,
    pub error: ReconcileError,
}

impl std::fmt::Display for ReconcileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reconciliation pass {} aborted after {} operation(s): {}",
            self.report.pass_id,
            self.report.operations.len(),
            self.error
        )
    }
}

impl std::error::Error for ReconcileFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Converges one endpoint's rules through a [`RuleGateway`].
pub struct RuleReconciler<G: RuleGateway + ?Sized> {
    gateway: Arc<G>,
    executor: RetryingExecutor,
    codec: RuleNameCodec,
    builder: FilterBuilder,
    repair_orphans: bool,
}

impl<G: RuleGateway + ?Sized> RuleReconciler<G> {
    /// Reconciler with default naming, filters and retry policy.
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            executor: RetryingExecutor::with_tokio(RetryPolicy::default()),
            codec: RuleNameCodec::default(),
            builder: FilterBuilder::default(),
            repair_orphans: true,
        }
    }

    pub fn from_config(gateway: Arc<G>, config: &BusRulesConfig) -> Self {
        Self {
            gateway,
            executor: RetryingExecutor::with_tokio(RetryPolicy::from_config(&config.retry)),
            codec: RuleNameCodec::new(config.naming.clone()),
            builder: FilterBuilder::new(config.filters.clone()),
            repair_orphans: config.reconcile.repair_orphans,
        }
    }

    pub fn with_executor(mut self, executor: RetryingExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn codec(&self) -> &RuleNameCodec {
        &self.codec
    }

    pub fn builder(&self) -> &FilterBuilder {
        &self.builder
    }

    pub fn executor(&self) -> &RetryingExecutor {
        &self.executor
    }

    /// Every live rule on the endpoint except the default rule.
    pub async fn fetch_live(&self, target: &EndpointRef) -> Result<Vec<LiveRule>, GatewayError> {
        let gateway = &*self.gateway;
        let (topic, endpoint) = (target.topic.as_str(), target.endpoint.as_str());

        let mut rules = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let token = continuation.take();
            let page = self
                .executor
                .execute("list_rules", || {
                    gateway.list_rules(topic, endpoint, token.clone())
                })
                .await?;
            rules.extend(page.rules.into_iter().filter(|rule| !rule.is_default()));
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        Ok(rules)
    }

    /// Fetch the live rules and diagnose them against `known`.
    pub async fn inspect(
        &self,
        target: &EndpointRef,
        known: &[RuleSpec],
    ) -> Result<(Vec<LiveRule>, Diagnosis), GatewayError> {
        let live = self.fetch_live(target).await?;
        let diagnosis = diagnose(&live, known, &self.codec, &self.builder);
        Ok((live, diagnosis))
    }

    /// Run one pass converging `target` from `previous` to `desired`.
    pub async fn reconcile(
        &self,
        target: &EndpointRef,
        desired: &[RuleSpec],
        previous: &[RuleSpec],
        options: PassOptions,
    ) -> Result<ReconcileReport, ReconcileFailure> {
        let started = Instant::now();
        let mut report = ReconcileReport::new(generate_pass_id());

        tracing::info!(
            pass_id = %report.pass_id,
            topic = %target.topic,
            endpoint = %target.endpoint,
            desired = desired.len(),
            previous = previous.len(),
            should_repair = options.should_repair,
            "Reconciliation pass started"
        );

        let result = self
            .run(target, desired, previous, options, &mut report)
            .await;

        metrics::histogram!("busrules_pass_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                report.completed = true;
                tracing::info!(
                    pass_id = %report.pass_id,
                    topic = %target.topic,
                    endpoint = %target.endpoint,
                    operations = report.operations.len(),
                    mutations = report.mutation_count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Reconciliation pass completed"
                );
                Ok(report)
            }
            Err(error) => {
                tracing::error!(
                    pass_id = %report.pass_id,
                    topic = %target.topic,
                    endpoint = %target.endpoint,
                    operations = report.operations.len(),
                    error = %error,
                    "Reconciliation pass aborted"
                );
                Err(ReconcileFailure {
                    report: Box::new(report),
                    error,
                })
            }
        }
    }

    async fn run(
        &self,
        target: &EndpointRef,
        desired: &[RuleSpec],
        previous: &[RuleSpec],
        options: PassOptions,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        validate_rule_set(desired, &self.codec)?;

        let live = self
            .fetch_live(target)
            .await
            .map_err(|e| ReconcileError::gateway("list_rules", &target.endpoint, e))?;
        tracing::debug!(
            pass_id = %report.pass_id,
            endpoint = %target.endpoint,
            live = live.len(),
            "Fetched live rules"
        );

        report.plan = compute_plan(desired, previous, &self.codec);
        let plan = report.plan.clone();

        for rule in plan.creates() {
            self.create_or_adopt(target, rule, report).await?;
        }

        for (old, new) in plan.replacements() {
            self.take_over(target, old, new, report).await?;
        }
        for rule in plan.superseded() {
            report.retire(rule);
        }

        for rule in plan.deletes() {
            self.delete_idempotent(target, rule, report).await?;
        }

        if options.should_repair {
            let touched: HashSet<&str> = report.operations.iter().map(|op| op.name()).collect();
            let untouched: Vec<LiveRule> = live
                .into_iter()
                .filter(|rule| !touched.contains(rule.name.as_str()))
                .collect();
            self.repair(target, desired, &untouched, report).await?;
        }

        let (_, diagnosis) = self
            .inspect(target, desired)
            .await
            .map_err(|e| ReconcileError::gateway("list_rules", &target.endpoint, e))?;
        report.diagnosis = Some(diagnosis);

        Ok(())
    }

    /// Create a rule unless one with its name already exists.
    async fn create_or_adopt(
        &self,
        target: &EndpointRef,
        rule: &RuleSpec,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let name = self.codec.encode(rule.value());
        let filter = self.builder.build(rule);

        if let Some(existing) = self.get_rule(target, &name).await? {
            self.adopt(report, &name, rule, &existing);
            return Ok(());
        }

        let gateway = &*self.gateway;
        let (topic, endpoint) = (target.topic.as_str(), target.endpoint.as_str());
        let created = self
            .executor
            .execute_if("create_rule", GatewayError::is_retryable_create, || {
                gateway.create_rule(topic, endpoint, &name, &filter)
            })
            .await;

        match created {
            Ok(()) => {
                tracing::info!(
                    pass_id = %report.pass_id,
                    endpoint,
                    rule = %name,
                    filter = %rule,
                    operation = "create",
                    "Created rule"
                );
                report.record(AppliedOperation::Created {
                    name,
                    rule: rule.clone(),
                });
                report.created.push(rule.clone());
                Ok(())
            }
            Err(error) if error.is_conflict() => match self.get_rule(target, &name).await? {
                Some(existing) => {
                    self.adopt(report, &name, rule, &existing);
                    Ok(())
                }
                None => Err(ReconcileError::gateway("create_rule", &name, error)),
            },
            Err(error) => Err(ReconcileError::gateway("create_rule", &name, error)),
        }
    }

    fn adopt(&self, report: &mut ReconcileReport, name: &str, rule: &RuleSpec, existing: &LiveRule) {
        let equivalent = self.builder.is_equivalent(&existing.filter, rule);
        tracing::warn!(
            pass_id = %report.pass_id,
            rule = %name,
            filter = %rule,
            equivalent,
            operation = "adopt",
            "Rule already exists remotely, adopting it"
        );
        report.record(AppliedOperation::AdoptedExisting {
            name: name.to_string(),
            rule: rule.clone(),
            equivalent,
        });
        if !report.created.contains(rule) {
            report.created.push(rule.clone());
        }
    }

    /// Delete a rule, treating an already absent rule as success.
    async fn delete_idempotent(
        &self,
        target: &EndpointRef,
        rule: &RuleSpec,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let name = self.codec.encode(rule.value());
        let gateway = &*self.gateway;
        let (topic, endpoint) = (target.topic.as_str(), target.endpoint.as_str());

        let deleted = self
            .executor
            .execute_if("delete_rule", GatewayError::is_retryable_delete, || {
                gateway.delete_rule(topic, endpoint, &name)
            })
            .await;

        let operation = match deleted {
            Ok(()) => AppliedOperation::Deleted {
                name: name.clone(),
                rule: rule.clone(),
            },
            Err(error) if error.is_not_found() => AppliedOperation::AlreadyAbsent {
                name: name.clone(),
                rule: rule.clone(),
            },
            Err(error) => {
                tracing::warn!(
                    pass_id = %report.pass_id,
                    rule = %name,
                    error = %error,
                    "Delete failed, checking whether the rule still exists"
                );
                match self.get_rule(target, &name).await {
                    Ok(None) => AppliedOperation::AlreadyAbsent {
                        name: name.clone(),
                        rule: rule.clone(),
                    },
                    _ => return Err(ReconcileError::gateway("delete_rule", &name, error)),
                }
            }
        };

        tracing::info!(
            pass_id = %report.pass_id,
            endpoint,
            rule = %name,
            filter = %rule,
            operation = operation.label(),
            "Deleted rule"
        );
        report.record(operation);
        report.retire(rule);
        Ok(())
    }

    /// Move the rule name of `old` to `new` without leaving the name unused.
    async fn take_over(
        &self,
        target: &EndpointRef,
        old: &RuleSpec,
        new: &RuleSpec,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let name = self.codec.encode(new.value());

        let rewritten = match self.get_rule(target, &name).await? {
            None => {
                // Nothing to take over; the old rule is already gone
                self.create_or_adopt(target, new, report).await?;
                report.retire(old);
                return Ok(());
            }
            Some(live) if self.builder.is_equivalent(&live.filter, new) => false,
            Some(live) => {
                self.rewrite(target, &name, &live.filter, new).await?;
                true
            }
        };

        tracing::info!(
            pass_id = %report.pass_id,
            endpoint = %target.endpoint,
            rule = %name,
            from = %old,
            to = %new,
            rewritten,
            operation = "take_over",
            "Rule name taken over by a new filter"
        );
        report.record(AppliedOperation::TakenOver {
            name,
            from: old.clone(),
            to: new.clone(),
            rewritten,
        });
        report.retire(old);
        if !report.created.contains(new) {
            report.created.push(new.clone());
        }
        Ok(())
    }

    /// Replace the filter of live rule `name` with the canonical one for `expected`.
    ///
    /// Filters of the same kind are updated in place; a kind change needs a
    /// delete and a create.
    async fn rewrite(
        &self,
        target: &EndpointRef,
        name: &str,
        live: &FilterExpression,
        expected: &RuleSpec,
    ) -> Result<(), ReconcileError> {
        let gateway = &*self.gateway;
        let (topic, endpoint) = (target.topic.as_str(), target.endpoint.as_str());
        let filter = self.builder.build(expected);

        if live.kind() == Some(expected.kind()) {
            return self
                .executor
                .execute("update_rule", || {
                    gateway.update_rule(topic, endpoint, name, &filter)
                })
                .await
                .map_err(|e| ReconcileError::gateway("update_rule", name, e));
        }

        self.executor
            .execute_if("delete_rule", GatewayError::is_retryable_delete, || {
                gateway.delete_rule(topic, endpoint, name)
            })
            .await
            .or_else(|e| if e.is_not_found() { Ok(()) } else { Err(e) })
            .map_err(|e| ReconcileError::gateway("delete_rule", name, e))?;
        self.executor
            .execute_if("create_rule", GatewayError::is_retryable_create, || {
                gateway.create_rule(topic, endpoint, name, &filter)
            })
            .await
            .map_err(|e| ReconcileError::gateway("create_rule", name, e))
    }

    /// Rewrite drifted rules and remove foreign ones.
    async fn repair(
        &self,
        target: &EndpointRef,
        desired: &[RuleSpec],
        live: &[LiveRule],
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let gateway = &*self.gateway;
        let (topic, endpoint) = (target.topic.as_str(), target.endpoint.as_str());

        for rule in live {
            let name = rule.name.as_str();
            let expected = match diagnosis::resolve(&self.codec, desired, name) {
                Ok(Some(expected)) => expected,
                Ok(None) if self.repair_orphans => {
                    self.executor
                        .execute_if("delete_rule", GatewayError::is_retryable_delete, || {
                            gateway.delete_rule(topic, endpoint, name)
                        })
                        .await
                        .or_else(|e| if e.is_not_found() { Ok(()) } else { Err(e) })
                        .map_err(|e| ReconcileError::gateway("delete_rule", name, e))?;
                    tracing::info!(
                        pass_id = %report.pass_id,
                        endpoint,
                        rule = name,
                        operation = "remove_orphan",
                        "Removed rule not in the desired set"
                    );
                    report.record(AppliedOperation::RemovedOrphan {
                        name: name.to_string(),
                    });
                    continue;
                }
                Ok(None) | Err(_) => continue,
            };

            if self.builder.is_equivalent(&rule.filter, expected) {
                continue;
            }

            tracing::debug!(
                pass_id = %report.pass_id,
                rule = name,
                state = ?EntryState::ToRepair,
                "Repairing drifted rule"
            );
            self.rewrite(target, name, &rule.filter, expected).await?;

            tracing::info!(
                pass_id = %report.pass_id,
                endpoint,
                rule = name,
                filter = %expected,
                operation = "repair",
                "Repaired rule filter"
            );
            report.record(AppliedOperation::Repaired {
                name: name.to_string(),
                rule: expected.clone(),
            });
        }

        Ok(())
    }

    async fn get_rule(
        &self,
        target: &EndpointRef,
        name: &str,
    ) -> Result<Option<LiveRule>, ReconcileError> {
        let gateway = &*self.gateway;
        let (topic, endpoint) = (target.topic.as_str(), target.endpoint.as_str());
        self.executor
            .execute("get_rule", || gateway.get_rule(topic, endpoint, name))
            .await
            .or_else(|e| if e.is_not_found() { Ok(None) } else { Err(e) })
            .map_err(|e| ReconcileError::gateway("get_rule", name, e))
    }
}
