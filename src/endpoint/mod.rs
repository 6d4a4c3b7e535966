//! Endpoint lifecycle hooks for the host.
//!
//! An endpoint is a queue plus a subscription on a topic that forwards to it.
//! The subscription's rules decide which published messages reach the queue.
//! [`EndpointSync`] exposes the operations a host runtime calls: create,
//! read, reconcile, delete, import and describe.

pub mod error;

pub use error::{EndpointError, PassFailure};

use crate::config::BusRulesConfig;
use crate::gateway::{GatewayError, NamespaceGateway};
use crate::reconcile::{EndpointRef, ReconcileFailure, RuleReconciler};
use crate::retry::RetryingExecutor;
use crate::rules::{validate_rule_set, FilterExpression, RuleSpec};
use crate::state::{self, Existence, PersistedState};
use std::sync::Arc;
use std::time::Duration;

/// Desired configuration of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub topic: String,
    pub endpoint: String,
    pub subscriptions: Vec<RuleSpec>,
    /// Extra queues owned by the endpoint
    pub additional_queues: Vec<String>,
}

impl EndpointSpec {
    pub fn new(topic: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            endpoint: endpoint.into(),
            subscriptions: Vec::new(),
            additional_queues: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = RuleSpec>) -> Self {
        self.subscriptions.extend(rules);
        self
    }

    pub fn with_additional_queues(mut self, queues: impl IntoIterator<Item = String>) -> Self {
        self.additional_queues.extend(queues);
        self
    }

    pub fn target(&self) -> EndpointRef {
        EndpointRef::new(&self.topic, &self.endpoint)
    }

    fn import_id(&self) -> String {
        format!("{},{}", self.topic, self.endpoint)
    }
}

/// A live rule with the rule it was built from, if recognizable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribedRule {
    pub name: String,
    pub filter: FilterExpression,
    pub rule: Option<RuleSpec>,
}

/// Host-facing lifecycle operations for endpoints.
pub struct EndpointSync {
    gateway: Arc<dyn NamespaceGateway>,
    reconciler: RuleReconciler<dyn NamespaceGateway>,
    pass_timeout: Duration,
}

impl EndpointSync {
    pub fn new(gateway: Arc<dyn NamespaceGateway>, config: &BusRulesConfig) -> Self {
        Self {
            reconciler: RuleReconciler::from_config(gateway.clone(), config),
            gateway,
            pass_timeout: Duration::from_secs(config.reconcile.pass_timeout_seconds),
        }
    }

    pub fn with_executor(mut self, executor: RetryingExecutor) -> Self {
        self.reconciler = self.reconciler.with_executor(executor);
        self
    }

    pub fn with_pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }

    /// Create the endpoint from scratch.
    ///
    /// A pre-existing primary queue or endpoint subscription is an error:
    /// it belongs to someone else until imported.
    pub async fn create(&self, spec: &EndpointSpec) -> Result<PersistedState, PassFailure> {
        let mut state = PersistedState::new(&spec.topic, &spec.endpoint);
        state.queue_exists = false;
        state.endpoint_exists = false;

        if let Err(error) = validate_rule_set(&spec.subscriptions, self.reconciler.codec()) {
            return Err(PassFailure::new(state, error));
        }

        match self.create_queue(&spec.endpoint).await {
            Ok(()) => state.queue_exists = true,
            Err(error) if error.is_conflict() => {
                return Err(PassFailure::new(
                    state,
                    EndpointError::QueueAlreadyExists {
                        queue: spec.endpoint.clone(),
                        import_id: spec.import_id(),
                    },
                ))
            }
            Err(error) => {
                return Err(PassFailure::new(
                    state,
                    EndpointError::gateway("create_queue", &spec.endpoint, error),
                ))
            }
        }

        for queue in &spec.additional_queues {
            if let Err(error) = self.ensure_queue(queue).await {
                return Err(PassFailure::new(state, error));
            }
            state.additional_queues.push(queue.clone());
        }

        if spec.subscriptions.is_empty() {
            state.endpoint_exists = true;
            state.reconciled_at = Some(chrono::Utc::now());
            return Ok(state);
        }

        match self
            .create_endpoint_subscription(&spec.topic, &spec.endpoint)
            .await
        {
            Ok(()) => state.endpoint_exists = true,
            Err(error) if error.is_conflict() => {
                return Err(PassFailure::new(
                    state,
                    EndpointError::EndpointAlreadyExists {
                        topic: spec.topic.clone(),
                        endpoint: spec.endpoint.clone(),
                    },
                ))
            }
            Err(error) => {
                return Err(PassFailure::new(
                    state,
                    EndpointError::gateway("create_endpoint", &spec.endpoint, error),
                ))
            }
        }

        self.sync_rules(spec, &state, false).await
    }

    /// Refresh `state` from the namespace without changing anything.
    pub async fn read(&self, state: &PersistedState) -> Result<PersistedState, EndpointError> {
        let gateway = &*self.gateway;
        let executor = self.reconciler.executor();
        let mut refreshed = state.clone();
        refreshed.has_malformed_filters = false;
        refreshed.unrecognized_rules.clear();

        let queue = state.endpoint_name.as_str();
        refreshed.queue_exists = executor
            .execute("queue_exists", || gateway.queue_exists(queue))
            .await
            .map_err(|e| EndpointError::gateway("queue_exists", queue, e))?;
        if !refreshed.queue_exists {
            tracing::warn!(
                endpoint = %state.endpoint_name,
                "Endpoint queue is missing, the endpoint will be recreated"
            );
        }

        if !state.subscriptions.is_empty() {
            let topic = state.topic_name.as_str();
            refreshed.endpoint_exists = executor
                .execute("endpoint_exists", || gateway.endpoint_exists(topic, queue))
                .await
                .map_err(|e| EndpointError::gateway("endpoint_exists", queue, e))?;

            if refreshed.endpoint_exists {
                let (_, diagnosis) = self
                    .reconciler
                    .inspect(&state.target(), &state.subscriptions)
                    .await
                    .map_err(|e| EndpointError::gateway("list_rules", queue, e))?;
                refreshed.has_malformed_filters = diagnosis.has_malformed();
                refreshed.unrecognized_rules = diagnosis.unrecognized;
            } else {
                tracing::warn!(
                    topic,
                    endpoint = queue,
                    "Endpoint subscription is missing, its rules will be recreated"
                );
                refreshed.subscriptions.clear();
            }
        }

        let mut additional_queues = Vec::with_capacity(state.additional_queues.len());
        for name in &state.additional_queues {
            let exists = executor
                .execute("queue_exists", || gateway.queue_exists(name))
                .await
                .map_err(|e| EndpointError::gateway("queue_exists", name, e))?;
            if exists {
                additional_queues.push(name.clone());
            } else {
                tracing::info!(queue = %name, "Additional queue no longer exists");
            }
        }
        refreshed.additional_queues = additional_queues;

        Ok(refreshed)
    }

    /// Converge the endpoint from `previous` to `spec` within the pass deadline.
    ///
    /// On failure the returned state records what was applied, so the next
    /// pass resumes from there. A pass cut short by the deadline leaves
    /// `previous` untouched.
    pub async fn reconcile(
        &self,
        spec: &EndpointSpec,
        previous: &PersistedState,
    ) -> Result<PersistedState, PassFailure> {
        match tokio::time::timeout(self.pass_timeout, self.reconcile_inner(spec, previous)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    topic = %spec.topic,
                    endpoint = %spec.endpoint,
                    timeout_s = self.pass_timeout.as_secs(),
                    "Reconciliation pass timed out"
                );
                Err(PassFailure::new(
                    previous.clone(),
                    EndpointError::Timeout(self.pass_timeout.as_secs()),
                ))
            }
        }
    }

    async fn reconcile_inner(
        &self,
        spec: &EndpointSpec,
        previous: &PersistedState,
    ) -> Result<PersistedState, PassFailure> {
        let flags = previous.pass_flags(&spec.subscriptions);
        let mut state = previous.clone();

        if flags.should_create_queue {
            if let Err(error) = self.ensure_queue(&spec.endpoint).await {
                return Err(PassFailure::new(state, error));
            }
            state.queue_exists = true;
        }

        if flags.should_create_endpoint && !spec.subscriptions.is_empty() {
            match self
                .create_endpoint_subscription(&spec.topic, &spec.endpoint)
                .await
            {
                Ok(()) => {}
                Err(error) if error.is_conflict() => {
                    tracing::info!(
                        topic = %spec.topic,
                        endpoint = %spec.endpoint,
                        "Endpoint subscription already exists"
                    );
                }
                Err(error) => {
                    return Err(PassFailure::new(
                        state,
                        EndpointError::gateway("create_endpoint", &spec.endpoint, error),
                    ))
                }
            }
            state.endpoint_exists = true;
        }

        for queue in spec
            .additional_queues
            .iter()
            .filter(|q| !previous.additional_queues.contains(*q))
        {
            if let Err(error) = self.ensure_queue(queue).await {
                return Err(PassFailure::new(state, error));
            }
            state.additional_queues.push(queue.clone());
        }

        let state = self.sync_rules(spec, &state, flags.should_repair).await?;

        let mut state = state;
        for queue in previous
            .additional_queues
            .iter()
            .filter(|q| !spec.additional_queues.contains(*q))
        {
            if let Err(error) = self.remove_queue(queue).await {
                return Err(PassFailure::new(state, error));
            }
            state.additional_queues.retain(|q| q != queue);
        }

        Ok(state)
    }

    /// Run the rule engine and project its outcome onto `state`.
    async fn sync_rules(
        &self,
        spec: &EndpointSpec,
        state: &PersistedState,
        should_repair: bool,
    ) -> Result<PersistedState, PassFailure> {
        let existence = Existence {
            queue_exists: state.queue_exists,
            endpoint_exists: state.endpoint_exists,
        };

        if spec.subscriptions.is_empty() && state.subscriptions.is_empty() && !should_repair {
            let mut next = state.clone();
            next.reconciled_at = Some(chrono::Utc::now());
            return Ok(next);
        }

        let options = crate::reconcile::PassOptions { should_repair };
        match self
            .reconciler
            .reconcile(&spec.target(), &spec.subscriptions, &state.subscriptions, options)
            .await
        {
            Ok(report) => Ok(state::project(
                &spec.subscriptions,
                state,
                &report,
                existence,
            )),
            Err(ReconcileFailure { report, error }) => Err(PassFailure::new(
                state::project(&spec.subscriptions, state, &report, existence),
                error,
            )),
        }
    }

    /// Remove the endpoint. Entities that are already gone are skipped.
    pub async fn delete(&self, state: &PersistedState) -> Result<(), EndpointError> {
        let gateway = &*self.gateway;
        let executor = self.reconciler.executor();
        let (topic, endpoint) = (state.topic_name.as_str(), state.endpoint_name.as_str());

        self.remove_queue(endpoint).await?;

        executor
            .execute("delete_endpoint", || gateway.delete_endpoint(topic, endpoint))
            .await
            .or_else(ignore_not_found)
            .map_err(|e| EndpointError::gateway("delete_endpoint", endpoint, e))?;

        for queue in &state.additional_queues {
            self.remove_queue(queue).await?;
        }

        tracing::info!(topic, endpoint, "Endpoint deleted");
        Ok(())
    }

    /// Initial state for an existing endpoint, from `topic,endpoint[,filterList]`.
    pub fn import(&self, id: &str) -> Result<PersistedState, EndpointError> {
        let state = state::parse_import_id(id)?;
        validate_rule_set(&state.subscriptions, self.reconciler.codec())?;
        tracing::info!(
            topic = %state.topic_name,
            endpoint = %state.endpoint_name,
            rules = state.subscriptions.len(),
            "Imported endpoint"
        );
        Ok(state)
    }

    /// List the endpoint's live rules with the rules they were built from.
    pub async fn describe(
        &self,
        topic: &str,
        endpoint: &str,
    ) -> Result<Vec<DescribedRule>, EndpointError> {
        let live = self
            .reconciler
            .fetch_live(&EndpointRef::new(topic, endpoint))
            .await
            .map_err(|e| EndpointError::gateway("list_rules", endpoint, e))?;

        Ok(live
            .into_iter()
            .map(|rule| DescribedRule {
                rule: self.reconciler.builder().extract(&rule.filter),
                name: rule.name,
                filter: rule.filter,
            })
            .collect())
    }

    async fn create_queue(&self, queue: &str) -> Result<(), GatewayError> {
        let gateway = &*self.gateway;
        self.reconciler
            .executor()
            .execute("create_queue", || gateway.create_queue(queue))
            .await?;
        tracing::info!(queue, "Created queue");
        Ok(())
    }

    /// Create a queue, accepting one that already exists.
    async fn ensure_queue(&self, queue: &str) -> Result<(), EndpointError> {
        match self.create_queue(queue).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_conflict() => {
                tracing::info!(queue, "Queue already exists");
                Ok(())
            }
            Err(error) => Err(EndpointError::gateway("create_queue", queue, error)),
        }
    }

    async fn remove_queue(&self, queue: &str) -> Result<(), EndpointError> {
        let gateway = &*self.gateway;
        self.reconciler
            .executor()
            .execute("delete_queue", || gateway.delete_queue(queue))
            .await
            .or_else(ignore_not_found)
            .map_err(|e| EndpointError::gateway("delete_queue", queue, e))
    }

    async fn create_endpoint_subscription(
        &self,
        topic: &str,
        endpoint: &str,
    ) -> Result<(), GatewayError> {
        let gateway = &*self.gateway;
        self.reconciler
            .executor()
            .execute("create_endpoint", || {
                gateway.create_endpoint(topic, endpoint, endpoint)
            })
            .await?;
        tracing::info!(topic, endpoint, "Created endpoint subscription");
        Ok(())
    }
}

fn ignore_not_found(error: GatewayError) -> Result<(), GatewayError> {
    if error.is_not_found() {
        Ok(())
    } else {
        Err(error)
    }
}
