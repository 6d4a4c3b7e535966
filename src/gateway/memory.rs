//! In-memory namespace.
//!
//! Behaves like a real namespace for everything the engine relies on
//! (conflicts, not-found, paged listings, default rules) and additionally
//! journals every call and supports fault injection.

use super::{EntityGateway, GatewayError, RuleGateway, RulePage};
use crate::rules::{FilterExpression, LiveRule, DEFAULT_RULE_NAME};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Mutex, MutexGuard};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Gateway operation kinds, as recorded in the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    ListRules,
    GetRule,
    CreateRule,
    UpdateRule,
    DeleteRule,
    QueueExists,
    CreateQueue,
    DeleteQueue,
    EndpointExists,
    CreateEndpoint,
    DeleteEndpoint,
}

impl GatewayOp {
    /// Whether the operation changes namespace state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            GatewayOp::CreateRule
                | GatewayOp::UpdateRule
                | GatewayOp::DeleteRule
                | GatewayOp::CreateQueue
                | GatewayOp::DeleteQueue
                | GatewayOp::CreateEndpoint
                | GatewayOp::DeleteEndpoint
        )
    }
}

/// One journaled call. `target` is the rule, queue or endpoint name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub op: GatewayOp,
    pub target: String,
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub struct Fault {
    op: GatewayOp,
    target: Option<String>,
    remaining: u32,
    error: GatewayError,
    apply_first: bool,
}

impl Fault {
    /// Fail the next call of `op` with `error`.
    pub fn fail(op: GatewayOp, error: GatewayError) -> Self {
        Self {
            op,
            target: None,
            remaining: 1,
            error,
            apply_first: false,
        }
    }

    /// Fail the next `times` matching calls.
    pub fn times(mut self, times: u32) -> Self {
        self.remaining = times;
        self
    }

    /// Only match calls for this target.
    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Perform the operation, then report the failure anyway.
    ///
    /// Models a request that succeeded remotely but whose response was lost.
    pub fn after_applying(mut self) -> Self {
        self.apply_first = true;
        self
    }

    fn matches(&self, op: GatewayOp, target: &str) -> bool {
        self.remaining > 0
            && self.op == op
            && self.target.as_deref().is_none_or(|t| t == target)
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    forward_to: String,
    rules: Vec<LiveRule>,
}

impl Subscription {
    fn new(forward_to: &str) -> Self {
        Self {
            forward_to: forward_to.to_string(),
            rules: vec![LiveRule::new(DEFAULT_RULE_NAME, FilterExpression::False)],
        }
    }
}

/// In-process namespace implementing both gateway traits.
#[derive(Debug)]
pub struct InMemoryNamespace {
    queues: DashSet<String>,
    subscriptions: DashMap<(String, String), Subscription>,
    page_size: usize,
    faults: Mutex<Vec<Fault>>,
    journal: Mutex<Vec<GatewayCall>>,
}

impl Default for InMemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNamespace {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Namespace that returns at most `page_size` rules per listing page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            queues: DashSet::new(),
            subscriptions: DashMap::new(),
            page_size: page_size.max(1),
            faults: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn add_queue(&self, queue: &str) {
        self.queues.insert(queue.to_string());
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.contains(queue)
    }

    /// Create an endpoint subscription forwarding to a queue of the same name.
    pub fn add_endpoint(&self, topic: &str, endpoint: &str) {
        self.subscriptions
            .entry(key(topic, endpoint))
            .or_insert_with(|| Subscription::new(endpoint));
    }

    pub fn has_endpoint(&self, topic: &str, endpoint: &str) -> bool {
        self.subscriptions.contains_key(&key(topic, endpoint))
    }

    /// Queue the endpoint subscription forwards to.
    pub fn forward_target(&self, topic: &str, endpoint: &str) -> Option<String> {
        self.subscriptions
            .get(&key(topic, endpoint))
            .map(|sub| sub.forward_to.clone())
    }

    /// Insert or overwrite a rule without going through the journal.
    ///
    /// Creates the endpoint subscription if needed.
    pub fn put_rule(&self, topic: &str, endpoint: &str, rule: LiveRule) {
        let mut sub = self
            .subscriptions
            .entry(key(topic, endpoint))
            .or_insert_with(|| Subscription::new(endpoint));
        match sub.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => existing.filter = rule.filter,
            None => sub.rules.push(rule),
        }
    }

    /// All rules on the endpoint, default rule included, in creation order.
    pub fn rules(&self, topic: &str, endpoint: &str) -> Vec<LiveRule> {
        self.subscriptions
            .get(&key(topic, endpoint))
            .map(|sub| sub.rules.clone())
            .unwrap_or_default()
    }

    pub fn rule(&self, topic: &str, endpoint: &str, name: &str) -> Option<LiveRule> {
        self.subscriptions
            .get(&key(topic, endpoint))
            .and_then(|sub| sub.rules.iter().find(|r| r.name == name).cloned())
    }

    /// Schedule a failure for upcoming calls.
    pub fn inject(&self, fault: Fault) {
        lock(&self.faults).push(fault);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.journal).clone()
    }

    /// Only the calls that change namespace state.
    pub fn mutations(&self) -> Vec<GatewayCall> {
        lock(&self.journal)
            .iter()
            .filter(|call| call.op.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.journal).clear();
    }

    /// Journal the call and consume a matching fault, if any.
    fn enter(&self, op: GatewayOp, target: &str) -> Option<Fault> {
        lock(&self.journal).push(GatewayCall {
            op,
            target: target.to_string(),
        });

        let mut faults = lock(&self.faults);
        let index = faults.iter().position(|f| f.matches(op, target))?;
        faults[index].remaining -= 1;
        let fault = faults[index].clone();
        if faults[index].remaining == 0 {
            faults.remove(index);
        }
        Some(fault)
    }

    /// Run `apply` unless a fault intercepts the call.
    fn guarded<T>(
        &self,
        op: GatewayOp,
        target: &str,
        apply: impl FnOnce() -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        match self.enter(op, target) {
            None => apply(),
            Some(fault) if fault.apply_first => {
                let _ = apply();
                Err(fault.error)
            }
            Some(fault) => Err(fault.error),
        }
    }

    fn with_subscription<T>(
        &self,
        topic: &str,
        endpoint: &str,
        f: impl FnOnce(&mut Subscription) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let mut sub = self
            .subscriptions
            .get_mut(&key(topic, endpoint))
            .ok_or_else(|| GatewayError::not_found(format!("endpoint '{}/{}'", topic, endpoint)))?;
        f(&mut sub)
    }
}

fn key(topic: &str, endpoint: &str) -> (String, String) {
    (topic.to_string(), endpoint.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RuleGateway for InMemoryNamespace {
    async fn list_rules(
        &self,
        topic: &str,
        endpoint: &str,
        continuation: Option<String>,
    ) -> Result<RulePage, GatewayError> {
        self.guarded(GatewayOp::ListRules, endpoint, || {
            let start = match continuation.as_deref() {
                Some(token) => token.parse::<usize>().map_err(|_| {
                    GatewayError::InvalidRequest(format!("bad continuation token '{}'", token))
                })?,
                None => 0,
            };
            self.with_subscription(topic, endpoint, |sub| {
                let end = (start + self.page_size).min(sub.rules.len());
                let rules = sub.rules.get(start..end).unwrap_or_default().to_vec();
                let continuation = (end < sub.rules.len()).then(|| end.to_string());
                Ok(RulePage {
                    rules,
                    continuation,
                })
            })
        })
    }

    async fn get_rule(
        &self,
        topic: &str,
        endpoint: &str,
        name: &str,
    ) -> Result<Option<LiveRule>, GatewayError> {
        self.guarded(GatewayOp::GetRule, name, || {
            self.with_subscription(topic, endpoint, |sub| {
                Ok(sub.rules.iter().find(|r| r.name == name).cloned())
            })
        })
    }

    async fn create_rule(
        &self,
        topic: &str,
        endpoint: &str,
        name: &str,
        filter: &FilterExpression,
    ) -> Result<(), GatewayError> {
        self.guarded(GatewayOp::CreateRule, name, || {
            self.with_subscription(topic, endpoint, |sub| {
                if sub.rules.iter().any(|r| r.name == name) {
                    return Err(GatewayError::conflict(format!("rule '{}'", name)));
                }
                sub.rules.push(LiveRule::new(name, filter.clone()));
                Ok(())
            })
        })
    }

    async fn update_rule(
        &self,
        topic: &str,
        endpoint: &str,
        name: &str,
        filter: &FilterExpression,
    ) -> Result<(), GatewayError> {
        self.guarded(GatewayOp::UpdateRule, name, || {
            self.with_subscription(topic, endpoint, |sub| {
                let rule = sub
                    .rules
                    .iter_mut()
                    .find(|r| r.name == name)
                    .ok_or_else(|| GatewayError::not_found(format!("rule '{}'", name)))?;
                rule.filter = filter.clone();
                Ok(())
            })
        })
    }

    async fn delete_rule(
        &self,
        topic: &str,
        endpoint: &str,
        name: &str,
    ) -> Result<(), GatewayError> {
        self.guarded(GatewayOp::DeleteRule, name, || {
            self.with_subscription(topic, endpoint, |sub| {
                let before = sub.rules.len();
                sub.rules.retain(|r| r.name != name);
                if sub.rules.len() == before {
                    return Err(GatewayError::not_found(format!("rule '{}'", name)));
                }
                Ok(())
            })
        })
    }
}

#[async_trait]
impl EntityGateway for InMemoryNamespace {
    async fn queue_exists(&self, queue: &str) -> Result<bool, GatewayError> {
        self.guarded(GatewayOp::QueueExists, queue, || Ok(self.has_queue(queue)))
    }

    async fn create_queue(&self, queue: &str) -> Result<(), GatewayError> {
        self.guarded(GatewayOp::CreateQueue, queue, || {
            if !self.queues.insert(queue.to_string()) {
                return Err(GatewayError::conflict(format!("queue '{}'", queue)));
            }
            Ok(())
        })
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), GatewayError> {
        self.guarded(GatewayOp::DeleteQueue, queue, || {
            self.queues
                .remove(queue)
                .map(|_| ())
                .ok_or_else(|| GatewayError::not_found(format!("queue '{}'", queue)))
        })
    }

    async fn endpoint_exists(&self, topic: &str, endpoint: &str) -> Result<bool, GatewayError> {
        self.guarded(GatewayOp::EndpointExists, endpoint, || {
            Ok(self.has_endpoint(topic, endpoint))
        })
    }

    async fn create_endpoint(
        &self,
        topic: &str,
        endpoint: &str,
        forward_to: &str,
    ) -> Result<(), GatewayError> {
        self.guarded(GatewayOp::CreateEndpoint, endpoint, || {
            if !self.has_queue(forward_to) {
                return Err(GatewayError::not_found(format!("queue '{}'", forward_to)));
            }
            match self.subscriptions.entry(key(topic, endpoint)) {
                dashmap::mapref::entry::Entry::Occupied(_) => Err(GatewayError::conflict(
                    format!("endpoint '{}/{}'", topic, endpoint),
                )),
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(Subscription::new(forward_to));
                    Ok(())
                }
            }
        })
    }

    async fn delete_endpoint(&self, topic: &str, endpoint: &str) -> Result<(), GatewayError> {
        self.guarded(GatewayOp::DeleteEndpoint, endpoint, || {
            self.subscriptions
                .remove(&key(topic, endpoint))
                .map(|_| ())
                .ok_or_else(|| {
                    GatewayError::not_found(format!("endpoint '{}/{}'", topic, endpoint))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(expression: &str) -> FilterExpression {
        FilterExpression::Sql {
            expression: expression.to_string(),
        }
    }

    #[tokio::test]
    async fn new_endpoint_has_only_the_default_rule() {
        let ns = InMemoryNamespace::new();
        ns.create_queue("orders").await.unwrap();
        ns.create_endpoint("events", "orders", "orders").await.unwrap();

        let page = ns.list_rules("events", "orders", None).await.unwrap();
        assert_eq!(page.rules.len(), 1);
        assert!(page.rules[0].is_default());
        assert_eq!(page.rules[0].filter, FilterExpression::False);
        assert_eq!(ns.forward_target("events", "orders").as_deref(), Some("orders"));
    }

    #[tokio::test]
    async fn create_endpoint_requires_the_target_queue() {
        let ns = InMemoryNamespace::new();
        let err = ns.create_endpoint("events", "orders", "orders").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn duplicate_creates_conflict() {
        let ns = InMemoryNamespace::new();
        ns.add_endpoint("events", "orders");
        ns.create_rule("events", "orders", "A", &sql("1=1")).await.unwrap();

        let err = ns
            .create_rule("events", "orders", "A", &sql("1=1"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        ns.create_queue("q").await.unwrap();
        assert!(ns.create_queue("q").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn deleting_a_missing_rule_is_not_found() {
        let ns = InMemoryNamespace::new();
        ns.add_endpoint("events", "orders");
        let err = ns.delete_rule("events", "orders", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn listing_is_paged() {
        let ns = InMemoryNamespace::with_page_size(2);
        for name in ["A", "B", "C", "D"] {
            ns.put_rule("events", "orders", LiveRule::new(name, sql(name)));
        }

        let mut names = Vec::new();
        let mut continuation = None;
        let mut pages = 0;
        loop {
            let page = ns.list_rules("events", "orders", continuation).await.unwrap();
            pages += 1;
            names.extend(page.rules.into_iter().map(|r| r.name));
            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }

        assert_eq!(pages, 3);
        assert_eq!(names, vec![DEFAULT_RULE_NAME, "A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn faults_fire_the_requested_number_of_times() {
        let ns = InMemoryNamespace::new();
        ns.add_endpoint("events", "orders");
        ns.inject(Fault::fail(GatewayOp::CreateRule, GatewayError::Throttled).times(2));

        for _ in 0..2 {
            assert_eq!(
                ns.create_rule("events", "orders", "A", &sql("x")).await,
                Err(GatewayError::Throttled)
            );
        }
        assert!(ns.create_rule("events", "orders", "A", &sql("x")).await.is_ok());
    }

    #[tokio::test]
    async fn targeted_faults_ignore_other_targets() {
        let ns = InMemoryNamespace::new();
        ns.add_endpoint("events", "orders");
        ns.inject(Fault::fail(GatewayOp::CreateRule, GatewayError::Throttled).on("B"));

        assert!(ns.create_rule("events", "orders", "A", &sql("a")).await.is_ok());
        assert!(ns.create_rule("events", "orders", "B", &sql("b")).await.is_err());
    }

    #[tokio::test]
    async fn applied_faults_mutate_before_failing() {
        let ns = InMemoryNamespace::new();
        ns.add_endpoint("events", "orders");
        ns.put_rule("events", "orders", LiveRule::new("A", sql("a")));
        ns.inject(
            Fault::fail(GatewayOp::DeleteRule, GatewayError::Timeout(100)).after_applying(),
        );

        assert!(ns.delete_rule("events", "orders", "A").await.is_err());
        assert!(ns.rule("events", "orders", "A").is_none());
    }

    #[tokio::test]
    async fn journal_separates_mutations() {
        let ns = InMemoryNamespace::new();
        ns.add_endpoint("events", "orders");
        ns.get_rule("events", "orders", "A").await.unwrap();
        ns.create_rule("events", "orders", "A", &sql("a")).await.unwrap();

        assert_eq!(ns.calls().len(), 2);
        assert_eq!(
            ns.mutations(),
            vec![GatewayCall {
                op: GatewayOp::CreateRule,
                target: "A".to_string()
            }]
        );

        ns.clear_calls();
        assert!(ns.calls().is_empty());
    }
}
