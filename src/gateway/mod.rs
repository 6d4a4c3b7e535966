//! Remote namespace gateway.
//!
//! The engine never talks to a messaging namespace directly. It consumes the
//! [`RuleGateway`] and [`EntityGateway`] traits, which a host implements on
//! top of its own management client. Every call made through these traits is
//! wrapped by the [`RetryingExecutor`](crate::retry::RetryingExecutor).
//!
//! [`InMemoryNamespace`] is a complete in-process implementation used by the
//! test suite and for local dry runs.

pub mod error;
pub mod memory;

pub use error::GatewayError;
pub use memory::{Fault, GatewayCall, GatewayOp, InMemoryNamespace};

use crate::rules::{FilterExpression, LiveRule};
use async_trait::async_trait;

/// One page of a rule listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulePage {
    pub rules: Vec<LiveRule>,
    /// Token for the next page; `None` on the last page
    pub continuation: Option<String>,
}

/// Rule management on one topic subscription.
///
/// `endpoint` names the subscription on `topic` that forwards to the
/// endpoint's queue.
#[async_trait]
pub trait RuleGateway: Send + Sync + 'static {
    /// List one page of rules, starting at `continuation` when given.
    async fn list_rules(
        &self,
        topic: &str,
        endpoint: &str,
        continuation: Option<String>,
    ) -> Result<RulePage, GatewayError>;

    /// Fetch a rule by name. `Ok(None)` when it does not exist.
    async fn get_rule(
        &self,
        topic: &str,
        endpoint: &str,
        name: &str,
    ) -> Result<Option<LiveRule>, GatewayError>;

    /// Create a rule. Fails with [`GatewayError::Conflict`] if the name is taken.
    async fn create_rule(
        &self,
        topic: &str,
        endpoint: &str,
        name: &str,
        filter: &FilterExpression,
    ) -> Result<(), GatewayError>;

    /// Replace the filter of an existing rule.
    async fn update_rule(
        &self,
        topic: &str,
        endpoint: &str,
        name: &str,
        filter: &FilterExpression,
    ) -> Result<(), GatewayError>;

    /// Delete a rule. Fails with [`GatewayError::NotFound`] if it is absent.
    async fn delete_rule(&self, topic: &str, endpoint: &str, name: &str)
        -> Result<(), GatewayError>;
}

/// Queue and subscription management.
#[async_trait]
pub trait EntityGateway: Send + Sync + 'static {
    async fn queue_exists(&self, queue: &str) -> Result<bool, GatewayError>;

    /// Create a queue. Fails with [`GatewayError::Conflict`] if it exists.
    async fn create_queue(&self, queue: &str) -> Result<(), GatewayError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), GatewayError>;

    async fn endpoint_exists(&self, topic: &str, endpoint: &str) -> Result<bool, GatewayError>;

    /// Create the endpoint subscription on `topic`, forwarding to `forward_to`.
    ///
    /// The subscription starts with only the default rule, which matches
    /// nothing, so no message is delivered until a rule is added.
    async fn create_endpoint(
        &self,
        topic: &str,
        endpoint: &str,
        forward_to: &str,
    ) -> Result<(), GatewayError>;

    async fn delete_endpoint(&self, topic: &str, endpoint: &str) -> Result<(), GatewayError>;
}

/// A gateway covering both rules and entities.
pub trait NamespaceGateway: RuleGateway + EntityGateway {}

impl<T: RuleGateway + EntityGateway> NamespaceGateway for T {}
