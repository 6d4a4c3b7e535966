//! busrules - subscription rule reconciliation for message endpoints
//!
//! An endpoint is a queue fed by a subscription on a topic; the subscription's
//! filter rules decide which messages it receives. This library converges
//! those rules on a remote messaging namespace towards a declared rule set,
//! tolerating partial failures, drift and platform limits on rule names.
//!
//! The namespace itself is reached through the [`gateway`] traits, which the
//! embedding host implements.

pub mod config;
pub mod endpoint;
pub mod gateway;
pub mod logging;
pub mod reconcile;
pub mod retry;
pub mod rules;
pub mod state;

pub use config::BusRulesConfig;
pub use endpoint::{EndpointError, EndpointSpec, EndpointSync, PassFailure};
pub use gateway::{EntityGateway, GatewayError, NamespaceGateway, RuleGateway};
pub use reconcile::{EndpointRef, ReconcileReport, RuleReconciler};
pub use rules::{FilterKind, RuleSpec};
pub use state::PersistedState;
