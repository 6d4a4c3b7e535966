//! Retry and reconciliation pass configuration

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff applied around every remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay unit; attempt `n` failing sleeps `2^n` units
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
        }
    }
}

/// Settings for a single reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Deadline wrapped around a whole pass at the host boundary
    pub pass_timeout_seconds: u64,
    /// During a repair pass, delete live rules that decode to no desired value
    pub repair_orphans: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pass_timeout_seconds: 600,
            repair_orphans: true,
        }
    }
}
