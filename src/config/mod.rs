//! Configuration module for busrules
//!
//! Provides layered configuration loading from files, environment variables, and defaults.
//!
//! # Configuration Precedence
//!
//! 1. Values set by the host when embedding the library (highest priority)
//! 2. Environment variables (`BUSRULES_*`)
//! 3. Configuration file (TOML)
//! 4. Default values (lowest priority)
//!
//! # Example
//!
//! ```rust
//! use busrules::config::BusRulesConfig;
//!
//! let config = BusRulesConfig::default();
//! assert_eq!(config.naming.max_length, 50);
//!
//! let toml = r#"
//! [retry]
//! max_attempts = 3
//! "#;
//! let config: BusRulesConfig = toml::from_str(toml).unwrap();
//! assert_eq!(config.retry.max_attempts, 3);
//! assert_eq!(config.retry.base_delay_ms, 1000);
//! ```

pub mod error;
pub mod logging;
pub mod naming;
pub mod retry;

pub use error::ConfigError;
pub use logging::{LogFormat, LoggingConfig, COMPONENTS};
pub use naming::{FilterConfig, NamingConfig};
pub use retry::{ReconcileConfig, RetryConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Length of a base64url (unpadded) encoding of `bytes` bytes.
pub(crate) fn base64_unpadded_len(bytes: usize) -> usize {
    (bytes * 4).div_ceil(3)
}

/// Unified configuration for endpoint rule reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BusRulesConfig {
    /// Rule name derivation
    pub naming: NamingConfig,
    /// Filter expression shape
    pub filters: FilterConfig,
    /// Backoff around remote calls
    pub retry: RetryConfig,
    /// Pass-level settings
    pub reconcile: ReconcileConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl BusRulesConfig {
    /// Load configuration from a TOML file
    ///
    /// If path is None, returns default configuration.
    /// If path doesn't exist, returns NotFound error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supports BUSRULES_* environment variables for common settings.
    /// Invalid values are silently ignored (defaults are kept).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(attempts) = std::env::var("BUSRULES_RETRY_MAX_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                self.retry.max_attempts = n;
            }
        }
        if let Ok(delay) = std::env::var("BUSRULES_RETRY_BASE_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                self.retry.base_delay_ms = ms;
            }
        }
        if let Ok(timeout) = std::env::var("BUSRULES_PASS_TIMEOUT_SECONDS") {
            if let Ok(secs) = timeout.parse() {
                self.reconcile.pass_timeout_seconds = secs;
            }
        }

        if let Ok(level) = std::env::var("BUSRULES_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("BUSRULES_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.logging.format = f;
            }
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "at least one attempt is required",
            ));
        }

        if self.naming.digest_bytes == 0 || self.naming.digest_bytes > 20 {
            return Err(ConfigError::invalid(
                "naming.digest_bytes",
                "must be between 1 and 20 (SHA-1 digest length)",
            ));
        }

        if self.naming.separator.is_empty() {
            return Err(ConfigError::invalid(
                "naming.separator",
                "separator cannot be empty",
            ));
        }

        let reserved =
            base64_unpadded_len(self.naming.digest_bytes) + self.naming.separator.chars().count();
        if self.naming.max_length <= reserved {
            return Err(ConfigError::invalid(
                "naming.max_length",
                format!(
                    "must leave room for a readable tail after {} reserved characters",
                    reserved
                ),
            ));
        }

        if self.filters.correlation_property.is_empty() {
            return Err(ConfigError::invalid(
                "filters.correlation_property",
                "property name cannot be empty",
            ));
        }

        if self.reconcile.pass_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "reconcile.pass_timeout_seconds",
                "timeout must be non-zero",
            ));
        }

        self.logging.validate()
    }
}
