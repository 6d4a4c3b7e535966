//! Rule naming and filter expression configuration

use serde::{Deserialize, Serialize};

/// Constants driving how filter values become remote rule names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Longest rule name the namespace accepts
    pub max_length: usize,
    /// How many leading bytes of the SHA-1 digest form the unique suffix
    pub digest_bytes: usize,
    /// Literal placed between the readable tail and the digest suffix
    pub separator: String,
    /// Replace characters the namespace rejects in rule names
    pub sanitize: bool,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            max_length: 50,
            digest_bytes: 10,
            separator: "--".to_string(),
            sanitize: true,
        }
    }
}

/// Shape of the generated filter expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Application property matched by correlation (structured) filters
    pub correlation_property: String,
    /// Message header matched by the SQL `LIKE` pattern
    pub sql_header: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            correlation_property: "Dg.MessageTypeFullName".to_string(),
            sql_header: "NServiceBus.EnclosedMessageTypes".to_string(),
        }
    }
}
