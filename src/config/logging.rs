//! Logging section: base level, output format and per-module overrides.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Modules of this crate that accept a level override.
pub const COMPONENTS: [&str; 7] = [
    "endpoint",
    "gateway",
    "logging",
    "reconcile",
    "retry",
    "rules",
    "state",
];

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per event, for the host's log collector
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::invalid(
                "logging.format",
                format!("'{}' is neither 'pretty' nor 'json'", s),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Level per crate module, e.g. `reconcile = "debug"`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub component_levels: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            component_levels: BTreeMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Override the level of one crate module.
    pub fn with_component(mut self, component: &str, level: &str) -> Self {
        self.component_levels
            .insert(component.to_string(), level.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_level("logging.level", &self.level)?;
        for (component, level) in &self.component_levels {
            if !COMPONENTS.contains(&component.as_str()) {
                return Err(ConfigError::invalid(
                    "logging.component_levels",
                    format!(
                        "unknown component '{}', expected one of {}",
                        component,
                        COMPONENTS.join(", ")
                    ),
                ));
            }
            check_level(&format!("logging.component_levels.{}", component), level)?;
        }
        Ok(())
    }
}

fn check_level(field: &str, level: &str) -> Result<(), ConfigError> {
    if LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("'{}' is not a log level", level),
        ))
    }
}
