//! Structured logging setup.
//!
//! Events carry `pass_id`, `topic`, `endpoint`, `rule` and `operation` fields
//! so a single pass can be followed through the logs.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// `EnvFilter` directives for the base level plus per-module overrides.
///
/// # Examples
///
/// ```
/// use busrules::config::LoggingConfig;
/// use busrules::logging::build_filter_directives;
///
/// let config = LoggingConfig::default().with_component("reconcile", "debug");
/// assert_eq!(build_filter_directives(&config), "info,busrules::reconcile=debug");
/// ```
pub fn build_filter_directives(config: &LoggingConfig) -> String {
    let mut filter_str = config.level.clone();
    for (component, level) in &config.component_levels {
        filter_str.push_str(&format!(",busrules::{}={}", component, level));
    }
    filter_str
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured directives. Hosts that
/// install their own subscriber should not call this.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter_str = build_filter_directives(config);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
    }

    Ok(())
}

/// Unique id correlating every event of one reconciliation pass.
pub fn generate_pass_id() -> String {
    Uuid::new_v4().to_string()
}
