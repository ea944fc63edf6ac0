//! Structured logging setup for hosts embedding the replay engine.
//!
//! The engine itself only emits `tracing` events. Engine diagnostics use the
//! `durable_replay::orchestration` target, the entity dispatch loop uses
//! `durable_replay::entity`, and the replay-safe `durable_*!` macros log user
//! messages under `durable_replay::user`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level target message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// # Example
///
/// ```rust,no_run
/// # use durable_replay::runtime::{ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     ..Default::default()
/// };
/// durable_replay::runtime::init_logging(&config).ok();
/// ```
///
/// `RUST_LOG`, when set, replaces the filter derived from `log_level`.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level applied to this crate's targets (e.g., "info", "debug")
    pub log_level: String,
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            service_name: "durable-replay".to_string(),
        }
    }
}

pub(crate) fn default_filter_expression(level: &str) -> String {
    format!(
        "warn,durable_replay::orchestration={level},durable_replay::entity={level},durable_replay::user={level}"
    )
}

/// Install a global subscriber. Fails if one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}"))?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}"))?,
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}"))?,
    }

    tracing::debug!(
        target: "durable_replay::orchestration",
        service_name = %config.service_name,
        format = ?config.log_format,
        "logging initialized"
    );
    Ok(())
}
