//! Tracing subscriber setup for worker processes.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How a worker process logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default level, overridden by `RUST_LOG` when set.
    pub level: String,
    /// Emit one JSON object per event instead of text.
    pub json: bool,
    /// Attached to every event when set.
    pub worker_id: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            json: false,
            worker_id: None,
        }
    }
}

/// Map level names such as `WARNING` or `CRITICAL` onto tracing's levels.
pub fn normalize_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "notset" | "" => "trace".to_string(),
        other => other.to_string(),
    }
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(normalize_level(&config.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber.
///
/// Returns `false` if one was already installed, which leaves it in place.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let registry = tracing_subscriber::registry().with(filter(config));
    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .is_ok()
    } else {
        registry.with(fmt::layer()).try_init().is_ok()
    };
    if installed {
        tracing::debug!(
            level = %config.level,
            json = config.json,
            "Tracing initialized"
        );
    }
    installed
}

/// Span every worker event is recorded under.
pub fn worker_span(config: &LoggingConfig) -> tracing::Span {
    match &config.worker_id {
        Some(worker_id) => tracing::info_span!("worker", worker_id = %worker_id),
        None => tracing::info_span!("worker"),
    }
}
