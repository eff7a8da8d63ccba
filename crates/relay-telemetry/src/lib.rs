//! # relay-telemetry
//!
//! Process-wide observability setup: the `tracing` subscriber, the global
//! Prometheus recorder, and the metric names every crate records under.
//!
//! Call [`init_telemetry`] once at startup and keep the returned
//! [`TelemetryGuard`] for the life of the process.

#![deny(unsafe_code)]

pub mod capture;
pub mod metrics;

use metrics_exporter_prometheus::PrometheusHandle;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Telemetry setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A global subscriber was already installed.
    #[error("tracing subscriber already initialized: {0}")]
    Subscriber(String),
    /// The Prometheus recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Recorder(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive. Overridden by `RUST_LOG`.
    pub level: String,
    /// Per-module level overrides (e.g. `("relay::audit", "warn")`).
    pub module_levels: Vec<(String, String)>,
    /// JSON lines instead of compact human-readable output.
    pub json: bool,
    /// Install the global Prometheus recorder.
    pub prometheus: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: Vec::new(),
            json: false,
            prometheus: true,
        }
    }
}

impl TelemetryConfig {
    /// The filter directive built from `level` and `module_levels`.
    pub fn filter_directive(&self) -> String {
        let mut directive = self.level.to_lowercase();
        for (module, level) in &self.module_levels {
            directive.push_str(&format!(",{module}={}", level.to_lowercase()));
        }
        directive
    }
}

/// Handle to the installed telemetry.
pub struct TelemetryGuard {
    prometheus: Option<PrometheusHandle>,
}

impl TelemetryGuard {
    /// The Prometheus handle, when the recorder was installed.
    pub fn prometheus(&self) -> Option<&PrometheusHandle> {
        self.prometheus.as_ref()
    }
}

impl std::fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGuard")
            .field("prometheus", &self.prometheus.is_some())
            .finish()
    }
}

/// Initialize the global tracing subscriber and, optionally, the Prometheus
/// recorder. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    let prometheus = if config.prometheus {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    Ok(TelemetryGuard { prometheus })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directive_appends_modules() {
        let config = TelemetryConfig {
            level: "INFO".into(),
            module_levels: vec![
                ("relay_pool".into(), "debug".into()),
                ("relay::audit".into(), "WARN".into()),
            ],
            ..Default::default()
        };
        assert_eq!(
            config.filter_directive(),
            "info,relay_pool=debug,relay::audit=warn"
        );
    }

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.filter_directive(), "info");
        assert!(!config.json);
        assert!(config.prometheus);
    }
}
