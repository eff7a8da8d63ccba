//! Prometheus recorder and metric names.
//!
//! Metrics are aggregate only. Labels never carry user or connection ids.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::TelemetryError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics/prometheus`.
pub fn install_recorder() -> Result<PrometheusHandle, TelemetryError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::Recorder(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Build a recorder handle without installing it globally.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// ── Connection pool ─────────────────────────────────────────────────────────

/// Registered connections (gauge).
pub const POOL_CONNECTIONS_ACTIVE: &str = "pool_connections_active";
/// Connections registered (counter).
pub const POOL_CONNECTIONS_ADDED_TOTAL: &str = "pool_connections_added_total";
/// Connections unregistered by their owner (counter).
pub const POOL_CONNECTIONS_REMOVED_TOTAL: &str = "pool_connections_removed_total";
/// Connections removed by the reaper (counter, labels: reason).
pub const POOL_CONNECTIONS_REAPED_TOTAL: &str = "pool_connections_reaped_total";
/// Registrations rejected by a cap (counter, labels: scope).
pub const POOL_REJECTIONS_TOTAL: &str = "pool_rejections_total";
/// Accesses with a non-owning user id (counter).
pub const POOL_OWNERSHIP_VIOLATIONS_TOTAL: &str = "pool_ownership_violations_total";

// ── Engine factory ──────────────────────────────────────────────────────────

/// Live request contexts (gauge).
pub const FACTORY_CONTEXTS_ACTIVE: &str = "factory_contexts_active";
/// Engines handed out (counter).
pub const FACTORY_ENGINES_CREATED_TOTAL: &str = "factory_engines_created_total";
/// Engine creations that failed (counter, labels: error_type).
pub const FACTORY_CREATION_FAILURES_TOTAL: &str = "factory_creation_failures_total";
/// Contexts torn down (counter).
pub const FACTORY_CONTEXTS_CLEANED_TOTAL: &str = "factory_contexts_cleaned_total";
/// Engines created with a standalone emitter (counter).
pub const FACTORY_EMITTER_FALLBACKS_TOTAL: &str = "factory_emitter_fallbacks_total";

// ── Engine runs ─────────────────────────────────────────────────────────────

/// Runs currently holding a permit (gauge).
pub const ENGINE_RUNS_ACTIVE: &str = "engine_runs_active";
/// Finished runs (counter, labels: status).
pub const ENGINE_RUNS_TOTAL: &str = "engine_runs_total";
/// Run duration in seconds (histogram, labels: status).
pub const ENGINE_RUN_DURATION_SECONDS: &str = "engine_run_duration_seconds";
/// Time spent waiting for a per-user permit, in seconds (histogram).
pub const ENGINE_PERMIT_WAIT_SECONDS: &str = "engine_permit_wait_seconds";

// ── Emitter ─────────────────────────────────────────────────────────────────

/// Events delivered (counter, labels: event_type).
pub const EMITTER_EVENTS_SENT_TOTAL: &str = "emitter_events_sent_total";
/// Events abandoned after the retry budget (counter).
pub const EMITTER_EVENTS_FAILED_TOTAL: &str = "emitter_events_failed_total";
/// Delivery retries (counter).
pub const EMITTER_RETRIES_TOTAL: &str = "emitter_retries_total";

// ── Gateway ─────────────────────────────────────────────────────────────────

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
