//! `RelayServer`: Axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::ids::{ConnectionId, UserId};
use relay_pool::{ConnectionPool, PoolStats};
use relay_runtime::{ExecutionEngineFactory, FactoryMetrics};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry.
    pub pool: Arc<ConnectionPool>,
    /// Engine factory for `run` frames.
    pub factory: ExecutionEngineFactory,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Prometheus handle, when a recorder is installed.
    pub prometheus: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The relay server.
pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    /// Create a server over an already-wired pool and factory.
    pub fn new(
        config: ServerConfig,
        pool: Arc<ConnectionPool>,
        factory: ExecutionEngineFactory,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            state: AppState {
                pool,
                factory,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                config: Arc::new(config),
                prometheus,
                start_time: Instant::now(),
            },
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/metrics/prometheus", get(prometheus_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in the background until shutdown is signalled.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "server exited with error");
            }
        });
        info!(%addr, "relay server listening");
        Ok((addr, handle))
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// Query string of `GET /ws`.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Authenticated user the socket belongs to.
    pub user_id: String,
    /// Client-chosen connection id. Generated when absent.
    pub connection_id: Option<String>,
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.user_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "user_id must not be empty").into_response();
    }
    let user_id = UserId::from_raw(params.user_id);
    let connection_id = params
        .connection_id
        .map_or_else(ConnectionId::new, ConnectionId::from_raw);
    debug!(%user_id, %connection_id, "websocket upgrade requested");
    ws.on_upgrade(move |socket| session::run_ws_session(socket, user_id, connection_id, state))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let pool = state.pool.stats();
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        pool.active_connections,
        pool.active_users,
        state.factory.active_context_count(),
    ))
}

/// Body of `GET /metrics`.
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    /// Pool counters.
    pub pool: PoolStats,
    /// Factory counters.
    pub factory: FactoryMetrics,
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        pool: state.pool.stats(),
        factory: state.factory.metrics(),
    })
}

/// GET /metrics/prometheus
async fn prometheus_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "prometheus recorder not installed").into_response(),
    }
}
