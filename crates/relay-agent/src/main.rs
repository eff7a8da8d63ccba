//! # relay-agent
//!
//! Relay server binary: loads settings, installs telemetry, wires the
//! connection pool, engine factory and gateway, and serves until Ctrl-C.

#![deny(unsafe_code)]

mod agents;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_pool::ConnectionPool;
use relay_runtime::{ExecutionEngineFactory, FactoryWiring, PooledEmitterFactory};
use relay_server::{RelayServer, ServerConfig};
use relay_settings::RelaySettings;
use relay_telemetry::{TelemetryConfig, init_telemetry};

/// Relay server.
#[derive(Parser, Debug)]
#[command(name = "relay-agent", about = "Multi-user agent event relay")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file. Defaults to `~/.relay/settings.json`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log JSON lines instead of compact text.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Load settings and fold the command-line overrides in.
    fn resolve_settings(&self) -> Result<RelaySettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(relay_settings::settings_path);
        let mut settings = relay_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.resolve_settings()?;

    let telemetry = init_telemetry(&TelemetryConfig {
        level: settings.logging.level.clone(),
        json: settings.logging.json,
        ..TelemetryConfig::default()
    })
    .context("Failed to initialize telemetry")?;

    let pool = ConnectionPool::start(settings.pool.clone());
    let factory = ExecutionEngineFactory::new(settings.factory.clone(), settings.emitter.clone());
    factory
        .configure(FactoryWiring {
            agent_registry: Some(Arc::new(agents::builtin_registry())),
            emitter_factory: Arc::new(PooledEmitterFactory::new(
                Arc::clone(&pool),
                settings.emitter.clone(),
            )),
            pool: Some(Arc::clone(&pool)),
            db: None,
        })
        .context("Failed to configure engine factory")?;

    let config = ServerConfig::from(&settings.server);
    let shutdown_timeout = config.shutdown_timeout;
    let server = RelayServer::new(
        config,
        Arc::clone(&pool),
        factory.clone(),
        telemetry.prometheus().cloned(),
    );
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("relay listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(handle, &factory, &pool, shutdown_timeout)
        .await;
    Ok(())
}
