//! Server configuration.

use std::time::Duration;

use relay_settings::ServerSettings;

/// Configuration for the relay server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Interval between server-initiated Ping frames.
    pub ping_interval: Duration,
    /// Outbound frame queue per socket.
    pub send_queue_capacity: usize,
    /// How long graceful shutdown waits for the listener to stop.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            ping_interval: settings.ping_interval(),
            send_queue_capacity: settings.send_queue_capacity.max(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
