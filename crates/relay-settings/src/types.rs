//! Settings types.
//!
//! Every section deserializes with `#[serde(default)]`, so a settings file only
//! needs the keys it wants to change. Durations are stored as milliseconds and
//! exposed as [`Duration`] through accessor methods.

use std::time::Duration;

use relay_core::bounded::EvictionPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// HTTP / WebSocket gateway.
    pub server: ServerSettings,
    /// Connection pool admission and reaping.
    pub pool: PoolSettings,
    /// Execution-engine factory limits.
    pub factory: FactorySettings,
    /// Event emitter delivery budget.
    pub emitter: EmitterSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.pool.max_connections_total, "pool.maxConnectionsTotal"),
            (self.pool.max_connections_per_user, "pool.maxConnectionsPerUser"),
            (self.factory.max_active_users, "factory.maxActiveUsers"),
            (self.factory.max_concurrent_per_user, "factory.maxConcurrentPerUser"),
            (self.factory.run_history_limit, "factory.runHistoryLimit"),
            (self.emitter.queue_capacity, "emitter.queueCapacity"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be > 0")));
            }
        }
        if self.pool.max_connections_per_user > self.pool.max_connections_total {
            return Err(SettingsError::InvalidValue(
                "pool.maxConnectionsPerUser exceeds pool.maxConnectionsTotal".into(),
            ));
        }
        Ok(())
    }
}

/// Gateway bind settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Interval between server-initiated ping frames, in milliseconds.
    pub ping_interval_ms: u64,
    /// Outbound frame queue per socket.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            ping_interval_ms: 30_000,
            send_queue_capacity: 256,
        }
    }
}

impl ServerSettings {
    /// Ping interval as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Connection pool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// Global connection cap.
    pub max_connections_total: usize,
    /// Per-user connection cap.
    pub max_connections_per_user: usize,
    /// Inactivity after which the reaper drops a connection, in milliseconds.
    pub stale_timeout_ms: u64,
    /// Reaper scan interval, in milliseconds.
    pub reap_interval_ms: u64,
    /// Audit records kept in memory.
    pub audit_capacity: usize,
    /// What the audit log discards on overflow.
    pub audit_eviction: EvictionPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections_total: 1000,
            max_connections_per_user: 5,
            stale_timeout_ms: 300_000,
            reap_interval_ms: 30_000,
            audit_capacity: 1000,
            audit_eviction: EvictionPolicy::DropOldestHalf,
        }
    }
}

impl PoolSettings {
    /// Stale timeout as a [`Duration`].
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    /// Reaper interval as a [`Duration`].
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Execution-engine factory settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FactorySettings {
    /// Maximum concurrently active request contexts.
    pub max_active_users: usize,
    /// Runs one user may execute at the same time.
    pub max_concurrent_per_user: usize,
    /// When false, every engine gets an uncached, effectively unbounded permit.
    pub permits_enabled: bool,
    /// Timeout applied to each agent invocation, in milliseconds.
    pub execution_timeout_ms: u64,
    /// Process RSS above which engine creation logs a warning, in MiB.
    pub memory_warning_threshold_mb: u64,
    /// Maximum run results kept per context.
    pub run_history_limit: usize,
    /// What run history discards on overflow.
    pub run_history_eviction: EvictionPolicy,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            max_active_users: 100,
            max_concurrent_per_user: 5,
            permits_enabled: true,
            execution_timeout_ms: 300_000,
            memory_warning_threshold_mb: 2048,
            run_history_limit: 100,
            run_history_eviction: EvictionPolicy::DropOldestHalf,
        }
    }
}

impl FactorySettings {
    /// Execution timeout as a [`Duration`].
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

/// Event emitter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmitterSettings {
    /// Pending events per emitter before `notify_*` waits for room.
    pub queue_capacity: usize,
    /// Retries after the first delivery attempt.
    pub max_retries: u32,
    /// Per-attempt send timeout, in milliseconds.
    pub send_timeout_ms: u64,
    /// First retry delay; doubles per attempt, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Retry delay cap, in milliseconds.
    pub retry_max_delay_ms: u64,
    /// How long `cleanup` waits for queued events to drain, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Strings in event payloads longer than this are truncated.
    pub max_string_length: usize,
}

impl Default for EmitterSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_retries: 3,
            send_timeout_ms: 5_000,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 2_000,
            drain_timeout_ms: 2_000,
            max_string_length: relay_core::sanitize::DEFAULT_MAX_STRING_LENGTH,
        }
    }
}

impl EmitterSettings {
    /// Per-attempt send timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Drain timeout as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Delay before retry number `attempt` (zero-based), capped at the max delay.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << attempt.min(31));
        Duration::from_millis(exponential.min(self.retry_max_delay_ms))
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
