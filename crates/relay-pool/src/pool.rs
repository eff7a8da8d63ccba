//! Connection registry with admission control and ownership checks.
//!
//! Every lookup takes the caller's user id. A mismatch is answered exactly
//! like "not found" and leaves one [`AuditKind::OwnershipViolation`] record,
//! so callers cannot probe for other users' connections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use relay_core::audit::{AuditKind, AuditLog, AuditRecord};
use relay_core::errors::CapacityScope;
use relay_core::ids::{ConnectionId, UserId};
use relay_settings::PoolSettings;
use relay_telemetry::metrics as names;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::reaper;
use crate::transport::Transport;

/// Aggregate pool counters. Contains no user or connection identifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Registered connections.
    pub active_connections: usize,
    /// Users with at least one registered connection.
    pub active_users: usize,
    /// Highest `active_connections` seen.
    pub peak_connections: usize,
    /// Successful registrations.
    pub total_added: u64,
    /// Owner-initiated removals and dead connections dropped on lookup.
    pub total_removed: u64,
    /// Connections removed by the reaper.
    pub total_reaped: u64,
    /// Registrations rejected by a cap.
    pub total_rejected: u64,
    /// Lookups with a non-owning user id.
    pub ownership_violations: u64,
    /// Configured global cap.
    pub max_connections_total: usize,
    /// Configured per-user cap.
    pub max_connections_per_user: usize,
}

#[derive(Default)]
struct PoolState {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl PoolState {
    fn user_count(&self, user_id: &UserId) -> usize {
        self.by_user.get(user_id).map_or(0, HashSet::len)
    }

    /// Remove `connection_id` if it still maps to `expected`.
    fn detach(&mut self, connection_id: &ConnectionId, expected: &Arc<Connection>) -> bool {
        match self.by_id.get(connection_id) {
            Some(current) if Arc::ptr_eq(current, expected) => {}
            _ => return false,
        }
        let _ = self.by_id.remove(connection_id);
        let user_id = expected.user_id();
        if let Some(ids) = self.by_user.get_mut(user_id) {
            let _ = ids.remove(connection_id);
            if ids.is_empty() {
                let _ = self.by_user.remove(user_id);
            }
        }
        true
    }
}

#[derive(Default)]
struct Counters {
    added: AtomicU64,
    removed: AtomicU64,
    reaped: AtomicU64,
    rejected: AtomicU64,
    ownership_violations: AtomicU64,
    peak: AtomicUsize,
}

enum Lookup {
    Missing,
    Foreign,
    Owned(Arc<Connection>),
}

/// The per-process connection pool.
pub struct ConnectionPool {
    settings: PoolSettings,
    state: RwLock<PoolState>,
    audit: Mutex<AuditLog>,
    counters: Counters,
    cancel: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create the pool and spawn its reaper. Must be called inside a Tokio
    /// runtime.
    pub fn start(settings: PoolSettings) -> Arc<Self> {
        let reap_interval = settings.reap_interval();
        let pool = Arc::new(Self {
            audit: Mutex::new(AuditLog::new(settings.audit_capacity, settings.audit_eviction)),
            settings,
            state: RwLock::new(PoolState::default()),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
            reaper: Mutex::new(None),
        });
        let handle = reaper::spawn(Arc::downgrade(&pool), reap_interval, pool.cancel.clone());
        *pool.reaper.lock() = Some(handle);
        info!(
            max_total = pool.settings.max_connections_total,
            max_per_user = pool.settings.max_connections_per_user,
            "connection pool started"
        );
        pool
    }

    /// Register a connection.
    ///
    /// Returns `false` when a cap would be exceeded, the transport is not
    /// connected, the id is already registered, or the pool is shut down.
    pub fn add(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        transport: Arc<dyn Transport>,
        metadata: Map<String, Value>,
    ) -> bool {
        if self.cancel.is_cancelled() {
            debug!(%connection_id, "pool shut down, rejecting connection");
            return false;
        }
        if !transport.is_connected() {
            debug!(%connection_id, "transport not connected, rejecting connection");
            return false;
        }

        let rejection = {
            let mut state = self.state.write();
            if state.by_id.contains_key(&connection_id) {
                debug!(%connection_id, "connection id already registered");
                return false;
            }
            if state.by_id.len() >= self.settings.max_connections_total {
                Some((CapacityScope::GlobalConnections, self.settings.max_connections_total))
            } else if state.user_count(&user_id) >= self.settings.max_connections_per_user {
                Some((CapacityScope::UserConnections, self.settings.max_connections_per_user))
            } else {
                let conn = Arc::new(Connection::new(
                    connection_id.clone(),
                    user_id.clone(),
                    transport,
                    metadata,
                ));
                let _ = state.by_id.insert(connection_id.clone(), conn);
                let _ = state
                    .by_user
                    .entry(user_id.clone())
                    .or_default()
                    .insert(connection_id.clone());
                let active = state.by_id.len();
                let _ = self.counters.peak.fetch_max(active, Ordering::Relaxed);
                gauge!(names::POOL_CONNECTIONS_ACTIVE).set(active as f64);
                None
            }
        };

        if let Some((scope, limit)) = rejection {
            let _ = self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            counter!(names::POOL_REJECTIONS_TOTAL, "scope" => scope.to_string()).increment(1);
            let _ = self.audit.lock().record(
                AuditKind::CapacityRejected,
                &connection_id,
                &user_id,
                format!("{scope} limit {limit}"),
            );
            return false;
        }

        let _ = self.counters.added.fetch_add(1, Ordering::Relaxed);
        counter!(names::POOL_CONNECTIONS_ADDED_TOTAL).increment(1);
        debug!(%connection_id, %user_id, "connection registered");
        true
    }

    /// Deregister a connection owned by `user_id`.
    pub fn remove(&self, connection_id: &ConnectionId, user_id: &UserId) -> bool {
        match self.lookup(connection_id, user_id, "remove") {
            Lookup::Owned(conn) => {
                let removed = self.detach(connection_id, &conn);
                if removed {
                    let _ = self.counters.removed.fetch_add(1, Ordering::Relaxed);
                    counter!(names::POOL_CONNECTIONS_REMOVED_TOTAL).increment(1);
                    debug!(%connection_id, "connection removed");
                }
                removed
            }
            Lookup::Missing | Lookup::Foreign => false,
        }
    }

    /// Fetch a live connection owned by `user_id`.
    ///
    /// Probes the transport; a dead connection is dropped from the pool and
    /// `None` is returned. Success records activity.
    pub async fn get(&self, connection_id: &ConnectionId, user_id: &UserId) -> Option<Arc<Connection>> {
        let Lookup::Owned(conn) = self.lookup(connection_id, user_id, "get") else {
            return None;
        };
        if !conn.probe().await {
            if self.detach(connection_id, &conn) {
                let _ = self.counters.removed.fetch_add(1, Ordering::Relaxed);
                debug!(%connection_id, "dead connection dropped on lookup");
            }
            return None;
        }
        conn.touch();
        Some(conn)
    }

    /// Live connections of one user. Disconnected entries are pruned.
    pub fn list_for_user(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let conns: Vec<Arc<Connection>> = {
            let state = self.state.read();
            state
                .by_user
                .get(user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| state.by_id.get(id).cloned())
                .collect()
        };
        let (live, dead): (Vec<_>, Vec<_>) = conns.into_iter().partition(|c| c.is_connected());
        for conn in &dead {
            if self.detach(conn.id(), conn) {
                let _ = self.counters.removed.fetch_add(1, Ordering::Relaxed);
            }
        }
        live
    }

    /// Number of registered connections for one user.
    pub fn connection_count_for_user(&self, user_id: &UserId) -> usize {
        self.state.read().user_count(user_id)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> PoolStats {
        let (active_connections, active_users) = {
            let state = self.state.read();
            (state.by_id.len(), state.by_user.len())
        };
        PoolStats {
            active_connections,
            active_users,
            peak_connections: self.counters.peak.load(Ordering::Relaxed),
            total_added: self.counters.added.load(Ordering::Relaxed),
            total_removed: self.counters.removed.load(Ordering::Relaxed),
            total_reaped: self.counters.reaped.load(Ordering::Relaxed),
            total_rejected: self.counters.rejected.load(Ordering::Relaxed),
            ownership_violations: self.counters.ownership_violations.load(Ordering::Relaxed),
            max_connections_total: self.settings.max_connections_total,
            max_connections_per_user: self.settings.max_connections_per_user,
        }
    }

    /// Stored audit records, oldest first.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().records()
    }

    /// One reaper pass: drop connections idle past the stale timeout or
    /// failing the liveness probe. Returns the number removed.
    pub async fn reap_once(&self) -> usize {
        let stale_timeout = self.settings.stale_timeout();
        let snapshot: Vec<Arc<Connection>> = self.state.read().by_id.values().cloned().collect();

        let mut reaped = 0;
        for conn in snapshot {
            let reason = if conn.idle() > stale_timeout {
                "stale"
            } else if !conn.probe().await {
                "dead"
            } else {
                continue;
            };
            if !self.detach(conn.id(), &conn) {
                continue;
            }
            reaped += 1;
            let _ = self.counters.reaped.fetch_add(1, Ordering::Relaxed);
            counter!(names::POOL_CONNECTIONS_REAPED_TOTAL, "reason" => reason).increment(1);
            let _ = self.audit.lock().record(
                AuditKind::ConnectionReaped,
                conn.id(),
                conn.user_id(),
                reason,
            );
            conn.close().await;
        }
        reaped
    }

    /// Stop the reaper, wait for it, and close every remaining connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.reaper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "reaper task ended abnormally");
            }
        }

        let drained: Vec<Arc<Connection>> = {
            let mut state = self.state.write();
            state.by_user.clear();
            state.by_id.drain().map(|(_, conn)| conn).collect()
        };
        let count = drained.len();
        for conn in drained {
            conn.close().await;
        }
        gauge!(names::POOL_CONNECTIONS_ACTIVE).set(0.0);
        info!(closed = count, "connection pool shut down");
    }

    /// Whether [`ConnectionPool::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn lookup(&self, connection_id: &ConnectionId, user_id: &UserId, operation: &str) -> Lookup {
        let found = self.state.read().by_id.get(connection_id).cloned();
        match found {
            None => Lookup::Missing,
            Some(conn) if conn.user_id() == user_id => Lookup::Owned(conn),
            Some(_) => {
                let _ = self.counters.ownership_violations.fetch_add(1, Ordering::Relaxed);
                counter!(names::POOL_OWNERSHIP_VIOLATIONS_TOTAL).increment(1);
                let _ = self.audit.lock().record(
                    AuditKind::OwnershipViolation,
                    connection_id,
                    user_id,
                    operation,
                );
                Lookup::Foreign
            }
        }
    }

    fn detach(&self, connection_id: &ConnectionId, expected: &Arc<Connection>) -> bool {
        let mut state = self.state.write();
        let detached = state.detach(connection_id, expected);
        if detached {
            gauge!(names::POOL_CONNECTIONS_ACTIVE).set(state.by_id.len() as f64);
        }
        detached
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
