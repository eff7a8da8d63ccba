//! A registered connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::ids::{ConnectionId, UserId};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::transport::{Transport, TransportError};

/// A live socket bound to exactly one user.
///
/// The `(id, user_id)` binding is fixed at construction.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    transport: Arc<dyn Transport>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    metadata: Map<String, Value>,
}

impl Connection {
    /// Create a connection record.
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        transport: Arc<dyn Transport>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            user_id,
            transport,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            metadata,
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// When the connection was registered.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Metadata supplied at registration.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Record activity (frame received, pong, successful lookup).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Synchronous connected check.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Async liveness probe.
    pub async fn probe(&self) -> bool {
        self.transport.probe().await
    }

    /// Send a text frame and record activity on success.
    pub async fn send_text(&self, text: Arc<str>) -> Result<(), TransportError> {
        self.transport.send_text(text).await?;
        self.touch();
        Ok(())
    }

    /// Close the underlying transport.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("created_at", &self.created_at)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    fn make() -> (Connection, tokio::sync::mpsc::Receiver<Arc<str>>) {
        let (transport, rx) = ChannelTransport::new(8);
        let conn = Connection::new(
            ConnectionId::from_raw("c1"),
            UserId::from_raw("alice"),
            Arc::new(transport),
            Map::new(),
        );
        (conn, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_resets_on_touch() {
        let (conn, _rx) = make();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(conn.idle() >= Duration::from_secs(5));
        conn.touch();
        assert!(conn.idle() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn send_records_activity() {
        let (conn, mut rx) = make();
        tokio::time::advance(Duration::from_secs(5)).await;
        conn.send_text(Arc::from("frame")).await.unwrap();
        assert!(conn.idle() < Duration::from_secs(1));
        assert_eq!(&*rx.recv().await.unwrap(), "frame");
    }

    #[tokio::test]
    async fn close_disconnects() {
        let (conn, _rx) = make();
        assert!(conn.probe().await);
        conn.close().await;
        assert!(!conn.is_connected());
        assert_eq!(conn.user_id().as_str(), "alice");
    }
}
