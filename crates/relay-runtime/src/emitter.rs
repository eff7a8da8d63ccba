//! Per-user ordered event delivery.
//!
//! Each [`EventEmitter`] is bound to one (user, thread, connection) triple and
//! owns one delivery task. `notify_*` calls sanitize the payload, build an
//! [`Event`] and push it onto a bounded FIFO queue; the delivery task pops
//! events in order and sends each through the [`ConnectionPool`] with a
//! per-attempt timeout and exponential backoff between retries.
//!
//! Delivery failures are contained: they are counted and logged, never
//! reported back to the run that produced the event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use relay_core::errors::{RelayError, Result};
use relay_core::events::{Event, EventType};
use relay_core::ids::{ConnectionId, EventId, ThreadId, UserId};
use relay_core::sanitize::Sanitizer;
use relay_pool::ConnectionPool;
use relay_settings::EmitterSettings;
use relay_telemetry::metrics as names;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Who an emitter delivers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmitterBinding {
    /// Owning user.
    pub user_id: UserId,
    /// Thread every event is stamped with.
    pub thread_id: ThreadId,
    /// Target connection. `None` delivers to every live connection of the user.
    pub connection_id: Option<ConnectionId>,
}

/// Delivery counters for one emitter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EmitterStats {
    /// Events accepted by `notify_*`.
    pub enqueued: u64,
    /// Events sent successfully.
    pub delivered: u64,
    /// Events abandoned after the retry budget.
    pub undelivered: u64,
    /// Retry attempts across all events.
    pub retries: u64,
    /// Events still queued when the drain timeout expired.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    undelivered: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
}

/// Sanitizing, ordered, retried event producer for one user.
pub struct EventEmitter {
    binding: EmitterBinding,
    degraded: bool,
    sanitizer: Sanitizer,
    intake: Mutex<Option<mpsc::Sender<Event>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    drain_timeout: Duration,
    counters: Arc<Counters>,
}

impl EventEmitter {
    /// Build an emitter and spawn its delivery task.
    ///
    /// `degraded` marks emitters built on the standalone fallback path.
    /// Without a pool, every event is counted undelivered.
    pub fn spawn(
        binding: EmitterBinding,
        pool: Option<Arc<ConnectionPool>>,
        settings: &EmitterSettings,
        degraded: bool,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = DeliveryWorker {
            binding: binding.clone(),
            pool,
            settings: settings.clone(),
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(worker.run(rx));
        Arc::new(Self {
            binding,
            degraded,
            sanitizer: Sanitizer::new(settings.max_string_length),
            intake: Mutex::new(Some(tx)),
            delivery: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
            drain_timeout: settings.drain_timeout(),
            counters,
        })
    }

    /// Binding this emitter delivers to.
    pub fn binding(&self) -> &EmitterBinding {
        &self.binding
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.binding.user_id
    }

    /// Whether this emitter was built on the fallback path.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Whether `notify_*` still accepts events.
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Delivery counters.
    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            undelivered: self.counters.undelivered.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// A run has started.
    pub async fn notify_agent_started(&self, agent_name: &str, run_id: &str) -> Result<EventId> {
        self.notify(
            EventType::AgentStarted,
            json!({"agent_name": agent_name, "run_id": run_id}),
        )
        .await
    }

    /// Intermediate reasoning.
    pub async fn notify_agent_thinking(&self, thought: &str) -> Result<EventId> {
        self.notify(EventType::AgentThinking, json!({"thought": thought}))
            .await
    }

    /// A tool call is starting.
    pub async fn notify_tool_executing(&self, tool_name: &str, arguments: Value) -> Result<EventId> {
        self.notify(
            EventType::ToolExecuting,
            json!({"tool_name": tool_name, "arguments": arguments}),
        )
        .await
    }

    /// A tool call finished.
    pub async fn notify_tool_completed(&self, tool_name: &str, result: Value) -> Result<EventId> {
        self.notify(
            EventType::ToolCompleted,
            json!({"tool_name": tool_name, "result": result}),
        )
        .await
    }

    /// A run finished successfully.
    pub async fn notify_agent_completed(&self, agent_name: &str, result: Value) -> Result<EventId> {
        self.notify(
            EventType::AgentCompleted,
            json!({"agent_name": agent_name, "result": result}),
        )
        .await
    }

    /// A run failed. `details` is merged into the payload when it is an object.
    pub async fn notify_agent_error(
        &self,
        agent_name: &str,
        error: &str,
        details: Value,
    ) -> Result<EventId> {
        let mut data = json!({"agent_name": agent_name, "error": error});
        if let (Value::Object(target), Value::Object(extra)) = (&mut data, details) {
            target.extend(extra);
        }
        self.notify(EventType::AgentError, data).await
    }

    /// Any other event type.
    pub async fn notify_custom(&self, event_type: &str, data: Value) -> Result<EventId> {
        self.notify(EventType::from(event_type.to_owned()), data).await
    }

    async fn notify(&self, event_type: EventType, data: Value) -> Result<EventId> {
        if !self.is_active() {
            return Err(RelayError::EmitterClosed);
        }
        let sender = self.intake.lock().clone().ok_or(RelayError::EmitterClosed)?;
        let event = Event::new(
            event_type,
            self.binding.user_id.clone(),
            self.binding.thread_id.clone(),
            self.sanitizer.sanitize(&data),
        );
        let event_id = event.event_id().clone();
        sender
            .send(event)
            .await
            .map_err(|_| RelayError::EmitterClosed)?;
        let _ = self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(event_id)
    }

    /// Close intake, drain the queue within the drain timeout, then stop the
    /// delivery task. Idempotent.
    pub async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.intake.lock().take());

        let handle = self.delivery.lock().take();
        let Some(mut handle) = handle else { return };
        if tokio::time::timeout(self.drain_timeout, &mut handle)
            .await
            .is_err()
        {
            handle.abort();
            let stats = self.stats();
            let pending = stats
                .enqueued
                .saturating_sub(stats.delivered + stats.undelivered);
            let _ = self.counters.dropped.fetch_add(pending, Ordering::Relaxed);
            warn!(
                user_id = %self.binding.user_id,
                pending,
                "emitter drain timed out, dropping queued events"
            );
        }
        debug!(user_id = %self.binding.user_id, "emitter cleaned up");
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        if let Some(handle) = self.delivery.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("thread_id", &self.binding.thread_id)
            .field("degraded", &self.degraded)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

struct DeliveryWorker {
    binding: EmitterBinding,
    pool: Option<Arc<ConnectionPool>>,
    settings: EmitterSettings,
    counters: Arc<Counters>,
}

impl DeliveryWorker {
    async fn run(self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.deliver(&event).await;
        }
    }

    async fn deliver(&self, event: &Event) {
        let wire: Arc<str> = match event.to_wire() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                self.abandon(event, &RelayError::Internal(format!("encode: {e}")));
                return;
            }
        };
        let Some(pool) = &self.pool else {
            self.abandon(event, &RelayError::ConnectionUnavailable);
            return;
        };

        let attempts = self.settings.max_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                let _ = self.counters.retries.fetch_add(1, Ordering::Relaxed);
                counter!(names::EMITTER_RETRIES_TOTAL).increment(1);
                tokio::time::sleep(self.settings.retry_delay(attempt - 1)).await;
            }
            match tokio::time::timeout(self.settings.send_timeout(), self.send(pool, &wire)).await {
                Ok(Ok(())) => {
                    let _ = self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    counter!(
                        names::EMITTER_EVENTS_SENT_TOTAL,
                        "event_type" => event.event_type().as_str().to_owned()
                    )
                    .increment(1);
                    return;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "send timed out".to_owned(),
            }
            debug!(
                event_id = %event.event_id(),
                attempt = attempt + 1,
                error = %last_error,
                "event delivery attempt failed"
            );
        }

        self.abandon(
            event,
            &RelayError::DeliveryFailure {
                attempts,
                reason: last_error,
            },
        );
    }

    async fn send(&self, pool: &ConnectionPool, wire: &Arc<str>) -> Result<()> {
        let user_id = &self.binding.user_id;
        if let Some(connection_id) = &self.binding.connection_id {
            let conn = pool
                .get(connection_id, user_id)
                .await
                .ok_or(RelayError::ConnectionUnavailable)?;
            return conn
                .send_text(Arc::clone(wire))
                .await
                .map_err(|e| RelayError::Internal(e.to_string()));
        }

        let conns = pool.list_for_user(user_id);
        if conns.is_empty() {
            return Err(RelayError::ConnectionUnavailable);
        }
        let mut sent = false;
        for conn in conns {
            if conn.send_text(Arc::clone(wire)).await.is_ok() {
                sent = true;
            }
        }
        if sent {
            Ok(())
        } else {
            Err(RelayError::ConnectionUnavailable)
        }
    }

    fn abandon(&self, event: &Event, error: &RelayError) {
        let _ = self.counters.undelivered.fetch_add(1, Ordering::Relaxed);
        counter!(names::EMITTER_EVENTS_FAILED_TOTAL).increment(1);
        warn!(
            event_id = %event.event_id(),
            event_type = %event.event_type(),
            error_kind = error.error_kind(),
            error = %error,
            "event undelivered"
        );
    }
}

/// Builds emitters for the engine factory.
#[async_trait]
pub trait EmitterFactory: Send + Sync {
    /// Create an emitter for the binding, or fail so the caller can fall back.
    async fn create_emitter(&self, binding: EmitterBinding) -> Result<Arc<EventEmitter>>;
}

/// [`EmitterFactory`] that validates the target connection against the pool.
pub struct PooledEmitterFactory {
    pool: Arc<ConnectionPool>,
    settings: EmitterSettings,
}

impl PooledEmitterFactory {
    /// Factory delivering through `pool`.
    pub fn new(pool: Arc<ConnectionPool>, settings: EmitterSettings) -> Self {
        Self { pool, settings }
    }
}

#[async_trait]
impl EmitterFactory for PooledEmitterFactory {
    async fn create_emitter(&self, binding: EmitterBinding) -> Result<Arc<EventEmitter>> {
        if self.pool.is_shut_down() {
            return Err(RelayError::ConnectionUnavailable);
        }
        if let Some(connection_id) = &binding.connection_id {
            // Unknown, dead and foreign connections all look the same here.
            if self.pool.get(connection_id, &binding.user_id).await.is_none() {
                return Err(RelayError::ConnectionUnavailable);
            }
        }
        Ok(EventEmitter::spawn(
            binding,
            Some(Arc::clone(&self.pool)),
            &self.settings,
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use relay_core::bounded::EvictionPolicy;
    use relay_core::sanitize::REDACTED;
    use relay_pool::{ChannelTransport, Transport, TransportError};
    use relay_settings::PoolSettings;
    use serde_json::Map;

    use super::*;

    fn pool() -> Arc<ConnectionPool> {
        ConnectionPool::start(PoolSettings {
            max_connections_total: 100,
            max_connections_per_user: 5,
            stale_timeout_ms: 3_600_000,
            reap_interval_ms: 3_600_000,
            audit_capacity: 100,
            audit_eviction: EvictionPolicy::Fifo,
        })
    }

    fn settings() -> EmitterSettings {
        EmitterSettings {
            queue_capacity: 64,
            max_retries: 2,
            send_timeout_ms: 100,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 40,
            drain_timeout_ms: 1_000,
            max_string_length: 32,
        }
    }

    fn binding(conn: Option<&str>) -> EmitterBinding {
        EmitterBinding {
            user_id: UserId::from_raw("alice"),
            thread_id: ThreadId::from_raw("t1"),
            connection_id: conn.map(ConnectionId::from_raw),
        }
    }

    fn register(pool: &ConnectionPool, conn: &str, user: &str) -> mpsc::Receiver<Arc<str>> {
        let (transport, rx) = ChannelTransport::new(64);
        assert!(pool.add(
            ConnectionId::from_raw(conn),
            UserId::from_raw(user),
            Arc::new(transport),
            Map::new()
        ));
        rx
    }

    fn decode(frame: &str) -> Event {
        Event::from_wire(frame).unwrap()
    }

    /// Fails the first `failures` sends, then forwards to the channel.
    struct Flaky {
        failures: AtomicU64,
        inner: ChannelTransport,
    }

    #[async_trait]
    impl Transport for Flaky {
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        async fn send_text(&self, text: Arc<str>) -> std::result::Result<(), TransportError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::Io("flaky".into()));
            }
            self.inner.send_text(text).await
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    #[tokio::test]
    async fn lifecycle_events_arrive_in_order() {
        let pool = pool();
        let mut rx = register(&pool, "c1", "alice");
        let emitter = EventEmitter::spawn(binding(Some("c1")), Some(Arc::clone(&pool)), &settings(), false);

        let _ = emitter.notify_agent_started("triage", "run_1").await.unwrap();
        let _ = emitter.notify_agent_thinking("hmm").await.unwrap();
        let _ = emitter.notify_tool_executing("search", json!({"q": "x"})).await.unwrap();
        let _ = emitter.notify_tool_completed("search", json!({"hits": 3})).await.unwrap();
        let _ = emitter.notify_agent_completed("triage", json!("done")).await.unwrap();
        emitter.cleanup().await;

        let mut types = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            types.push(decode(&frame).event_type().as_str().to_owned());
        }
        assert_eq!(
            types,
            vec!["agent_started", "agent_thinking", "tool_executing", "tool_completed", "agent_completed"]
        );
        assert_eq!(emitter.stats().delivered, 5);
        assert_eq!(emitter.stats().undelivered, 0);
    }

    #[tokio::test]
    async fn payloads_are_sanitized() {
        let pool = pool();
        let mut rx = register(&pool, "c1", "alice");
        let emitter = EventEmitter::spawn(binding(Some("c1")), Some(Arc::clone(&pool)), &settings(), false);

        let _ = emitter
            .notify_tool_executing("http", json!({"api_key": "sk-live", "body": "x".repeat(100)}))
            .await
            .unwrap();
        emitter.cleanup().await;

        let event = decode(&rx.recv().await.unwrap());
        assert_eq!(event.data()["arguments"]["api_key"], REDACTED);
        let body = event.data()["arguments"]["body"].as_str().unwrap();
        assert!(body.ends_with("...[truncated]"));
        assert_eq!(event.user_id().as_str(), "alice");
        assert_eq!(event.thread_id().as_str(), "t1");
    }

    #[tokio::test]
    async fn notify_after_cleanup_fails_fast() {
        let pool = pool();
        let emitter = EventEmitter::spawn(binding(None), Some(pool), &settings(), false);
        emitter.cleanup().await;
        assert!(!emitter.is_active());
        assert_matches!(emitter.notify_agent_thinking("late").await, Err(RelayError::EmitterClosed));
        // idempotent
        emitter.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_send_succeeds() {
        let pool = pool();
        let (inner, mut rx) = ChannelTransport::new(8);
        let flaky = Flaky {
            failures: AtomicU64::new(2),
            inner,
        };
        assert!(pool.add(ConnectionId::from_raw("c1"), UserId::from_raw("alice"), Arc::new(flaky), Map::new()));

        let emitter = EventEmitter::spawn(binding(Some("c1")), Some(Arc::clone(&pool)), &settings(), false);
        let id = emitter.notify_agent_thinking("retry me").await.unwrap();
        emitter.cleanup().await;

        assert_eq!(decode(&rx.recv().await.unwrap()).event_id(), &id);
        let stats = emitter.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_count_undelivered() {
        let pool = pool();
        let emitter = EventEmitter::spawn(binding(Some("missing")), Some(pool), &settings(), false);
        let _ = emitter.notify_agent_thinking("nobody home").await.unwrap();
        emitter.cleanup().await;

        let stats = emitter.stats();
        assert_eq!(stats.undelivered, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn unbound_emitter_fans_out_to_user_connections() {
        let pool = pool();
        let mut rx1 = register(&pool, "c1", "alice");
        let mut rx2 = register(&pool, "c2", "alice");
        let mut other = register(&pool, "c3", "bob");
        let emitter = EventEmitter::spawn(binding(None), Some(Arc::clone(&pool)), &settings(), false);

        let _ = emitter.notify_custom("agent_paused", json!({"why": "test"})).await.unwrap();
        emitter.cleanup().await;

        assert_eq!(decode(&rx1.recv().await.unwrap()).event_type().as_str(), "agent_paused");
        assert!(rx2.recv().await.is_some());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_pool_counts_undelivered() {
        let emitter = EventEmitter::spawn(binding(None), None, &settings(), true);
        assert!(emitter.is_degraded());
        let _ = emitter.notify_agent_thinking("void").await.unwrap();
        emitter.cleanup().await;
        assert_eq!(emitter.stats().undelivered, 1);
    }

    #[tokio::test]
    async fn error_details_are_merged() {
        let pool = pool();
        let mut rx = register(&pool, "c1", "alice");
        let emitter = EventEmitter::spawn(binding(Some("c1")), Some(Arc::clone(&pool)), &settings(), false);
        let _ = emitter
            .notify_agent_error("triage", "timed out", json!({"timeout": true}))
            .await
            .unwrap();
        emitter.cleanup().await;

        let event = decode(&rx.recv().await.unwrap());
        assert_eq!(event.event_type(), &EventType::AgentError);
        assert_eq!(event.data()["timeout"], true);
        assert_eq!(event.data()["error"], "timed out");
    }

    #[tokio::test]
    async fn pooled_factory_rejects_foreign_connection() {
        let pool = pool();
        let _rx = register(&pool, "c1", "bob");
        let factory = PooledEmitterFactory::new(Arc::clone(&pool), settings());

        let err = factory.create_emitter(binding(Some("c1"))).await.unwrap_err();
        assert_matches!(err, RelayError::ConnectionUnavailable);

        let _own = register(&pool, "c2", "alice");
        let emitter = factory.create_emitter(binding(Some("c2"))).await.unwrap();
        assert!(!emitter.is_degraded());
        emitter.cleanup().await;
    }
}
