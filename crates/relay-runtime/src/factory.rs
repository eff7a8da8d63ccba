//! Engine factory: admission, permits, emitters and the active-context table.
//!
//! [`ExecutionEngineFactory::create_execution_engine`] runs a fixed pipeline:
//!
//! 1. `enforce_resource_limits`: reserve an admission slot or reject.
//! 2. `get_or_create_permit`: the user's shared concurrency permit.
//! 3. `acquire_emitter`: the configured emitter factory, falling back to
//!    `standalone_emitter` on any failure.
//! 4. `construct`: bind context, emitter and permit into an engine and
//!    register the cleanup chain.
//! 5. `register`: insert into the active-context table.
//!
//! A failure after step 3 cleans the emitter up before the error is returned.
//! The admission slot is released on every failure path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::errors::{CapacityScope, RelayError, Result};
use relay_core::ids::{RequestId, UserId};
use relay_pool::ConnectionPool;
use relay_settings::{EmitterSettings, FactorySettings};
use relay_telemetry::metrics as names;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::{AgentRegistry, DbHandle};
use crate::context::{RunStatus, UserExecutionContext};
use crate::emitter::{EmitterBinding, EmitterFactory, EventEmitter};
use crate::engine::{EngineParts, ExecutionEngine};
use crate::memory::{MemoryProbe, ProcessMemoryProbe};
use crate::permits::{PermitRegistry, UserPermit};

/// Collaborators supplied once through [`ExecutionEngineFactory::configure`].
#[derive(Clone)]
pub struct FactoryWiring {
    /// Shared agent registry. Contexts may carry their own instead.
    pub agent_registry: Option<Arc<AgentRegistry>>,
    /// Primary emitter source.
    pub emitter_factory: Arc<dyn EmitterFactory>,
    /// Pool used by fallback emitters. Without it they deliver nothing.
    pub pool: Option<Arc<ConnectionPool>>,
    /// Persistence handle passed through to agents.
    pub db: Option<DbHandle>,
}

impl std::fmt::Debug for FactoryWiring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryWiring")
            .field("agent_registry", &self.agent_registry)
            .field("has_pool", &self.pool.is_some())
            .field("has_db", &self.db.is_some())
            .finish_non_exhaustive()
    }
}

/// Read-only factory snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FactoryMetrics {
    /// Engines handed out since start.
    pub engines_created: u64,
    /// Contexts currently in the active table.
    pub active_contexts: usize,
    /// Contexts removed through `cleanup_context`.
    pub contexts_cleaned: u64,
    /// Highest `active_contexts` observed.
    pub peak_active_contexts: usize,
    /// Distinct users with at least one active context.
    pub active_users: usize,
    /// Failed `create_execution_engine` calls.
    pub creation_failures: u64,
    /// Emitters built on the fallback path.
    pub emitter_fallbacks: u64,
    /// Admissions rejected by `max_active_users`.
    pub capacity_rejections: u64,
    /// Per-user permits currently cached.
    pub permits_cached: usize,
    /// Runs that returned a value.
    pub runs_completed: u64,
    /// Runs whose agent returned an error.
    pub runs_failed: u64,
    /// Runs that hit the execution timeout.
    pub runs_timed_out: u64,
    /// Configured admission limit.
    pub max_active_users: usize,
    /// Configured per-user concurrency.
    pub max_concurrent_per_user: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    cleaned: AtomicU64,
    creation_failures: AtomicU64,
    emitter_fallbacks: AtomicU64,
    capacity_rejections: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_timed_out: AtomicU64,
}

/// Active contexts are unique per user, not per request id.
type ContextKey = (UserId, RequestId);

#[derive(Default)]
struct ActiveTable {
    contexts: HashMap<ContextKey, Arc<UserExecutionContext>>,
    reserved: usize,
    peak: usize,
}

/// A reserved admission slot. Dropping it unused gives the slot back.
struct AdmissionTicket<'a> {
    table: &'a Mutex<ActiveTable>,
    armed: bool,
}

impl AdmissionTicket<'_> {
    fn consume(mut self, table: &mut ActiveTable) {
        table.reserved = table.reserved.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for AdmissionTicket<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut table = self.table.lock();
            table.reserved = table.reserved.saturating_sub(1);
        }
    }
}

pub(crate) struct FactoryInner {
    settings: FactorySettings,
    emitter_settings: EmitterSettings,
    wiring: OnceLock<FactoryWiring>,
    permits: PermitRegistry,
    table: Mutex<ActiveTable>,
    memory: Arc<dyn MemoryProbe>,
    counters: Counters,
}

/// Builds isolated engines for concurrent users.
///
/// Construct once at startup, wire with [`configure`](Self::configure), and
/// share by cloning. Clones refer to the same tables.
#[derive(Clone)]
pub struct ExecutionEngineFactory {
    inner: Arc<FactoryInner>,
}

impl ExecutionEngineFactory {
    /// Factory sampling the real process memory.
    pub fn new(settings: FactorySettings, emitter_settings: EmitterSettings) -> Self {
        Self::with_memory_probe(settings, emitter_settings, Arc::new(ProcessMemoryProbe::new()))
    }

    /// Factory with a custom memory source.
    pub fn with_memory_probe(
        settings: FactorySettings,
        emitter_settings: EmitterSettings,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        let permits = PermitRegistry::new(settings.max_concurrent_per_user, settings.permits_enabled);
        Self {
            inner: Arc::new(FactoryInner {
                settings,
                emitter_settings,
                wiring: OnceLock::new(),
                permits,
                table: Mutex::new(ActiveTable::default()),
                memory,
                counters: Counters::default(),
            }),
        }
    }

    /// Supply collaborators. Only the first call takes effect.
    pub fn configure(&self, wiring: FactoryWiring) -> Result<()> {
        let has_registry = wiring.agent_registry.is_some();
        self.inner
            .wiring
            .set(wiring)
            .map_err(|_| RelayError::AlreadyConfigured)?;
        info!(shared_registry = has_registry, "execution engine factory configured");
        Ok(())
    }

    /// Whether `configure` has been called.
    pub fn is_configured(&self) -> bool {
        self.inner.wiring.get().is_some()
    }

    /// Admit `context` and build its engine.
    pub async fn create_execution_engine(
        &self,
        context: UserExecutionContext,
    ) -> Result<Arc<ExecutionEngine>> {
        let user_id = context.user_id().clone();
        let request_id = context.request_id().clone();
        let created = self.inner.create(context).await;
        match &created {
            Ok(_) => {
                debug!(%user_id, %request_id, "execution engine created");
            }
            Err(e) => {
                let _ = self
                    .inner
                    .counters
                    .creation_failures
                    .fetch_add(1, Ordering::Relaxed);
                counter!(names::FACTORY_CREATION_FAILURES_TOTAL, "error_type" => e.error_kind())
                    .increment(1);
                warn!(%user_id, %request_id, error_kind = e.error_kind(), error = %e, "engine creation failed");
            }
        }
        created
    }

    /// Remove and clean up `user_id`'s context for `request_id`. Returns
    /// `false` when that user has no such active context.
    pub async fn cleanup_context(&self, user_id: &UserId, request_id: &RequestId) -> bool {
        self.inner.cleanup_context(user_id, request_id).await
    }

    /// Number of contexts in the active table.
    pub fn active_context_count(&self) -> usize {
        self.inner.table.lock().contexts.len()
    }

    /// Snapshot of factory counters.
    pub fn metrics(&self) -> FactoryMetrics {
        self.inner.metrics()
    }

    /// Clean up every active context. Returns how many were cleaned.
    pub async fn shutdown(&self) -> usize {
        let keys: Vec<ContextKey> = self.inner.table.lock().contexts.keys().cloned().collect();
        let mut cleaned = 0;
        for (user_id, request_id) in &keys {
            if self.inner.cleanup_context(user_id, request_id).await {
                cleaned += 1;
            }
        }
        info!(cleaned, "execution engine factory shut down");
        cleaned
    }
}

impl std::fmt::Debug for ExecutionEngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngineFactory")
            .field("configured", &self.is_configured())
            .field("active_contexts", &self.active_context_count())
            .finish()
    }
}

impl FactoryInner {
    async fn create(self: &Arc<Self>, context: UserExecutionContext) -> Result<Arc<ExecutionEngine>> {
        let wiring = self.wiring.get().ok_or(RelayError::NotConfigured)?;
        let ticket = self.enforce_resource_limits(context.user_id())?;
        let permit = self.get_or_create_permit(context.user_id());
        let binding = EmitterBinding {
            user_id: context.user_id().clone(),
            thread_id: context.thread_id().clone(),
            connection_id: context.connection_id().cloned(),
        };
        let emitter = self.acquire_emitter(wiring, binding).await;

        let built = self
            .construct(wiring, context, Arc::clone(&emitter), permit)
            .and_then(|(context, engine)| {
                self.register(ticket, context)?;
                Ok(engine)
            });
        if built.is_err() {
            emitter.cleanup().await;
        }
        built
    }

    fn enforce_resource_limits(&self, user_id: &UserId) -> Result<AdmissionTicket<'_>> {
        let limit = self.settings.max_active_users;
        {
            let mut table = self.table.lock();
            if table.contexts.len() + table.reserved >= limit {
                drop(table);
                let _ = self
                    .counters
                    .capacity_rejections
                    .fetch_add(1, Ordering::Relaxed);
                warn!(%user_id, limit, "admission rejected, active context limit reached");
                return Err(RelayError::CapacityExceeded {
                    scope: CapacityScope::ActiveUsers,
                    limit,
                });
            }
            table.reserved += 1;
        }

        let threshold = self.settings.memory_warning_threshold_mb;
        if let Some(resident) = self.memory.resident_mb() {
            if resident > threshold {
                warn!(resident_mb = resident, threshold_mb = threshold, "process memory above warning threshold");
            }
        }

        Ok(AdmissionTicket {
            table: &self.table,
            armed: true,
        })
    }

    fn get_or_create_permit(&self, user_id: &UserId) -> UserPermit {
        self.permits.get_or_create(user_id)
    }

    async fn acquire_emitter(&self, wiring: &FactoryWiring, binding: EmitterBinding) -> Arc<EventEmitter> {
        match wiring.emitter_factory.create_emitter(binding.clone()).await {
            Ok(emitter) => emitter,
            Err(e) => {
                warn!(
                    user_id = %binding.user_id,
                    error = %e,
                    "emitter factory failed, using degraded standalone emitter"
                );
                self.standalone_emitter(wiring, binding)
            }
        }
    }

    fn standalone_emitter(&self, wiring: &FactoryWiring, binding: EmitterBinding) -> Arc<EventEmitter> {
        let _ = self
            .counters
            .emitter_fallbacks
            .fetch_add(1, Ordering::Relaxed);
        counter!(names::FACTORY_EMITTER_FALLBACKS_TOTAL).increment(1);
        EventEmitter::spawn(binding, wiring.pool.clone(), &self.emitter_settings, true)
    }

    fn construct(
        self: &Arc<Self>,
        wiring: &FactoryWiring,
        context: UserExecutionContext,
        emitter: Arc<EventEmitter>,
        permit: UserPermit,
    ) -> Result<(Arc<UserExecutionContext>, Arc<ExecutionEngine>)> {
        let context = Arc::new(context.with_run_history(
            self.settings.run_history_limit,
            self.settings.run_history_eviction,
        ));
        context.mark_executing()?;

        let engine = Arc::new(ExecutionEngine::new(EngineParts {
            context: Arc::clone(&context),
            emitter: Arc::clone(&emitter),
            permit,
            execution_timeout: self.settings.execution_timeout(),
            shared_registry: wiring.agent_registry.clone(),
            db: wiring.db.clone(),
            factory: Arc::downgrade(self),
        }));

        context.register_cleanup("emitter", move || {
            async move {
                emitter.cleanup().await;
                Ok(())
            }
            .boxed()
        });
        let weak_engine = Arc::downgrade(&engine);
        context.register_cleanup("engine", move || {
            if let Some(engine) = weak_engine.upgrade() {
                engine.release();
            }
            futures::future::ready(Ok(())).boxed()
        });

        Ok((context, engine))
    }

    fn register(&self, ticket: AdmissionTicket<'_>, context: Arc<UserExecutionContext>) -> Result<()> {
        let mut table = self.table.lock();
        ticket.consume(&mut table);
        let key = (context.user_id().clone(), context.request_id().clone());
        if table.contexts.contains_key(&key) {
            return Err(RelayError::DuplicateRequest(key.1.to_string()));
        }
        let _ = table.contexts.insert(key, context);
        table.peak = table.peak.max(table.contexts.len());
        let active = table.contexts.len();
        drop(table);

        let _ = self.counters.created.fetch_add(1, Ordering::Relaxed);
        counter!(names::FACTORY_ENGINES_CREATED_TOTAL).increment(1);
        gauge!(names::FACTORY_CONTEXTS_ACTIVE).set(active as f64);
        Ok(())
    }

    async fn cleanup_context(&self, user_id: &UserId, request_id: &RequestId) -> bool {
        let key = (user_id.clone(), request_id.clone());
        let (removed, active) = {
            let mut table = self.table.lock();
            let removed = table.contexts.remove(&key);
            (removed, table.contexts.len())
        };
        match removed {
            Some(context) => {
                self.finish_cleanup(&context, active).await;
                true
            }
            None => false,
        }
    }

    /// Remove `context` only if it is still the table entry for its key.
    /// A later context reusing the same ids is left alone.
    pub(crate) async fn release_context(&self, context: &Arc<UserExecutionContext>) -> bool {
        let key = (context.user_id().clone(), context.request_id().clone());
        let active = {
            let mut table = self.table.lock();
            let owned = table
                .contexts
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, context));
            if !owned {
                return false;
            }
            let _ = table.contexts.remove(&key);
            table.contexts.len()
        };
        self.finish_cleanup(context, active).await;
        true
    }

    async fn finish_cleanup(&self, context: &UserExecutionContext, active: usize) {
        let request_id = context.request_id();
        let _ = context.cleanup().await;
        let _ = self.counters.cleaned.fetch_add(1, Ordering::Relaxed);
        counter!(names::FACTORY_CONTEXTS_CLEANED_TOTAL).increment(1);
        gauge!(names::FACTORY_CONTEXTS_ACTIVE).set(active as f64);
        let pruned = self.permits.prune_idle();
        debug!(%request_id, user_id = %context.user_id(), pruned, "context cleaned up");
    }

    pub(crate) fn record_run(&self, status: RunStatus) {
        let counter = match status {
            RunStatus::Completed => &self.counters.runs_completed,
            RunStatus::Failed => &self.counters.runs_failed,
            RunStatus::TimedOut => &self.counters.runs_timed_out,
        };
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    fn metrics(&self) -> FactoryMetrics {
        let (active_contexts, active_users, peak) = {
            let table = self.table.lock();
            let users: HashSet<&UserId> = table.contexts.keys().map(|(user, _)| user).collect();
            (table.contexts.len(), users.len(), table.peak)
        };
        let c = &self.counters;
        FactoryMetrics {
            engines_created: c.created.load(Ordering::Relaxed),
            active_contexts,
            contexts_cleaned: c.cleaned.load(Ordering::Relaxed),
            peak_active_contexts: peak,
            active_users,
            creation_failures: c.creation_failures.load(Ordering::Relaxed),
            emitter_fallbacks: c.emitter_fallbacks.load(Ordering::Relaxed),
            capacity_rejections: c.capacity_rejections.load(Ordering::Relaxed),
            permits_cached: self.permits.len(),
            runs_completed: c.runs_completed.load(Ordering::Relaxed),
            runs_failed: c.runs_failed.load(Ordering::Relaxed),
            runs_timed_out: c.runs_timed_out.load(Ordering::Relaxed),
            max_active_users: self.settings.max_active_users,
            max_concurrent_per_user: self.settings.max_concurrent_per_user,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use relay_core::ids::{SessionId, ThreadId};
    use serde_json::{Value, json};

    use super::*;
    use crate::agent::{AgentFailure, AgentInvocation, AgentLogic};
    use crate::context::ContextStatus;
    use crate::engine::RunExecutor;

    struct Echo;

    #[async_trait]
    impl AgentLogic for Echo {
        async fn run(&self, invocation: AgentInvocation) -> std::result::Result<Value, AgentFailure> {
            Ok(invocation.input)
        }
    }

    /// Emitter source that records what it built, or always fails.
    #[derive(Default)]
    struct Recording {
        fail: bool,
        built: parking_lot::Mutex<Vec<Arc<EventEmitter>>>,
    }

    #[async_trait]
    impl EmitterFactory for Recording {
        async fn create_emitter(&self, binding: EmitterBinding) -> Result<Arc<EventEmitter>> {
            if self.fail {
                return Err(RelayError::ConnectionUnavailable);
            }
            let emitter = EventEmitter::spawn(binding, None, &EmitterSettings::default(), false);
            self.built.lock().push(Arc::clone(&emitter));
            Ok(emitter)
        }
    }

    struct FixedMemory(u64);

    impl MemoryProbe for FixedMemory {
        fn resident_mb(&self) -> Option<u64> {
            Some(self.0)
        }
    }

    fn settings(max_active_users: usize) -> FactorySettings {
        FactorySettings {
            max_active_users,
            max_concurrent_per_user: 2,
            ..FactorySettings::default()
        }
    }

    fn factory(max_active_users: usize, emitters: Arc<Recording>) -> ExecutionEngineFactory {
        let factory = ExecutionEngineFactory::with_memory_probe(
            settings(max_active_users),
            EmitterSettings::default(),
            Arc::new(FixedMemory(1)),
        );
        let mut registry = AgentRegistry::new();
        let _ = registry.register("echo", Arc::new(Echo));
        factory
            .configure(FactoryWiring {
                agent_registry: Some(Arc::new(registry)),
                emitter_factory: emitters,
                pool: None,
                db: None,
            })
            .unwrap();
        factory
    }

    fn context(user: &str, request: &str) -> UserExecutionContext {
        UserExecutionContext::new(
            UserId::from_raw(user),
            RequestId::from_raw(request),
            ThreadId::from_raw(format!("{request}-thread")),
            SessionId::from_raw("s1"),
        )
    }

    #[tokio::test]
    async fn unconfigured_factory_refuses() {
        let factory = ExecutionEngineFactory::new(settings(5), EmitterSettings::default());
        let err = factory.create_execution_engine(context("alice", "r1")).await.unwrap_err();
        assert_matches!(err, RelayError::NotConfigured);
        assert_eq!(factory.metrics().creation_failures, 1);
    }

    #[tokio::test]
    async fn second_configure_is_rejected() {
        let factory = factory(5, Arc::new(Recording::default()));
        let again = factory.configure(FactoryWiring {
            agent_registry: None,
            emitter_factory: Arc::new(Recording::default()),
            pool: None,
            db: None,
        });
        assert_matches!(again, Err(RelayError::AlreadyConfigured));
    }

    #[tokio::test]
    async fn engine_runs_and_context_is_executing() {
        let factory = factory(5, Arc::new(Recording::default()));
        let engine = factory.create_execution_engine(context("alice", "r1")).await.unwrap();
        assert_eq!(engine.context().status(), ContextStatus::Executing);

        let result = engine.execute_run("echo", json!({"n": 1})).await.unwrap();
        assert_eq!(result.output, Some(json!({"n": 1})));

        let metrics = factory.metrics();
        assert_eq!(metrics.engines_created, 1);
        assert_eq!(metrics.active_contexts, 1);
        assert_eq!(metrics.active_users, 1);
        assert_eq!(metrics.runs_completed, 1);
        assert_eq!(metrics.permits_cached, 1);
    }

    #[tokio::test]
    async fn same_user_shares_permit_across_requests() {
        let factory = factory(5, Arc::new(Recording::default()));
        let a = factory.create_execution_engine(context("alice", "r1")).await.unwrap();
        let b = factory.create_execution_engine(context("alice", "r2")).await.unwrap();
        let c = factory.create_execution_engine(context("bob", "r3")).await.unwrap();
        assert!(a.permit().same_as(b.permit()));
        assert!(!a.permit().same_as(c.permit()));
        assert_eq!(factory.metrics().active_users, 2);
    }

    #[tokio::test]
    async fn admission_limit_rejects_then_recovers() {
        let factory = factory(2, Arc::new(Recording::default()));
        let first = factory.create_execution_engine(context("alice", "r1")).await.unwrap();
        let _second = factory.create_execution_engine(context("bob", "r2")).await.unwrap();

        let err = factory.create_execution_engine(context("carol", "r3")).await.unwrap_err();
        assert_matches!(
            err,
            RelayError::CapacityExceeded { scope: CapacityScope::ActiveUsers, limit: 2 }
        );
        assert!(err.is_retryable());
        assert_eq!(factory.metrics().capacity_rejections, 1);

        first.cleanup().await;
        assert!(factory.create_execution_engine(context("carol", "r3")).await.is_ok());
    }

    #[tokio::test]
    async fn fallback_emitter_is_degraded() {
        let emitters = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let factory = factory(5, emitters);
        let engine = factory.create_execution_engine(context("alice", "r1")).await.unwrap();
        assert!(engine.emitter().is_degraded());
        assert_eq!(factory.metrics().emitter_fallbacks, 1);
    }

    #[tokio::test]
    async fn duplicate_request_rolls_back_emitter() {
        let emitters = Arc::new(Recording::default());
        let factory = factory(5, Arc::clone(&emitters));
        let _first = factory.create_execution_engine(context("alice", "r1")).await.unwrap();

        let err = factory.create_execution_engine(context("alice", "r1")).await.unwrap_err();
        assert_matches!(err, RelayError::DuplicateRequest(ref id) if id == "r1");

        let built = emitters.built.lock().clone();
        assert_eq!(built.len(), 2);
        assert!(built[0].is_active());
        assert!(!built[1].is_active());
        assert_eq!(factory.active_context_count(), 1);

        // the reserved slot was returned
        let metrics = factory.metrics();
        assert_eq!(metrics.creation_failures, 1);
        assert!(factory.create_execution_engine(context("bob", "r2")).await.is_ok());
    }

    #[tokio::test]
    async fn request_ids_are_scoped_per_user() {
        let factory = factory(5, Arc::new(Recording::default()));
        let alice = factory.create_execution_engine(context("alice", "r1")).await.unwrap();
        let bob = factory.create_execution_engine(context("bob", "r1")).await.unwrap();
        assert_eq!(factory.active_context_count(), 2);
        assert_eq!(factory.metrics().creation_failures, 0);

        assert!(!factory.cleanup_context(&UserId::from_raw("carol"), &RequestId::from_raw("r1")).await);
        assert!(factory.cleanup_context(&UserId::from_raw("bob"), &RequestId::from_raw("r1")).await);
        assert_eq!(bob.context().status(), ContextStatus::Completed);
        assert_eq!(alice.context().status(), ContextStatus::Executing);
        assert_eq!(factory.active_context_count(), 1);
    }

    #[tokio::test]
    async fn stale_engine_cleanup_leaves_reused_ids_alone() {
        let factory = factory(5, Arc::new(Recording::default()));
        let first = factory.create_execution_engine(context("alice", "r1")).await.unwrap();
        first.cleanup().await;

        let bob = factory.create_execution_engine(context("bob", "r1")).await.unwrap();
        let again = factory.create_execution_engine(context("alice", "r1")).await.unwrap();
        first.cleanup().await;

        assert_eq!(bob.context().status(), ContextStatus::Executing);
        assert_eq!(again.context().status(), ContextStatus::Executing);
        assert!(again.emitter().is_active());
        assert_eq!(factory.active_context_count(), 2);
        assert_eq!(factory.metrics().contexts_cleaned, 1);
    }

    #[tokio::test]
    async fn cleanup_runs_engine_then_emitter_and_is_idempotent() {
        let factory = factory(5, Arc::new(Recording::default()));
        let engine = factory.create_execution_engine(context("alice", "r1")).await.unwrap();

        assert!(factory.cleanup_context(&UserId::from_raw("alice"), &RequestId::from_raw("r1")).await);
        assert!(engine.is_released());
        assert!(!engine.emitter().is_active());
        assert_eq!(engine.context().status(), ContextStatus::Completed);
        assert_eq!(factory.active_context_count(), 0);

        assert!(!factory.cleanup_context(&UserId::from_raw("alice"), &RequestId::from_raw("r1")).await);
        engine.cleanup().await;
        assert_eq!(factory.metrics().contexts_cleaned, 1);
    }

    #[tokio::test]
    async fn shutdown_cleans_every_context() {
        let factory = factory(5, Arc::new(Recording::default()));
        let a = factory.create_execution_engine(context("alice", "r1")).await.unwrap();
        let b = factory.create_execution_engine(context("bob", "r2")).await.unwrap();
        assert_eq!(factory.shutdown().await, 2);
        assert_eq!(a.context().status(), ContextStatus::Completed);
        assert_eq!(b.context().status(), ContextStatus::Completed);
        assert_eq!(factory.metrics().peak_active_contexts, 2);
    }

    #[tokio::test]
    async fn memory_warning_does_not_reject() {
        let factory = ExecutionEngineFactory::with_memory_probe(
            settings(5),
            EmitterSettings::default(),
            Arc::new(FixedMemory(u64::MAX)),
        );
        factory
            .configure(FactoryWiring {
                agent_registry: None,
                emitter_factory: Arc::new(Recording::default()),
                pool: None,
                db: None,
            })
            .unwrap();
        assert!(factory.create_execution_engine(context("alice", "r1")).await.is_ok());
    }
}
