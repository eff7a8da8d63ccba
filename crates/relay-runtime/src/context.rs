//! Per-request execution state.
//!
//! A [`UserExecutionContext`] belongs to exactly one request of one user. Its
//! status only moves forward:
//!
//! ```text
//! Initializing ──▶ Executing ──▶ Completed
//! ```
//!
//! `Completed` is entered only through [`UserExecutionContext::cleanup`],
//! which runs the registered cleanup callbacks in reverse registration order.
//! A second `cleanup` is a logged no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use relay_core::bounded::{BoundedLog, EvictionPolicy};
use relay_core::errors::{RelayError, Result};
use relay_core::ids::{ConnectionId, RequestId, RunId, SessionId, ThreadId, UserId};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::agent::AgentRegistry;

const DEFAULT_RUN_HISTORY_LIMIT: usize = 100;

/// Lifecycle status of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// Constructed, not yet bound to an engine.
    Initializing,
    /// Bound to an engine and accepting runs.
    Executing,
    /// Cleaned up. Terminal.
    Completed,
}

impl ContextStatus {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::Executing)
                | (Self::Initializing | Self::Executing, Self::Completed)
        )
    }

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Executing => "executing",
            Self::Completed => "completed",
        }
    }
}

/// A run currently in flight.
#[derive(Clone, Debug, Serialize)]
pub struct RunInfo {
    /// Run id.
    pub run_id: RunId,
    /// Agent being run.
    pub agent_name: String,
    /// When the run was recorded.
    pub started_at: DateTime<Utc>,
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The agent returned a value.
    Completed,
    /// The execution timeout elapsed.
    TimedOut,
    /// The agent returned an error.
    Failed,
}

/// Outcome of one run, kept in the context's bounded history.
#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    /// Run id.
    pub run_id: RunId,
    /// Agent that ran.
    pub agent_name: String,
    /// Outcome.
    pub status: RunStatus,
    /// Agent output on success.
    pub output: Option<Value>,
    /// Failure message otherwise.
    pub error: Option<String>,
    /// When the agent was invoked.
    pub started_at: DateTime<Utc>,
    /// Wall time spent in the agent.
    pub duration_ms: u64,
}

/// Counter snapshot for one context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContextMetrics {
    /// Runs recorded.
    pub runs_started: u64,
    /// Runs that returned a value.
    pub runs_completed: u64,
    /// Runs that failed (timeouts included).
    pub runs_failed: u64,
    /// Runs that hit the execution timeout.
    pub runs_timed_out: u64,
    /// Cumulative agent time of successful runs.
    pub total_execution_ms: u64,
    /// `total_execution_ms / runs_completed`.
    pub average_execution_ms: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    total_ms: AtomicU64,
}

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct ContextState {
    status: ContextStatus,
    active_runs: HashMap<RunId, RunInfo>,
    run_history: BoundedLog<RunResult>,
}

/// Isolated state for one request.
pub struct UserExecutionContext {
    user_id: UserId,
    request_id: RequestId,
    thread_id: ThreadId,
    session_id: SessionId,
    connection_id: Option<ConnectionId>,
    agent_registry: Option<Arc<AgentRegistry>>,
    created_at: DateTime<Utc>,
    state: Mutex<ContextState>,
    counters: Counters,
    cleanup_callbacks: Mutex<Vec<(&'static str, CleanupFn)>>,
}

impl UserExecutionContext {
    /// New context in [`ContextStatus::Initializing`].
    pub fn new(
        user_id: UserId,
        request_id: RequestId,
        thread_id: ThreadId,
        session_id: SessionId,
    ) -> Self {
        Self {
            user_id,
            request_id,
            thread_id,
            session_id,
            connection_id: None,
            agent_registry: None,
            created_at: Utc::now(),
            state: Mutex::new(ContextState {
                status: ContextStatus::Initializing,
                active_runs: HashMap::new(),
                run_history: BoundedLog::new(DEFAULT_RUN_HISTORY_LIMIT, EvictionPolicy::default()),
            }),
            counters: Counters::default(),
            cleanup_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Bind events to a specific connection.
    #[must_use]
    pub fn with_connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    /// Use a per-request agent registry instead of the shared one.
    #[must_use]
    pub fn with_agent_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.agent_registry = Some(registry);
        self
    }

    /// Replace the run history bound. Existing entries are discarded.
    #[must_use]
    pub fn with_run_history(self, limit: usize, policy: EvictionPolicy) -> Self {
        self.state.lock().run_history = BoundedLog::new(limit, policy);
        self
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Request id.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Thread id.
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Session id.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Connection events are bound to, if any.
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    /// Per-request agent registry, if any.
    pub fn agent_registry(&self) -> Option<&Arc<AgentRegistry>> {
        self.agent_registry.as_ref()
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current status.
    pub fn status(&self) -> ContextStatus {
        self.state.lock().status
    }

    /// Move from `Initializing` to `Executing`.
    pub fn mark_executing(&self) -> Result<()> {
        self.transition(ContextStatus::Executing)
    }

    fn transition(&self, next: ContextStatus) -> Result<()> {
        let mut state = self.state.lock();
        if !state.status.can_transition_to(next) {
            return Err(RelayError::Internal(format!(
                "invalid context transition {} -> {}",
                state.status.as_str(),
                next.as_str()
            )));
        }
        state.status = next;
        Ok(())
    }

    /// Record a run as active. Fails unless the context is executing.
    pub fn begin_run(&self, run_id: &RunId, agent_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != ContextStatus::Executing {
            return Err(RelayError::Internal(format!(
                "context is {}, not accepting runs",
                state.status.as_str()
            )));
        }
        let _ = state.active_runs.insert(
            run_id.clone(),
            RunInfo {
                run_id: run_id.clone(),
                agent_name: agent_name.to_owned(),
                started_at: Utc::now(),
            },
        );
        let _ = self.counters.started.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a run from the active set.
    pub fn finish_run(&self, run_id: &RunId) -> Option<RunInfo> {
        self.state.lock().active_runs.remove(run_id)
    }

    /// Clear every active run, returning what was cleared.
    pub fn force_clear_runs(&self) -> Vec<RunInfo> {
        self.state
            .lock()
            .active_runs
            .drain()
            .map(|(_, info)| info)
            .collect()
    }

    /// Runs in flight.
    pub fn active_runs(&self) -> Vec<RunInfo> {
        self.state.lock().active_runs.values().cloned().collect()
    }

    /// Number of runs in flight.
    pub fn active_run_count(&self) -> usize {
        self.state.lock().active_runs.len()
    }

    /// Append a finished run to the bounded history and update counters.
    pub fn record_result(&self, result: RunResult) {
        match result.status {
            RunStatus::Completed => {
                let _ = self.counters.completed.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .counters
                    .total_ms
                    .fetch_add(result.duration_ms, Ordering::Relaxed);
            }
            RunStatus::TimedOut => {
                let _ = self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let _ = self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            RunStatus::Failed => {
                let _ = self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut state = self.state.lock();
        if state.status != ContextStatus::Completed {
            state.run_history.push(result);
        }
    }

    /// History snapshot, oldest first.
    pub fn run_history(&self) -> Vec<RunResult> {
        self.state.lock().run_history.iter().cloned().collect()
    }

    /// Number of history entries.
    pub fn run_history_len(&self) -> usize {
        self.state.lock().run_history.len()
    }

    /// Configured history bound.
    pub fn run_history_limit(&self) -> usize {
        self.state.lock().run_history.capacity()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> ContextMetrics {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let total = self.counters.total_ms.load(Ordering::Relaxed);
        ContextMetrics {
            runs_started: self.counters.started.load(Ordering::Relaxed),
            runs_completed: completed,
            runs_failed: self.counters.failed.load(Ordering::Relaxed),
            runs_timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            total_execution_ms: total,
            average_execution_ms: total.checked_div(completed).unwrap_or(0),
        }
    }

    /// Register a callback for [`UserExecutionContext::cleanup`].
    ///
    /// Callbacks run last-registered first. A callback registered after
    /// cleanup never runs.
    pub fn register_cleanup<F>(&self, name: &'static str, callback: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.cleanup_callbacks.lock().push((name, Box::new(callback)));
    }

    /// Tear the context down. Returns `false` if it was already completed.
    ///
    /// Callback failures are logged and do not stop the remaining callbacks.
    pub async fn cleanup(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status == ContextStatus::Completed {
                debug!(request_id = %self.request_id, "context already cleaned up");
                return false;
            }
            state.status = ContextStatus::Completed;
            state.active_runs.clear();
            state.run_history.clear();
        }

        let callbacks = std::mem::take(&mut *self.cleanup_callbacks.lock());
        for (name, callback) in callbacks.into_iter().rev() {
            if let Err(e) = callback().await {
                let err = RelayError::CleanupFailure(format!("{name}: {e}"));
                warn!(request_id = %self.request_id, error = %err, "cleanup callback failed");
            }
        }
        debug!(request_id = %self.request_id, "context cleaned up");
        true
    }
}

impl std::fmt::Debug for UserExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserExecutionContext")
            .field("request_id", &self.request_id)
            .field("thread_id", &self.thread_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
