//! Per-request run executor.
//!
//! An [`ExecutionEngine`] is built by the factory for one context. It waits
//! on the user's permit, invokes agent logic under the execution timeout and
//! reports lifecycle events through its emitter. Emission problems are logged
//! and never change a run's outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use relay_core::errors::{RelayError, Result};
use relay_core::ids::{EventId, RunId};
use relay_telemetry::metrics as names;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::agent::{AgentInvocation, AgentLogic, AgentRegistry, DbHandle};
use crate::context::{RunResult, RunStatus, UserExecutionContext};
use crate::emitter::EventEmitter;
use crate::factory::FactoryInner;
use crate::permits::UserPermit;

/// Something that can run agents for one request.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Run `agent_name` with `input` and report the outcome.
    async fn execute_run(&self, agent_name: &str, input: Value) -> Result<RunResult>;

    /// Release everything held for the request. Idempotent.
    async fn cleanup(&self);
}

/// Run executor bound to one [`UserExecutionContext`].
pub struct ExecutionEngine {
    context: Arc<UserExecutionContext>,
    emitter: Arc<EventEmitter>,
    permit: UserPermit,
    execution_timeout: Duration,
    shared_registry: Option<Arc<AgentRegistry>>,
    db: Option<DbHandle>,
    factory: Weak<FactoryInner>,
    agents: Mutex<HashMap<String, Arc<dyn AgentLogic>>>,
    released: AtomicBool,
}

pub(crate) struct EngineParts {
    pub(crate) context: Arc<UserExecutionContext>,
    pub(crate) emitter: Arc<EventEmitter>,
    pub(crate) permit: UserPermit,
    pub(crate) execution_timeout: Duration,
    pub(crate) shared_registry: Option<Arc<AgentRegistry>>,
    pub(crate) db: Option<DbHandle>,
    pub(crate) factory: Weak<FactoryInner>,
}

impl ExecutionEngine {
    pub(crate) fn new(parts: EngineParts) -> Self {
        Self {
            context: parts.context,
            emitter: parts.emitter,
            permit: parts.permit,
            execution_timeout: parts.execution_timeout,
            shared_registry: parts.shared_registry,
            db: parts.db,
            factory: parts.factory,
            agents: Mutex::new(HashMap::new()),
            released: AtomicBool::new(false),
        }
    }

    /// The context this engine runs in.
    pub fn context(&self) -> &Arc<UserExecutionContext> {
        &self.context
    }

    /// The emitter events are reported through.
    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    /// The user's concurrency permit.
    pub fn permit(&self) -> &UserPermit {
        &self.permit
    }

    /// Configured execution timeout.
    pub fn execution_timeout(&self) -> Duration {
        self.execution_timeout
    }

    /// Whether the engine has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn resolve_agent(&self, agent_name: &str) -> Option<Arc<dyn AgentLogic>> {
        if let Some(agent) = self.agents.lock().get(agent_name) {
            return Some(Arc::clone(agent));
        }
        let agent = self
            .context
            .agent_registry()
            .and_then(|r| r.get(agent_name))
            .or_else(|| self.shared_registry.as_ref().and_then(|r| r.get(agent_name)))?;
        let _ = self
            .agents
            .lock()
            .insert(agent_name.to_owned(), Arc::clone(&agent));
        Some(agent)
    }

    /// Drop engine-local state. Called from the context's cleanup chain.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for run in self.context.force_clear_runs() {
            warn!(
                request_id = %self.context.request_id(),
                run_id = %run.run_id,
                agent = %run.agent_name,
                "run still active at cleanup, force-cleared"
            );
        }
        self.agents.lock().clear();
        debug!(request_id = %self.context.request_id(), "engine released");
    }

    async fn emit(&self, what: &'static str, sent: impl Future<Output = Result<EventId>>) {
        if let Err(e) = sent.await {
            debug!(
                request_id = %self.context.request_id(),
                event = what,
                error = %e,
                "lifecycle event not emitted"
            );
        }
    }

    async fn invoke(
        &self,
        agent_name: &str,
        run_id: &RunId,
        input: Value,
    ) -> std::result::Result<Value, Outcome> {
        let Some(agent) = self.resolve_agent(agent_name) else {
            return Err(Outcome::Failed(format!("unknown agent: {agent_name}")));
        };
        let invocation = AgentInvocation {
            agent_name: agent_name.to_owned(),
            run_id: run_id.clone(),
            user_id: self.context.user_id().clone(),
            request_id: self.context.request_id().clone(),
            thread_id: self.context.thread_id().clone(),
            session_id: self.context.session_id().clone(),
            input,
            emitter: Arc::clone(&self.emitter),
            db: self.db.clone(),
        };
        match tokio::time::timeout(self.execution_timeout, agent.run(invocation)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(failure)) => Err(Outcome::Failed(failure.message)),
            Err(_) => Err(Outcome::TimedOut),
        }
    }
}

enum Outcome {
    TimedOut,
    Failed(String),
}

/// Removes the run from the active set however the run ends.
struct ActiveRun<'a> {
    context: &'a UserExecutionContext,
    run_id: &'a RunId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        let _ = self.context.finish_run(self.run_id);
        gauge!(names::ENGINE_RUNS_ACTIVE).decrement(1.0);
    }
}

#[async_trait]
impl RunExecutor for ExecutionEngine {
    async fn execute_run(&self, agent_name: &str, input: Value) -> Result<RunResult> {
        let run_id = RunId::new();
        self.context.begin_run(&run_id, agent_name)?;
        gauge!(names::ENGINE_RUNS_ACTIVE).increment(1.0);
        let _active = ActiveRun {
            context: &self.context,
            run_id: &run_id,
        };

        let waited = Instant::now();
        let _slot = self.permit.acquire().await?;
        histogram!(names::ENGINE_PERMIT_WAIT_SECONDS).record(waited.elapsed().as_secs_f64());

        self.emit(
            "agent_started",
            self.emitter.notify_agent_started(agent_name, run_id.as_str()),
        )
        .await;

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = self.invoke(agent_name, &run_id, input).await;
        let elapsed = clock.elapsed();
        histogram!(names::ENGINE_RUN_DURATION_SECONDS).record(elapsed.as_secs_f64());

        let (result, error) = match outcome {
            Ok(output) => {
                self.emit(
                    "agent_completed",
                    self.emitter.notify_agent_completed(agent_name, output.clone()),
                )
                .await;
                let result = RunResult {
                    run_id: run_id.clone(),
                    agent_name: agent_name.to_owned(),
                    status: RunStatus::Completed,
                    output: Some(output),
                    error: None,
                    started_at,
                    duration_ms: millis(elapsed),
                };
                (result, None)
            }
            Err(Outcome::TimedOut) => {
                let message = format!("timed out after {}ms", millis(self.execution_timeout));
                self.emit(
                    "agent_error",
                    self.emitter.notify_agent_error(
                        agent_name,
                        &message,
                        json!({"timeout": true, "run_id": run_id.as_str()}),
                    ),
                )
                .await;
                let result = RunResult {
                    run_id: run_id.clone(),
                    agent_name: agent_name.to_owned(),
                    status: RunStatus::TimedOut,
                    output: None,
                    error: Some(message),
                    started_at,
                    duration_ms: millis(elapsed),
                };
                (result, Some(RelayError::ExecutionTimeout(self.execution_timeout)))
            }
            Err(Outcome::Failed(message)) => {
                self.emit(
                    "agent_error",
                    self.emitter.notify_agent_error(
                        agent_name,
                        &message,
                        json!({"timeout": false, "run_id": run_id.as_str()}),
                    ),
                )
                .await;
                let result = RunResult {
                    run_id: run_id.clone(),
                    agent_name: agent_name.to_owned(),
                    status: RunStatus::Failed,
                    output: None,
                    error: Some(message.clone()),
                    started_at,
                    duration_ms: millis(elapsed),
                };
                (result, Some(RelayError::ExecutionFailure(message)))
            }
        };

        let status = result.status;
        counter!(names::ENGINE_RUNS_TOTAL, "status" => status_label(status)).increment(1);
        if let Some(factory) = self.factory.upgrade() {
            factory.record_run(status);
        }
        self.context.record_result(result.clone());

        match error {
            None => {
                info!(
                    request_id = %self.context.request_id(),
                    run_id = %run_id,
                    agent = agent_name,
                    duration_ms = result.duration_ms,
                    "run completed"
                );
                Ok(result)
            }
            Some(err) => {
                warn!(
                    request_id = %self.context.request_id(),
                    run_id = %run_id,
                    agent = agent_name,
                    error_kind = err.error_kind(),
                    error = %err,
                    "run failed"
                );
                Err(err)
            }
        }
    }

    async fn cleanup(&self) {
        self.release();
        match self.factory.upgrade() {
            Some(factory) => {
                let _ = factory.release_context(&self.context).await;
            }
            // Factory gone: tear the context down directly.
            None => {
                let _ = self.context.cleanup().await;
            }
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("request_id", self.context.request_id())
            .field("execution_timeout", &self.execution_timeout)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "completed",
        RunStatus::TimedOut => "timed_out",
        RunStatus::Failed => "failed",
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
