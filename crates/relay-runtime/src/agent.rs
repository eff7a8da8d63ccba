//! The opaque agent-logic seam.
//!
//! The runtime never looks inside an agent. It hands over an
//! [`AgentInvocation`] and classifies the outcome as success, timeout or
//! failure.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::ids::{RequestId, RunId, SessionId, ThreadId, UserId};
use serde_json::Value;

use crate::emitter::EventEmitter;

/// Persistence handle forwarded unexamined to agents.
pub type DbHandle = Arc<dyn Any + Send + Sync>;

/// Failure reported by agent logic.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AgentFailure {
    /// Human-readable reason, forwarded in the `agent_error` event.
    pub message: String,
}

impl AgentFailure {
    /// Create a failure with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything an agent gets for one run.
pub struct AgentInvocation {
    /// Registered agent name.
    pub agent_name: String,
    /// Run id assigned by the engine.
    pub run_id: RunId,
    /// Owning user.
    pub user_id: UserId,
    /// Request the run belongs to.
    pub request_id: RequestId,
    /// Conversation thread.
    pub thread_id: ThreadId,
    /// Client session.
    pub session_id: SessionId,
    /// Caller-supplied input.
    pub input: Value,
    /// Emitter for progress events (`agent_thinking`, tool events).
    pub emitter: Arc<EventEmitter>,
    /// Persistence handle, if one was configured.
    pub db: Option<DbHandle>,
}

impl std::fmt::Debug for AgentInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInvocation")
            .field("agent_name", &self.agent_name)
            .field("run_id", &self.run_id)
            .field("request_id", &self.request_id)
            .field("has_db", &self.db.is_some())
            .finish_non_exhaustive()
    }
}

/// Agent logic invoked by an engine.
///
/// Runs are cancelled by dropping the returned future at its next `.await`.
/// Blocking work inside an agent is not interrupted by the execution timeout.
#[async_trait]
pub trait AgentLogic: Send + Sync {
    /// Execute one run.
    async fn run(&self, invocation: AgentInvocation) -> Result<Value, AgentFailure>;
}

/// Name → agent lookup.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentLogic>>,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, returning the one it replaced.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        agent: Arc<dyn AgentLogic>,
    ) -> Option<Arc<dyn AgentLogic>> {
        self.agents.insert(name.into(), agent)
    }

    /// Look up an agent.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentLogic>> {
        self.agents.get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agents are registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}
