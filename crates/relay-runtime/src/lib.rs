//! # relay-runtime
//!
//! Per-request execution for concurrent users.
//!
//! - [`ExecutionEngineFactory`] admits a request, attaches the user's
//!   [`UserPermit`], obtains an [`EventEmitter`] and builds an
//!   [`ExecutionEngine`] bound to a fresh [`UserExecutionContext`].
//! - [`ExecutionEngine`] runs named agents under the permit and a timeout,
//!   emitting lifecycle events.
//! - [`EventEmitter`] sanitizes, queues and delivers those events in order
//!   over the user's own connection.
//!
//! Agent logic itself is opaque and plugged in through [`AgentLogic`].

#![deny(unsafe_code)]

pub mod agent;
pub mod context;
pub mod emitter;
pub mod engine;
pub mod factory;
pub mod memory;
pub mod permits;

pub use agent::{AgentFailure, AgentInvocation, AgentLogic, AgentRegistry, DbHandle};
pub use context::{ContextMetrics, ContextStatus, RunInfo, RunResult, RunStatus, UserExecutionContext};
pub use emitter::{EmitterBinding, EmitterFactory, EmitterStats, EventEmitter, PooledEmitterFactory};
pub use engine::{ExecutionEngine, RunExecutor};
pub use factory::{ExecutionEngineFactory, FactoryMetrics, FactoryWiring};
pub use memory::{MemoryProbe, ProcessMemoryProbe};
pub use permits::{PermitRegistry, UserPermit};
