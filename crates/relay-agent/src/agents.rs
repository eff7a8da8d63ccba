//! Built-in agents registered by the binary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_runtime::{AgentFailure, AgentInvocation, AgentLogic, AgentRegistry};
use serde_json::{Value, json};

/// Returns its input unchanged.
pub struct EchoAgent;

#[async_trait]
impl AgentLogic for EchoAgent {
    async fn run(&self, invocation: AgentInvocation) -> Result<Value, AgentFailure> {
        Ok(invocation.input)
    }
}

/// Sleeps for `{"millis": n}` while reporting progress, then returns the
/// elapsed time. Useful for exercising permits and timeouts from a client.
pub struct SleepAgent;

#[async_trait]
impl AgentLogic for SleepAgent {
    async fn run(&self, invocation: AgentInvocation) -> Result<Value, AgentFailure> {
        let millis = invocation
            .input
            .get("millis")
            .and_then(Value::as_u64)
            .ok_or_else(|| AgentFailure::new("input.millis must be a non-negative integer"))?;

        let _ = invocation
            .emitter
            .notify_tool_executing("sleep", json!({ "millis": millis }))
            .await;
        tokio::time::sleep(Duration::from_millis(millis)).await;
        let _ = invocation
            .emitter
            .notify_tool_completed("sleep", json!({ "slept_ms": millis }))
            .await;
        Ok(json!({ "slept_ms": millis }))
    }
}

/// Registry with every built-in agent.
pub fn builtin_registry() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    let _ = registry.register("echo", Arc::new(EchoAgent));
    let _ = registry.register("sleep", Arc::new(SleepAgent));
    registry
}
