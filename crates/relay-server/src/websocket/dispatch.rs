//! Inbound client frames.
//!
//! Clients send JSON text frames tagged by `type`. A `run` frame creates a
//! context bound to the sending socket, runs one agent and cleans up; the
//! lifecycle events arrive on the same socket through the emitter. Replies
//! (`run_accepted`, `run_rejected`, `run_finished`, `error`) go straight onto
//! the socket's outbound queue.

use std::sync::Arc;

use relay_core::errors::RelayError;
use relay_core::ids::{ConnectionId, RequestId, SessionId, ThreadId, UserId};
use relay_runtime::{ExecutionEngineFactory, RunExecutor, RunResult, UserExecutionContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Run one agent.
    Run(RunRequest),
}

/// Body of a `run` frame.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    /// Registered agent name.
    pub agent: String,
    /// Agent input.
    #[serde(default)]
    pub input: Value,
    /// Request id. Generated when absent.
    pub request_id: Option<String>,
    /// Thread id. Generated when absent.
    pub thread_id: Option<String>,
    /// Session id. Generated when absent.
    pub session_id: Option<String>,
}

/// Frames the gateway sends besides lifecycle events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// An engine was created for the request.
    RunAccepted {
        /// Request id.
        request_id: String,
    },
    /// The request was not admitted.
    RunRejected {
        /// Request id.
        request_id: String,
        /// Error classification.
        error_kind: &'static str,
        /// Human-readable reason.
        message: String,
        /// Whether trying again later may succeed.
        retryable: bool,
    },
    /// The run ended.
    RunFinished {
        /// Request id.
        request_id: String,
        /// `completed`, `execution_timeout`, `execution_failure`, …
        status: String,
        /// Failure message, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The client frame could not be understood.
    Error {
        /// Parse failure.
        message: String,
    },
}

/// Who sent a frame and where replies go.
#[derive(Clone)]
pub struct FrameOrigin {
    /// Owner of the socket.
    pub user_id: UserId,
    /// The socket's pool id.
    pub connection_id: ConnectionId,
    /// The socket's outbound queue.
    pub replies: mpsc::Sender<Arc<str>>,
}

impl FrameOrigin {
    async fn reply(&self, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(json) => {
                if self.replies.send(Arc::from(json)).await.is_err() {
                    debug!(connection_id = %self.connection_id, "reply dropped, socket gone");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize server frame"),
        }
    }
}

/// Handle one text frame. Runs are spawned; the handle is returned so
/// callers may track them.
pub async fn handle_text(
    text: &str,
    origin: &FrameOrigin,
    factory: &ExecutionEngineFactory,
) -> Option<JoinHandle<()>> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection_id = %origin.connection_id, "invalid client frame");
            origin
                .reply(&ServerFrame::Error {
                    message: format!("invalid frame: {e}"),
                })
                .await;
            return None;
        }
    };

    match frame {
        ClientFrame::Run(request) => {
            let origin = origin.clone();
            let factory = factory.clone();
            Some(tokio::spawn(run_request(request, origin, factory)))
        }
    }
}

async fn run_request(request: RunRequest, origin: FrameOrigin, factory: ExecutionEngineFactory) {
    let request_id = request
        .request_id
        .map_or_else(RequestId::new, RequestId::from_raw);
    let context = UserExecutionContext::new(
        origin.user_id.clone(),
        request_id.clone(),
        request.thread_id.map_or_else(ThreadId::new, ThreadId::from_raw),
        request.session_id.map_or_else(SessionId::new, SessionId::from_raw),
    )
    .with_connection(origin.connection_id.clone());

    let engine = match factory.create_execution_engine(context).await {
        Ok(engine) => engine,
        Err(e) => {
            origin
                .reply(&ServerFrame::RunRejected {
                    request_id: request_id.to_string(),
                    error_kind: e.error_kind(),
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                })
                .await;
            return;
        }
    };
    origin
        .reply(&ServerFrame::RunAccepted {
            request_id: request_id.to_string(),
        })
        .await;

    let outcome = engine.execute_run(&request.agent, request.input).await;
    engine.cleanup().await;
    origin.reply(&finished(&request_id, outcome)).await;
}

fn finished(request_id: &RequestId, outcome: Result<RunResult, RelayError>) -> ServerFrame {
    match outcome {
        Ok(_) => ServerFrame::RunFinished {
            request_id: request_id.to_string(),
            status: "completed".into(),
            error: None,
        },
        Err(e) => ServerFrame::RunFinished {
            request_id: request_id.to_string(),
            status: e.error_kind().into(),
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn run_frame_parses_with_defaults() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"run","agent":"echo"}"#).unwrap();
        let ClientFrame::Run(request) = frame;
        assert_eq!(request.agent, "echo");
        assert!(request.input.is_null());
        assert!(request.request_id.is_none());
    }

    #[test]
    fn unknown_frame_type_is_an_error() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn server_frames_are_tagged() {
        let frame = ServerFrame::RunRejected {
            request_id: "r1".into(),
            error_kind: "capacity_exceeded",
            message: "full".into(),
            retryable: true,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "run_rejected");
        assert_eq!(value["retryable"], true);

        let done = serde_json::to_value(finished(&RequestId::from_raw("r1"), Err(RelayError::ExecutionTimeout(Duration::from_secs(1))))).unwrap();
        assert_eq!(done["type"], "run_finished");
        assert_eq!(done["status"], "execution_timeout");
    }

    #[tokio::test]
    async fn bad_json_gets_error_reply() {
        let (tx, mut rx) = mpsc::channel(4);
        let origin = FrameOrigin {
            user_id: UserId::from_raw("alice"),
            connection_id: ConnectionId::from_raw("c1"),
            replies: tx,
        };
        let factory = ExecutionEngineFactory::new(Default::default(), Default::default());
        assert!(handle_text("not json", &origin, &factory).await.is_none());
        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn unconfigured_factory_rejects_run() {
        let (tx, mut rx) = mpsc::channel(4);
        let origin = FrameOrigin {
            user_id: UserId::from_raw("alice"),
            connection_id: ConnectionId::from_raw("c1"),
            replies: tx,
        };
        let factory = ExecutionEngineFactory::new(Default::default(), Default::default());
        let frame = json!({"type": "run", "agent": "echo", "request_id": "r9"}).to_string();
        let task = handle_text(&frame, &origin, &factory).await.unwrap();
        task.await.unwrap();

        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "run_rejected");
        assert_eq!(reply["request_id"], "r9");
        assert_eq!(reply["error_kind"], "not_configured");
        assert_eq!(reply["retryable"], false);
    }
}
