//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use relay_pool::ConnectionPool;
use relay_runtime::ExecutionEngineFactory;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Coordinates shutdown of the listener, open sockets, contexts and the pool.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop everything in dependency order.
    ///
    /// 1. Cancel the token: the listener stops accepting and sockets close
    /// 2. Wait up to `timeout` for the listener task, then abort it
    /// 3. Clean up every active context (emitters drain here)
    /// 4. Shut the pool down, joining the reaper and closing transports
    pub async fn graceful_shutdown(
        &self,
        listener: JoinHandle<()>,
        factory: &ExecutionEngineFactory,
        pool: &ConnectionPool,
        timeout: Duration,
    ) {
        self.shutdown();
        info!(timeout_secs = timeout.as_secs(), "shutting down");

        let abort = listener.abort_handle();
        if tokio::time::timeout(timeout, listener).await.is_err() {
            warn!("listener did not stop after {timeout:?}, aborting");
            abort.abort();
        }

        let contexts = factory.shutdown().await;
        pool.shutdown().await;
        info!(contexts, "shutdown complete");
    }
}
