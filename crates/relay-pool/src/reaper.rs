//! Background removal of stale and dead connections.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pool::ConnectionPool;

/// Spawn the reaper loop.
///
/// Holds only a weak reference so a dropped pool ends the loop on its next
/// tick even without an explicit shutdown.
pub(crate) fn spawn(
    pool: Weak<ConnectionPool>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(pool) = pool.upgrade() else { break };
                    let reaped = pool.reap_once().await;
                    if reaped > 0 {
                        debug!(reaped, "reaper pass removed connections");
                    }
                }
            }
        }
        debug!("reaper stopped");
    })
}
