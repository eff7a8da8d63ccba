//! `WebSocket` session lifecycle: a single socket from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use relay_core::ids::{ConnectionId, UserId};
use relay_pool::ChannelTransport;
use relay_telemetry::metrics as names;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::dispatch::{self, FrameOrigin};
use crate::server::AppState;

/// Close code sent when the pool refuses the socket ("try again later").
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Close code sent on server shutdown ("going away").
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code sent when the pool closes the transport.
pub const CLOSE_NORMAL: u16 = 1000;

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }))
}

/// Run a session for an upgraded socket.
///
/// 1. Registers a [`ChannelTransport`] with the pool, or closes with 1013
/// 2. Forwards queued frames to the socket and sends periodic Pings
/// 3. Records inbound frames and Pongs as activity
/// 4. Dispatches inbound text frames
/// 5. Deregisters on disconnect
#[instrument(skip_all, fields(user_id = %user_id, connection_id = %connection_id))]
pub async fn run_ws_session(
    socket: WebSocket,
    user_id: UserId,
    connection_id: ConnectionId,
    state: AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<str>>(state.config.send_queue_capacity);
    let transport = ChannelTransport::from_sender(send_tx.clone());
    let transport_closed = transport.closed_token();
    let mut metadata = Map::new();
    let _ = metadata.insert("transport".into(), Value::from("websocket"));

    if !state
        .pool
        .add(connection_id.clone(), user_id.clone(), Arc::new(transport), metadata)
    {
        info!("registration rejected, closing with 1013");
        let _ = ws_tx
            .send(close_frame(CLOSE_TRY_AGAIN_LATER, "try again later"))
            .await;
        return;
    }

    let started = Instant::now();
    counter!(names::WS_CONNECTIONS_TOTAL).increment(1);
    info!("client connected");

    let session_done = CancellationToken::new();
    let ping_interval = state.config.ping_interval;

    let outbound_done = session_done.clone();
    let outbound_shutdown = state.shutdown.token();
    let outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        // Skip the immediate first tick
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                () = outbound_shutdown.cancelled() => {
                    let _ = ws_tx.send(close_frame(CLOSE_GOING_AWAY, "server shutting down")).await;
                    break;
                }
                () = transport_closed.cancelled() => {
                    let _ = ws_tx.send(close_frame(CLOSE_NORMAL, "connection closed")).await;
                    break;
                }
                frame = send_rx.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        outbound_done.cancel();
    });

    let origin = FrameOrigin {
        user_id: user_id.clone(),
        connection_id: connection_id.clone(),
        replies: send_tx,
    };

    loop {
        let msg = tokio::select! {
            () = session_done.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let Some(Ok(msg)) = msg else { break };

        match msg {
            Message::Text(text) => {
                touch(&state, &connection_id, &user_id).await;
                let _ = dispatch::handle_text(text.as_str(), &origin, &state.factory).await;
            }
            Message::Binary(data) => {
                touch(&state, &connection_id, &user_id).await;
                debug!(len = data.len(), "ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {
                touch(&state, &connection_id, &user_id).await;
            }
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
        }
    }

    if !state.pool.remove(&connection_id, &user_id) {
        debug!("connection already removed by the pool");
    }
    session_done.cancel();
    outbound.abort();
    counter!(names::WS_DISCONNECTIONS_TOTAL).increment(1);
    info!(duration_secs = started.elapsed().as_secs(), "client disconnected");
}

async fn touch(state: &AppState, connection_id: &ConnectionId, user_id: &UserId) {
    if state.pool.get(connection_id, user_id).await.is_none() {
        warn!("activity on a connection the pool no longer holds");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frames_carry_codes() {
        let Message::Close(Some(frame)) = close_frame(CLOSE_TRY_AGAIN_LATER, "try again later") else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1013);
        assert_eq!(frame.reason.as_str(), "try again later");
    }
}
