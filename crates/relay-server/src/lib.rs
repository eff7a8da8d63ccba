//! # relay-server
//!
//! Axum HTTP + `WebSocket` gateway in front of the connection pool and the
//! engine factory.
//!
//! - `GET /ws?user_id=..[&connection_id=..]` registers the socket with the
//!   pool and forwards queued frames to it
//! - `run` frames from the client create an engine bound to that socket
//! - `/health`, `/metrics` (JSON) and `/metrics/prometheus` (text)
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{AppState, RelayServer};
pub use shutdown::ShutdownCoordinator;
