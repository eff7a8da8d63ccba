//! # relay-pool
//!
//! Owns every registered WebSocket connection, keyed by connection id and
//! grouped by user.
//!
//! - [`ConnectionPool`] enforces the global and per-user connection caps,
//!   checks ownership on every lookup and records audit entries.
//! - A background reaper, spawned by [`ConnectionPool::start`] and joined by
//!   [`ConnectionPool::shutdown`], removes stale and dead connections.
//! - [`Transport`] is the narrow handle contract the pool needs from a socket;
//!   [`ChannelTransport`] implements it over a bounded channel.

#![deny(unsafe_code)]

pub mod connection;
pub mod pool;
mod reaper;
pub mod transport;

pub use connection::Connection;
pub use pool::{ConnectionPool, PoolStats};
pub use transport::{ChannelTransport, Transport, TransportError};
