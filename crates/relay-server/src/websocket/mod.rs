//! `WebSocket` gateway: socket lifecycle and inbound frame dispatch.

pub mod dispatch;
pub mod session;
