//! # relay-core
//!
//! Shared vocabulary for the relay crates.
//!
//! - **Branded IDs**: `UserId`, `ConnectionId`, `RequestId`, `ThreadId`, `RunId`, `EventId`
//! - **Errors**: the `RelayError` taxonomy every component reports through
//! - **Events**: the lifecycle `Event` and its JSON wire codec
//! - **Sanitizing**: credential redaction and string truncation for event payloads
//! - **Bounded logs**: size-capped buffers with a configurable eviction policy
//! - **Audit**: security-relevant records kept by the connection pool

#![deny(unsafe_code)]

pub mod audit;
pub mod bounded;
pub mod errors;
pub mod events;
pub mod ids;
pub mod sanitize;

pub use errors::{RelayError, Result};
