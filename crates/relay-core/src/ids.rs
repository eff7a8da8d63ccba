//! Branded string identifiers.
//!
//! Every id is a newtype over `String` so a `UserId` can never be passed where
//! a `ConnectionId` is expected. Generated ids carry a short prefix followed by
//! a UUID v7, which keeps them time-ordered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh, prefixed, time-ordered id.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an externally supplied value without validation.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the raw string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(
    /// Identity of the user that owns connections, contexts and runs.
    UserId,
    "user"
);
branded_id!(
    /// Identity of one physical transport connection.
    ConnectionId,
    "conn"
);
branded_id!(
    /// Identity of one inbound request; keys the active-context table.
    RequestId,
    "req"
);
branded_id!(
    /// Conversation thread an emitter is bound to.
    ThreadId,
    "thread"
);
branded_id!(
    /// Client session grouping several requests.
    SessionId,
    "sess"
);
branded_id!(
    /// One execution of a named agent inside an engine.
    RunId,
    "run"
);
branded_id!(
    /// Unique id of a lifecycle event.
    EventId,
    "evt"
);
