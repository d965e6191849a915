//! Core type definitions and protocol constants for duo.

use serde::{Deserialize, Serialize};
use std::fmt;

/// WebSocket subprotocol identifier echoed back when a client offers it.
/// Bump this on breaking wire-format changes.
pub const PROTOCOL_VERSION: &str = "duo.v1";

/// Opaque identifier assigned by the transport when a connection is accepted.
///
/// Stable for the lifetime of the connection and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generate a fresh random (v4) UUID identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for SessionId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Advisory texts carried by `matchTimeout`, `banned` and `reportAck` events.
pub mod notice {
    /// Sent when a match request arrives inside the match cooldown.
    pub const MATCH_COOLDOWN: &str = "Please wait before searching again";
    /// Sent when `next` arrives inside the next cooldown.
    pub const NEXT_COOLDOWN: &str = "Please wait before skipping again";
    /// Sent to a banned session that asks for a partner, and once when the ban lands.
    pub const BANNED: &str = "You have been banned for abusive behaviour";
    /// Acknowledges a filed report.
    pub const REPORT_RECEIVED: &str = "Report received";
}
