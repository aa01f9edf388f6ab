//! Events pushed over the live channel.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A state change pushed by the server (hunt, flow, client status).
    Update,
    /// The channel gave up reconnecting; no further events will arrive.
    ConnectionLost { attempts: u32 },
}

/// An event delivered to subscription handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Topic the event was published on.
    pub topic: String,
    /// Event payload.
    pub payload: Value,
    /// When the client received it.
    pub received_at: SystemTime,
    /// Event kind.
    pub kind: EventKind,
}

impl Event {
    /// A server update received now.
    #[must_use]
    pub fn update(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: SystemTime::now(),
            kind: EventKind::Update,
        }
    }

    /// Fatal connection loss notice for a topic.
    #[must_use]
    pub fn connection_lost(topic: impl Into<String>, attempts: u32, reason: &str) -> Self {
        Self {
            topic: topic.into(),
            payload: serde_json::json!({ "reason": reason }),
            received_at: SystemTime::now(),
            kind: EventKind::ConnectionLost { attempts },
        }
    }

    /// Whether this is a connection loss notice.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(self.kind, EventKind::ConnectionLost { .. })
    }
}
