//! Live channel wire protocol.
//!
//! Every websocket text frame is one JSON envelope
//! `{"type": ..., "topic": ..., "payload": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// Server push for a topic.
    Event,
    /// Client asks to receive a topic.
    Subscribe,
    /// Client no longer wants a topic.
    Unsubscribe,
    /// Server acknowledges a subscribe/unsubscribe.
    Ack,
    /// Liveness signal, both directions.
    Heartbeat,
}

/// One channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    /// Subscribe request for a topic.
    #[must_use]
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            kind: FrameType::Subscribe,
            topic: topic.into(),
            payload: Value::Null,
        }
    }

    /// Unsubscribe request for a topic.
    #[must_use]
    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            kind: FrameType::Unsubscribe,
            topic: topic.into(),
            payload: Value::Null,
        }
    }

    /// Heartbeat frame.
    #[must_use]
    pub const fn heartbeat() -> Self {
        Self {
            kind: FrameType::Heartbeat,
            topic: String::new(),
            payload: Value::Null,
        }
    }

    /// Event frame (used by servers and tests).
    #[must_use]
    pub fn event(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: FrameType::Event,
            topic: topic.into(),
            payload,
        }
    }

    /// Ack frame (used by servers and tests).
    #[must_use]
    pub fn ack(topic: impl Into<String>) -> Self {
        Self {
            kind: FrameType::Ack,
            topic: topic.into(),
            payload: Value::Null,
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns the JSON error if the text is not a valid envelope.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    /// Returns the JSON error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_subscribe_wire_shape() {
        let text = Frame::subscribe("hunts").encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "subscribe", "topic": "hunts", "payload": null})
        );
    }

    #[test]
    fn test_decode_event() {
        let frame =
            Frame::decode(r#"{"type":"event","topic":"flows","payload":{"state":"FINISHED"}}"#)
                .unwrap();
        assert_eq!(frame.kind, FrameType::Event);
        assert_eq!(frame.topic, "flows");
        assert_eq!(frame.payload["state"], "FINISHED");
    }

    #[test]
    fn test_decode_heartbeat_without_topic() {
        let frame = Frame::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(frame, Frame::heartbeat());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(Frame::decode(r#"{"type":"bogus","topic":"x"}"#).is_err());
        assert!(Frame::decode("not json").is_err());
    }
}
