//! Unified error taxonomy shared by every transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error envelope returned by the server for failed requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Short machine-readable error name.
    pub error: String,
    /// Numeric error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}

impl ErrorEnvelope {
    /// Parse an error body, returning `None` if it does not match the envelope.
    #[must_use]
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }
}

/// Error type surfaced by every client operation.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// Invalid address, malformed credential or other local misconfiguration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The server rejected the credential.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Transient failure that survived every retry.
    #[error("Network error after {attempts} attempt(s): {message}")]
    Network { attempts: u32, message: String },

    /// The payload did not match the expected envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server returned a well-formed error envelope.
    #[error("Server returned {status}: {} ({})", .envelope.message, .envelope.error)]
    Remote { status: u16, envelope: ErrorEnvelope },

    /// Deadline exceeded.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Spawn failure, abnormal exit or malformed output from the collector.
    #[error("Process error: {message}")]
    Process {
        message: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Caller-initiated abort.
    #[error("Operation cancelled")]
    Cancelled,
}

impl LinkError {
    /// Shorthand for a process error without exit status.
    #[must_use]
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
            exit_code: None,
            stderr: String::new(),
        }
    }

    /// Whether the failure is transient and was eligible for retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Captured stderr, if this is a process error.
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Process { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Result alias used across the workspace.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parse() {
        let body = br#"{"error":"not_found","code":404,"message":"no such hunt"}"#;
        let envelope = ErrorEnvelope::parse(body).unwrap();
        assert_eq!(envelope.code, 404);
        assert_eq!(envelope.message, "no such hunt");
    }

    #[test]
    fn test_envelope_rejects_other_shapes() {
        assert!(ErrorEnvelope::parse(b"<html>502</html>").is_none());
        assert!(ErrorEnvelope::parse(br#"{"error":"x"}"#).is_none());
        assert!(ErrorEnvelope::parse(br#"{"error":"x","code":"1","message":"m"}"#).is_none());
    }

    #[test]
    fn test_only_network_is_transient() {
        let network = LinkError::Network {
            attempts: 3,
            message: "reset".into(),
        };
        assert!(network.is_transient());
        assert!(!LinkError::Protocol("bad".into()).is_transient());
        assert!(!LinkError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!LinkError::Cancelled.is_transient());
    }

    #[test]
    fn test_remote_display() {
        let err = LinkError::Remote {
            status: 404,
            envelope: ErrorEnvelope {
                error: "not_found".into(),
                code: 404,
                message: "no such flow".into(),
            },
        };
        assert_eq!(err.to_string(), "Server returned 404: no such flow (not_found)");
    }
}
