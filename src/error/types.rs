//! Error types for the sentinel proxy.

use thiserror::Error;

/// Main error type for the proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration-related errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport-related errors (listener, upstream connect).
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Security violations detected on a relayed stream.
    #[error("Security violation: {kind}")]
    Security { kind: SecurityErrorKind },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket protocol errors.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ProxyError {
    /// Wrap a security violation kind.
    pub fn security(kind: SecurityErrorKind) -> Self {
        Self::Security { kind }
    }
}

/// Security violation kinds.
///
/// Every variant is fail-closed: the affected connection is terminated with
/// the variant's close code and never retried. Detail fields are for
/// server-side logs and audit entries only; the wire carries nothing beyond
/// the close code and a terse reason.
#[derive(Error, Debug)]
pub enum SecurityErrorKind {
    #[error("Malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    #[error("Timestamp skew too large: now={now} ts={timestamp}")]
    TimestampSkew { now: u64, timestamp: u64 },

    #[error("Replay detected (nonce seen before)")]
    ReplayDetected { nonce: String },

    #[error("Tampering detected (signature mismatch)")]
    TamperDetected,

    #[error("Flood detected: {count} messages in window")]
    FloodDetected { count: usize },

    #[error("Reordering detected: {action} after a later phase")]
    ReorderDetected { action: String },

    #[error("Heartbeat suppression detected ({silent_seconds}s silent)")]
    SuppressionDetected { silent_seconds: u64 },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },
}

impl SecurityErrorKind {
    /// Application-level WebSocket close code carried on the close frame.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::SuppressionDetected { .. } => 4001,
            Self::FloodDetected { .. } => 4002,
            Self::MalformedEnvelope { .. } | Self::ProtocolError { .. } => 4003,
            Self::ReplayDetected { .. } => 4004,
            Self::TamperDetected => 4005,
            Self::ReorderDetected { .. } => 4006,
            Self::TimestampSkew { .. } => 4007,
        }
    }

    /// Terse close reason sent to the peer.
    ///
    /// Never includes the detail fields; those stay in server-side logs.
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::SuppressionDetected { .. } => "Heartbeat suppression",
            Self::FloodDetected { .. } => "Flood",
            Self::MalformedEnvelope { .. } | Self::ProtocolError { .. } => "Protocol error",
            Self::ReplayDetected { .. } => "Replay",
            Self::TamperDetected => "Tampering",
            Self::ReorderDetected { .. } => "Reordering",
            Self::TimestampSkew { .. } => "Timestamp skew",
        }
    }

    /// Short label used in audit entries and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SuppressionDetected { .. } => "suppress",
            Self::FloodDetected { .. } => "flood",
            Self::MalformedEnvelope { .. } => "malformed",
            Self::ProtocolError { .. } => "protocol",
            Self::ReplayDetected { .. } => "replay",
            Self::TamperDetected => "tamper",
            Self::ReorderDetected { .. } => "reorder",
            Self::TimestampSkew { .. } => "skew",
        }
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes_are_distinct() {
        let kinds = [
            SecurityErrorKind::SuppressionDetected { silent_seconds: 31 },
            SecurityErrorKind::FloodDetected { count: 6 },
            SecurityErrorKind::MalformedEnvelope {
                message: "missing field".to_string(),
            },
            SecurityErrorKind::ReplayDetected {
                nonce: "n1".to_string(),
            },
            SecurityErrorKind::TamperDetected,
            SecurityErrorKind::ReorderDetected {
                action: "Heartbeat".to_string(),
            },
            SecurityErrorKind::TimestampSkew {
                now: 100,
                timestamp: 500,
            },
        ];

        let mut codes: Vec<u16> = kinds.iter().map(|k| k.close_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_protocol_error_shares_malformed_code() {
        let protocol = SecurityErrorKind::ProtocolError {
            message: "not an array".to_string(),
        };
        let malformed = SecurityErrorKind::MalformedEnvelope {
            message: "bad timestamp".to_string(),
        };
        assert_eq!(protocol.close_code(), malformed.close_code());
        assert_eq!(protocol.close_code(), 4003);
    }

    #[test]
    fn test_close_reason_leaks_no_detail() {
        let kind = SecurityErrorKind::ReplayDetected {
            nonce: "super-secret-nonce".to_string(),
        };
        assert!(!kind.close_reason().contains("super-secret-nonce"));
    }
}
