//! Audit entry types.

use serde::Serialize;
use uuid::Uuid;

use crate::error::SecurityErrorKind;

/// A single security audit entry.
///
/// Records a violation with enough context for offline analysis: which
/// connection, which check fired, and the nonce/action involved where
/// applicable. Inner payload bodies are never recorded.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// ISO 8601 timestamp when the violation was detected.
    pub timestamp: String,
    /// Session identifier of the relay pair (fresh per connection).
    pub session: Uuid,
    /// Charge point connection id (from the request path).
    pub connection_id: String,
    /// Violation label (replay, tamper, reorder, flood, suppress, ...).
    pub violation: String,
    /// Close code sent to the peer.
    pub close_code: u16,
    /// Full violation detail (server-side only; never sent on the wire).
    pub detail: String,
    /// Inner action involved, when one was extracted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Envelope nonce involved, for replay events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl AuditEntry {
    /// Create an entry for a detected violation.
    pub fn violation(
        timestamp: String,
        session: Uuid,
        connection_id: String,
        kind: &SecurityErrorKind,
        action: Option<String>,
    ) -> Self {
        let nonce = match kind {
            SecurityErrorKind::ReplayDetected { nonce } => Some(nonce.clone()),
            _ => None,
        };

        Self {
            timestamp,
            session,
            connection_id,
            violation: kind.label().to_string(),
            close_code: kind.close_code(),
            detail: kind.to_string(),
            action,
            nonce,
        }
    }
}
