//! Signed envelope wire format.
//!
//! The envelope is the outer JSON object wrapping an opaque inner protocol
//! payload:
//!
//! ```json
//! {
//!   "envelope_version": "1.0",
//!   "nonce": "…",
//!   "timestamp": 1700000000,
//!   "signature": "hex…",
//!   "payload": "[2,\"1\",\"BootNotification\",{…}]"
//! }
//! ```
//!
//! A frame whose JSON lacks `envelope_version` is a legacy/raw frame and
//! bypasses unwrapping entirely.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SecurityErrorKind;

/// Envelope schema version emitted by this proxy.
pub const ENVELOPE_VERSION: &str = "1.0";

/// A signed envelope carrying one inner protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope schema version. Presence of this field on the wire is what
    /// distinguishes an envelope from a legacy frame.
    pub envelope_version: String,

    /// Single-use random token bound to this message.
    pub nonce: String,

    /// Sender-claimed unix timestamp in seconds.
    pub timestamp: u64,

    /// HMAC-SHA256 signature (hex-encoded) over
    /// `canonicalize(payload) || nonce || timestamp`.
    pub signature: String,

    /// Inner protocol frame as JSON text, opaque at this layer.
    pub payload: String,
}

impl Envelope {
    /// Classify a frame as envelope or legacy/raw.
    ///
    /// Returns `Ok(Some(envelope))` for a JSON object carrying
    /// `envelope_version`, `Ok(None)` for anything else that is still valid
    /// JSON, and `MalformedEnvelope` when the object claims to be an
    /// envelope but is missing fields or carries a non-integer timestamp.
    pub fn classify(frame: &Value) -> Result<Option<Envelope>, SecurityErrorKind> {
        let is_envelope = frame
            .as_object()
            .map(|obj| obj.contains_key("envelope_version"))
            .unwrap_or(false);

        if !is_envelope {
            return Ok(None);
        }

        let envelope: Envelope = serde_json::from_value(frame.clone()).map_err(|e| {
            SecurityErrorKind::MalformedEnvelope {
                message: e.to_string(),
            }
        })?;

        Ok(Some(envelope))
    }

    /// Serialize the envelope to wire JSON text.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome of payload canonicalization.
///
/// Tagged explicitly so that "was JSON" is a value, not a caught exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalPayload {
    /// The payload parsed as JSON and was re-serialized in normal form
    /// (object keys sorted, no insignificant whitespace).
    Canonical(String),
    /// The payload is not JSON; signed as-is.
    Raw(String),
}

impl CanonicalPayload {
    /// The text actually fed into the HMAC.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Canonical(s) | Self::Raw(s) => s,
        }
    }
}

/// Canonicalize a payload for signing.
///
/// The signature must be computed over a normal form independent of
/// incidental formatting introduced by intermediate re-serialization.
/// `serde_json` objects are ordered maps, so a parse/re-serialize round
/// trip yields sorted keys and compact separators.
pub fn canonicalize(payload: &str) -> CanonicalPayload {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => match serde_json::to_string(&value) {
            Ok(text) => CanonicalPayload::Canonical(text),
            Err(_) => CanonicalPayload::Raw(payload.to_string()),
        },
        Err(_) => CanonicalPayload::Raw(payload.to_string()),
    }
}
