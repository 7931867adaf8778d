//! Inner OCPP frame parsing.
//!
//! The security layer only needs an ordering key (the action) and a
//! correlation id out of the inner frame; the body stays opaque.

use serde_json::Value;

use crate::error::SecurityErrorKind;

/// OCPP message type id for a call.
pub const MESSAGE_TYPE_CALL: i64 = 2;
/// OCPP message type id for a call result.
pub const MESSAGE_TYPE_CALL_RESULT: i64 = 3;

/// Parsed view of an inner protocol frame.
///
/// `[messageTypeId, correlationId, action, body?]` for calls,
/// `[messageTypeId, correlationId, body]` for results. Only the fields the
/// security layer consumes are extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerFrame {
    pub message_type_id: i64,
    pub correlation_id: String,
    /// Present when the third element is a string (call frames). Result
    /// frames carry a body there instead and are not ordering-sensitive.
    pub action: Option<String>,
}

impl InnerFrame {
    /// Parse an inner frame from JSON text.
    ///
    /// Structurally invalid frames (non-JSON, not an array, fewer than
    /// three elements, wrong leading types) are protocol errors.
    pub fn parse(text: &str) -> Result<InnerFrame, SecurityErrorKind> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            SecurityErrorKind::ProtocolError {
                message: format!("inner frame is not JSON: {}", e),
            }
        })?;

        Self::from_value(&value)
    }

    /// Parse an inner frame from an already-parsed JSON value.
    pub fn from_value(value: &Value) -> Result<InnerFrame, SecurityErrorKind> {
        let items = value.as_array().ok_or_else(|| SecurityErrorKind::ProtocolError {
            message: "inner frame is not a JSON array".to_string(),
        })?;

        if items.len() < 3 {
            return Err(SecurityErrorKind::ProtocolError {
                message: format!("inner frame has {} elements, expected at least 3", items.len()),
            });
        }

        let message_type_id = items[0].as_i64().ok_or_else(|| {
            SecurityErrorKind::ProtocolError {
                message: "inner frame message type id is not an integer".to_string(),
            }
        })?;

        let correlation_id = items[1]
            .as_str()
            .ok_or_else(|| SecurityErrorKind::ProtocolError {
                message: "inner frame correlation id is not a string".to_string(),
            })?
            .to_string();

        let action = items[2].as_str().map(|s| s.to_string());

        Ok(InnerFrame {
            message_type_id,
            correlation_id,
            action,
        })
    }

    /// Whether this is a call frame (carries an action).
    pub fn is_call(&self) -> bool {
        self.message_type_id == MESSAGE_TYPE_CALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call_frame() {
        let frame = InnerFrame::parse(
            r#"[2, "uid-1", "BootNotification", {"chargePointVendor": "DemoVendor"}]"#,
        )
        .unwrap();

        assert_eq!(frame.message_type_id, MESSAGE_TYPE_CALL);
        assert_eq!(frame.correlation_id, "uid-1");
        assert_eq!(frame.action.as_deref(), Some("BootNotification"));
        assert!(frame.is_call());
    }

    #[test]
    fn test_parse_result_frame_has_no_action() {
        let frame = InnerFrame::parse(r#"[3, "uid-1", {"status": "Accepted"}]"#).unwrap();

        assert_eq!(frame.message_type_id, MESSAGE_TYPE_CALL_RESULT);
        assert_eq!(frame.correlation_id, "uid-1");
        assert_eq!(frame.action, None);
        assert!(!frame.is_call());
    }

    #[test]
    fn test_parse_rejects_non_array() {
        let err = InnerFrame::parse(r#"{"action": "Heartbeat"}"#).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::ProtocolError { .. }));
    }

    #[test]
    fn test_parse_rejects_short_array() {
        let err = InnerFrame::parse(r#"[2, "uid-1"]"#).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::ProtocolError { .. }));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = InnerFrame::parse("garbage").unwrap_err();
        assert!(matches!(err, SecurityErrorKind::ProtocolError { .. }));
    }

    #[test]
    fn test_parse_rejects_bad_leading_types() {
        let err = InnerFrame::parse(r#"["2", "uid-1", "Heartbeat"]"#).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::ProtocolError { .. }));

        let err = InnerFrame::parse(r#"[2, 7, "Heartbeat"]"#).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::ProtocolError { .. }));
    }
}
