//! Expected-sequence reorder detection.

use std::sync::atomic::Ordering;

use crate::error::SecurityErrorKind;
use crate::relay::ConnectionContext;

/// Checks session actions against a configured phase sequence.
///
/// Session progression is modeled as a monotonic index into the expected
/// sequence. Actions not in the sequence are not ordering-sensitive and
/// pass unchecked. Repeats of the reached phase (e.g. multiple heartbeats)
/// are allowed; only a step to an earlier phase is a reorder.
pub struct OrderValidator {
    expected: Vec<String>,
}

impl OrderValidator {
    /// Create a validator for the given expected action sequence.
    pub fn new(expected: Vec<String>) -> Self {
        Self { expected }
    }

    /// Check an observed action and advance the connection's phase index.
    pub fn observe(
        &self,
        ctx: &ConnectionContext,
        action: &str,
    ) -> Result<(), SecurityErrorKind> {
        let idx = match self.expected.iter().position(|a| a == action) {
            Some(idx) => idx as i64,
            // Unmodeled action: pass through unchecked.
            None => return Ok(()),
        };

        let last = ctx.last_action_index.load(Ordering::Relaxed);
        if idx < last {
            return Err(SecurityErrorKind::ReorderDetected {
                action: action.to_string(),
            });
        }

        ctx.last_action_index.store(idx, Ordering::Relaxed);
        Ok(())
    }
}
