//! Sliding-window flood detection.

use std::time::{Duration, Instant};

use crate::error::SecurityErrorKind;
use crate::relay::ConnectionContext;

/// Per-connection sliding window rate check.
///
/// The window and limit are static configuration, not adaptive. Message
/// times live in the connection's own context; this struct only carries
/// the policy.
pub struct FloodDetector {
    window: Duration,
    limit: usize,
}

impl FloodDetector {
    /// Create a new flood detector.
    pub fn new(window: Duration, limit: usize) -> Self {
        Self { window, limit }
    }

    /// Record a message arrival and check the rate.
    ///
    /// Flags the message that crosses the threshold, not earlier: entries
    /// older than the window are dropped, the arrival is appended, and the
    /// resulting count must not exceed the limit.
    pub fn observe(&self, ctx: &ConnectionContext) -> Result<(), SecurityErrorKind> {
        self.observe_at(ctx, Instant::now())
    }

    fn observe_at(&self, ctx: &ConnectionContext, now: Instant) -> Result<(), SecurityErrorKind> {
        let mut times = ctx
            .recent_message_times
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        while let Some(front) = times.front() {
            if now.duration_since(*front) > self.window {
                times.pop_front();
            } else {
                break;
            }
        }

        times.push_back(now);

        if times.len() > self.limit {
            return Err(SecurityErrorKind::FloodDetected { count: times.len() });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConnectionContext {
        ConnectionContext::new("CP_1", None)
    }

    #[test]
    fn test_allows_up_to_limit() {
        let detector = FloodDetector::new(Duration::from_secs(2), 5);
        let ctx = ctx();
        let start = Instant::now();

        for i in 0..5 {
            detector
                .observe_at(&ctx, start + Duration::from_millis(i * 10))
                .unwrap();
        }
    }

    #[test]
    fn test_flags_the_message_that_crosses_the_threshold() {
        let detector = FloodDetector::new(Duration::from_secs(2), 3);
        let ctx = ctx();
        let start = Instant::now();

        detector.observe_at(&ctx, start).unwrap();
        detector
            .observe_at(&ctx, start + Duration::from_millis(10))
            .unwrap();
        detector
            .observe_at(&ctx, start + Duration::from_millis(20))
            .unwrap();

        let err = detector
            .observe_at(&ctx, start + Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, SecurityErrorKind::FloodDetected { count: 4 }));
    }

    #[test]
    fn test_window_slides() {
        let detector = FloodDetector::new(Duration::from_millis(100), 2);
        let ctx = ctx();
        let start = Instant::now();

        detector.observe_at(&ctx, start).unwrap();
        detector
            .observe_at(&ctx, start + Duration::from_millis(10))
            .unwrap();

        // Past the window: earlier entries have aged out.
        detector
            .observe_at(&ctx, start + Duration::from_millis(150))
            .unwrap();
        detector
            .observe_at(&ctx, start + Duration::from_millis(160))
            .unwrap();
    }

    #[test]
    fn test_burst_within_any_window_position_detected() {
        let detector = FloodDetector::new(Duration::from_millis(100), 2);
        let ctx = ctx();
        let start = Instant::now();

        detector.observe_at(&ctx, start).unwrap();
        detector
            .observe_at(&ctx, start + Duration::from_millis(60))
            .unwrap();
        // Third message while both are still inside the sliding window.
        let err = detector
            .observe_at(&ctx, start + Duration::from_millis(90))
            .unwrap_err();
        assert!(matches!(err, SecurityErrorKind::FloodDetected { .. }));
    }
}
