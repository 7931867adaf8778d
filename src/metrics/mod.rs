//! Security metrics.
//!
//! Process-wide monotonic counters plus a bounded rolling window of
//! forward-latency samples. Reset only on restart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::info;

use crate::error::SecurityErrorKind;

/// Number of latency samples retained in the rolling window.
const LATENCY_SAMPLE_CAP: usize = 1024;

/// Process-wide security counters.
#[derive(Debug, Default)]
pub struct SecurityMetrics {
    /// Total inbound frames observed.
    pub total: AtomicU64,
    /// Frames forwarded to the other peer.
    pub forwarded: AtomicU64,
    /// Frames blocked for any reason.
    pub blocked: AtomicU64,
    /// Replay violations.
    pub replay: AtomicU64,
    /// Tamper violations.
    pub tamper: AtomicU64,
    /// Reorder violations.
    pub reorder: AtomicU64,
    /// Flood violations.
    pub flood: AtomicU64,
    /// Suppression events.
    pub suppress: AtomicU64,
    /// Rolling forward-latency samples in milliseconds.
    latencies: Mutex<VecDeque<f64>>,
}

/// Summary of the rolling latency window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl SecurityMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound frame.
    pub fn record_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a forwarded frame, with an optional latency sample.
    pub fn record_forwarded(&self, latency_ms: Option<f64>) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);

        if let Some(latency) = latency_ms {
            let mut samples = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
            if samples.len() == LATENCY_SAMPLE_CAP {
                samples.pop_front();
            }
            samples.push_back(latency);
        }
    }

    /// Record a security violation: bumps `blocked` plus the violation's
    /// own counter where it has one.
    pub fn record_violation(&self, kind: &SecurityErrorKind) {
        self.blocked.fetch_add(1, Ordering::Relaxed);

        let counter = match kind {
            SecurityErrorKind::ReplayDetected { .. } => &self.replay,
            SecurityErrorKind::TamperDetected => &self.tamper,
            SecurityErrorKind::ReorderDetected { .. } => &self.reorder,
            SecurityErrorKind::FloodDetected { .. } => &self.flood,
            SecurityErrorKind::SuppressionDetected { .. } => &self.suppress,
            // Malformed/skew/protocol count only toward blocked.
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Summarize the rolling latency window.
    pub fn latency_summary(&self) -> LatencySummary {
        let samples = self.latencies.lock().unwrap_or_else(|e| e.into_inner());

        if samples.is_empty() {
            return LatencySummary {
                count: 0,
                avg_ms: 0.0,
                min_ms: 0.0,
                max_ms: 0.0,
            };
        }

        let sum: f64 = samples.iter().sum();
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        LatencySummary {
            count: samples.len(),
            avg_ms: sum / samples.len() as f64,
            min_ms: min,
            max_ms: max,
        }
    }

    /// Log a one-line summary of all counters and latency.
    pub fn log_summary(&self) {
        let latency = self.latency_summary();
        info!(
            total = self.total.load(Ordering::Relaxed),
            forwarded = self.forwarded.load(Ordering::Relaxed),
            blocked = self.blocked.load(Ordering::Relaxed),
            replay = self.replay.load(Ordering::Relaxed),
            tamper = self.tamper.load(Ordering::Relaxed),
            reorder = self.reorder.load(Ordering::Relaxed),
            flood = self.flood.load(Ordering::Relaxed),
            suppress = self.suppress.load(Ordering::Relaxed),
            latency_avg_ms = format!("{:.2}", latency.avg_ms),
            latency_min_ms = format!("{:.2}", latency.min_ms),
            latency_max_ms = format!("{:.2}", latency.max_ms),
            "Security metrics"
        );
    }
}
