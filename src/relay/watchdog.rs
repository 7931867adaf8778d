//! Liveness watchdog.
//!
//! A withheld heartbeat is itself the attack: no frame arrives to inspect,
//! so suppression can only be caught by a scanner running independently of
//! frame arrival. This is the one component that terminates a connection
//! without an inbound message triggering it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::audit::{AuditEntry, AuditLogger};
use crate::error::SecurityErrorKind;
use crate::metrics::SecurityMetrics;
use crate::security::unix_now;

use super::ConnectionRegistry;

/// Background scanner closing silent connections.
pub struct LivenessWatchdog {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<SecurityMetrics>,
    audit: Option<Arc<AuditLogger>>,
    /// Silence longer than this is a suppression event.
    heartbeat_timeout_seconds: u64,
    scan_interval: Duration,
}

impl LivenessWatchdog {
    /// Create a new watchdog over the given registry.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<SecurityMetrics>,
        audit: Option<Arc<AuditLogger>>,
        heartbeat_timeout_seconds: u64,
        scan_interval: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            audit,
            heartbeat_timeout_seconds,
            scan_interval,
        }
    }

    /// Run periodic scans until `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        // The first tick completes immediately; consume it so scans start
        // one interval after launch.
        ticker.tick().await;

        info!(
            heartbeat_timeout_seconds = self.heartbeat_timeout_seconds,
            scan_interval_seconds = self.scan_interval.as_secs(),
            "Liveness watchdog running"
        );

        // Created once so a notify_waiters() arriving mid-scan is not lost.
        let stopped = shutdown.notified();
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan(unix_now());
                }
                _ = &mut stopped => {
                    info!("Shutdown signal received, stopping watchdog");
                    break;
                }
            }
        }
    }

    /// Scan once at the given clock reading, closing every connection
    /// silent for longer than the heartbeat timeout. Returns the number of
    /// connections closed.
    pub fn scan(&self, now: u64) -> usize {
        let idle = self.registry.take_idle(now, self.heartbeat_timeout_seconds);
        let closed = idle.len();

        for handle in idle {
            let ctx = handle.ctx();
            let silent_seconds = now.saturating_sub(ctx.last_seen_at());
            let kind = SecurityErrorKind::SuppressionDetected { silent_seconds };

            error!(
                connection_id = %ctx.id(),
                session = %ctx.session(),
                silent_seconds,
                "Heartbeat suppression detected"
            );

            self.metrics.record_violation(&kind);

            if let Some(logger) = &self.audit {
                let entry = AuditEntry::violation(
                    Utc::now().to_rfc3339(),
                    ctx.session(),
                    ctx.id().to_string(),
                    &kind,
                    None,
                );
                if let Err(e) = logger.log(&entry) {
                    error!(error = %e, "Failed to write audit log entry");
                }
            }

            handle.close(kind);
            self.metrics.log_summary();
        }

        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ConnectionContext;
    use std::sync::atomic::Ordering;

    fn watchdog(registry: Arc<ConnectionRegistry>, metrics: Arc<SecurityMetrics>) -> LivenessWatchdog {
        LivenessWatchdog::new(registry, metrics, None, 30, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_scan_closes_silent_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(SecurityMetrics::new());

        let ctx = Arc::new(ConnectionContext::new("CP_1", None));
        ctx.touch(1000);
        let mut close_rx = registry.register(Arc::clone(&ctx));

        let dog = watchdog(Arc::clone(&registry), Arc::clone(&metrics));

        // Silent for 31s: reaped, counted, close requested.
        assert_eq!(dog.scan(1031), 1);
        assert!(registry.is_empty());
        assert_eq!(metrics.suppress.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.blocked.load(Ordering::Relaxed), 1);

        let kind = close_rx.recv().await.unwrap();
        assert!(matches!(
            kind,
            SecurityErrorKind::SuppressionDetected { silent_seconds: 31 }
        ));
    }

    #[tokio::test]
    async fn test_scan_leaves_live_connections_alone() {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(SecurityMetrics::new());

        let ctx = Arc::new(ConnectionContext::new("CP_1", None));
        ctx.touch(1020);
        let _close_rx = registry.register(Arc::clone(&ctx));

        let dog = watchdog(Arc::clone(&registry), Arc::clone(&metrics));

        assert_eq!(dog.scan(1031), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(metrics.suppress.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_run_is_cancellable() {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(SecurityMetrics::new());
        let dog = Arc::new(LivenessWatchdog::new(
            registry,
            metrics,
            None,
            30,
            Duration::from_millis(10),
        ));

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn({
            let dog = Arc::clone(&dog);
            let shutdown = Arc::clone(&shutdown);
            async move { dog.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.notify_waiters();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watchdog should stop on shutdown")
            .unwrap();
    }
}
