//! Per-connection state and the active-connection registry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SecurityErrorKind;
use crate::security::NonceCache;

/// State for one logical device session.
///
/// Created on connection accept, mutated on every inbound device frame,
/// and destroyed when the connection closes (normally, by violation, or by
/// watchdog action). Shared between the two forwarding tasks and the
/// watchdog via `Arc`.
pub struct ConnectionContext {
    /// Connection identifier, derived from the WebSocket request path.
    id: String,
    /// Fresh per session; distinguishes reconnects reusing the same id.
    session: Uuid,
    /// Unix seconds of the last inbound device frame.
    last_seen_at: AtomicU64,
    /// Recent message arrival times for the flood window.
    pub(crate) recent_message_times: Mutex<VecDeque<Instant>>,
    /// Index of the furthest phase reached in the expected sequence,
    /// -1 when no phase has been reached yet.
    pub(crate) last_action_index: AtomicI64,
    /// Present when nonce scope is per-connection.
    local_nonces: Option<Arc<NonceCache>>,
}

impl ConnectionContext {
    /// Create a context for a newly accepted connection.
    pub fn new(id: impl Into<String>, local_nonces: Option<Arc<NonceCache>>) -> Self {
        Self {
            id: id.into(),
            session: Uuid::new_v4(),
            last_seen_at: AtomicU64::new(0),
            recent_message_times: Mutex::new(VecDeque::new()),
            last_action_index: AtomicI64::new(-1),
            local_nonces,
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session id, fresh per accepted connection.
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Record inbound activity.
    pub fn touch(&self, now: u64) {
        self.last_seen_at.store(now, Ordering::Relaxed);
    }

    /// Unix seconds of the last inbound device frame.
    pub fn last_seen_at(&self) -> u64 {
        self.last_seen_at.load(Ordering::Relaxed)
    }

    /// Per-connection nonce cache, when that scope is configured.
    pub fn local_nonces(&self) -> Option<&Arc<NonceCache>> {
        self.local_nonces.as_ref()
    }
}

/// Registry entry: the context plus a channel to ask the connection's
/// relay tasks to close the transport with a violation code.
pub struct ConnectionHandle {
    ctx: Arc<ConnectionContext>,
    close_tx: mpsc::Sender<SecurityErrorKind>,
}

impl ConnectionHandle {
    /// The connection's context.
    pub fn ctx(&self) -> &Arc<ConnectionContext> {
        &self.ctx
    }

    /// Ask the connection's relay tasks to close with the given violation.
    ///
    /// Best-effort: the tasks may already be gone.
    pub fn close(&self, kind: SecurityErrorKind) {
        let _ = self.close_tx.try_send(kind);
    }
}

/// Concurrency-safe registry of active connections, keyed by connection id.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiver for close requests.
    ///
    /// A reconnect reusing an id replaces the stale entry; the old
    /// connection keeps running but can no longer be reached here.
    pub fn register(&self, ctx: Arc<ConnectionContext>) -> mpsc::Receiver<SecurityErrorKind> {
        let (close_tx, close_rx) = mpsc::channel(1);
        let handle = ConnectionHandle {
            ctx: Arc::clone(&ctx),
            close_tx,
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(ctx.id().to_string(), handle);

        close_rx
    }

    /// Remove a connection, but only if the entry still belongs to the
    /// given session. Returns whether an entry was removed.
    pub fn deregister(&self, id: &str, session: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(id) {
            Some(handle) if handle.ctx.session() == session => {
                inner.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether any connections are active.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every connection silent for longer than
    /// `timeout_seconds` as of `now`.
    pub fn take_idle(&self, now: u64, timeout_seconds: u64) -> Vec<ConnectionHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let idle_ids: Vec<String> = inner
            .iter()
            .filter(|(_, handle)| now.saturating_sub(handle.ctx.last_seen_at()) > timeout_seconds)
            .map(|(id, _)| id.clone())
            .collect();

        idle_ids
            .into_iter()
            .filter_map(|id| inner.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_deregister() {
        let registry = ConnectionRegistry::new();
        let ctx = Arc::new(ConnectionContext::new("CP_1", None));

        let _close_rx = registry.register(Arc::clone(&ctx));
        assert_eq!(registry.len(), 1);

        assert!(registry.deregister("CP_1", ctx.session()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deregister_requires_matching_session() {
        let registry = ConnectionRegistry::new();
        let old = Arc::new(ConnectionContext::new("CP_1", None));
        let new = Arc::new(ConnectionContext::new("CP_1", None));

        let _rx_old = registry.register(Arc::clone(&old));
        let _rx_new = registry.register(Arc::clone(&new)); // reconnect replaces

        // The old session's deregistration must not evict the new entry.
        assert!(!registry.deregister("CP_1", old.session()));
        assert_eq!(registry.len(), 1);

        assert!(registry.deregister("CP_1", new.session()));
    }

    #[test]
    fn test_take_idle_selects_only_silent_connections() {
        let registry = ConnectionRegistry::new();

        let fresh = Arc::new(ConnectionContext::new("CP_fresh", None));
        fresh.touch(1000);
        let silent = Arc::new(ConnectionContext::new("CP_silent", None));
        silent.touch(900);

        let _rx1 = registry.register(Arc::clone(&fresh));
        let _rx2 = registry.register(Arc::clone(&silent));

        let idle = registry.take_idle(1000, 30);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].ctx().id(), "CP_silent");

        // Reaped entries are gone from the active set.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_take_idle_boundary_is_exclusive() {
        let registry = ConnectionRegistry::new();
        let ctx = Arc::new(ConnectionContext::new("CP_1", None));
        ctx.touch(970);
        let _rx = registry.register(Arc::clone(&ctx));

        // Exactly at the timeout: not yet a suppression.
        assert!(registry.take_idle(1000, 30).is_empty());
        // One second past: reaped.
        assert_eq!(registry.take_idle(1001, 30).len(), 1);
    }

    #[tokio::test]
    async fn test_close_signal_reaches_receiver() {
        let registry = ConnectionRegistry::new();
        let ctx = Arc::new(ConnectionContext::new("CP_1", None));
        let mut close_rx = registry.register(Arc::clone(&ctx));

        let idle = registry.take_idle(1000, 30);
        idle[0].close(SecurityErrorKind::SuppressionDetected { silent_seconds: 40 });

        let kind = close_rx.recv().await.unwrap();
        assert!(matches!(
            kind,
            SecurityErrorKind::SuppressionDetected { silent_seconds: 40 }
        ));
    }
}
