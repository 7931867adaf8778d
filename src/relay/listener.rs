//! Proxy listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::config::Settings;
use crate::error::ProxyError;
use crate::metrics::SecurityMetrics;
use crate::security::{EnvelopeSigner, FloodDetector, NonceCache, OrderValidator};

use super::{handle_connection, ConnectionDeps, ConnectionRegistry};

/// TCP/WebSocket listener accepting charge point connections.
pub struct ProxyListener {
    listener: TcpListener,
    deps: ConnectionDeps,
    /// Semaphore for connection limiting
    connection_semaphore: Arc<Semaphore>,
}

impl ProxyListener {
    /// Create and bind a new proxy listener.
    ///
    /// Loads the shared secret and assembles the security pipeline shared
    /// by every connection.
    pub async fn bind(
        settings: Arc<Settings>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<SecurityMetrics>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(&settings.proxy.listen_addr)
            .await
            .map_err(|e| ProxyError::Transport {
                message: format!(
                    "Failed to bind to {}: {}",
                    settings.proxy.listen_addr, e
                ),
            })?;

        // Load the shared secret and create the signer.
        let secret = EnvelopeSigner::load_secret(&settings.security.secret_path)?;
        let signer = Arc::new(EnvelopeSigner::new(
            &secret,
            settings.security.allowed_skew_seconds,
        ));

        let global_nonces = Arc::new(NonceCache::new(
            settings.security.nonce_ttl_seconds,
            settings.security.nonce_cache_max,
        ));

        let flood = Arc::new(FloodDetector::new(
            Duration::from_secs(settings.flood.window_seconds),
            settings.flood.limit,
        ));
        info!(
            window_seconds = settings.flood.window_seconds,
            limit = settings.flood.limit,
            "Flood detection enabled"
        );

        let order = Arc::new(OrderValidator::new(settings.order.expected_actions.clone()));

        let connection_semaphore = Arc::new(Semaphore::new(settings.limits.max_connections));
        info!(
            max_connections = settings.limits.max_connections,
            "Connection limiting enabled"
        );

        let audit = if settings.audit.enabled {
            match AuditLogger::new(&settings.audit.log_path) {
                Ok(logger) => {
                    info!(
                        path = %settings.audit.log_path.display(),
                        "Audit logging enabled"
                    );
                    Some(Arc::new(logger))
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %settings.audit.log_path.display(),
                        "Failed to create audit logger, audit logging disabled"
                    );
                    None
                }
            }
        } else {
            info!("Audit logging disabled");
            None
        };

        info!(
            addr = %listener.local_addr()?,
            central = %settings.central.uri,
            "Proxy listener bound"
        );

        Ok(Self {
            listener,
            deps: ConnectionDeps {
                settings,
                signer,
                global_nonces,
                flood,
                order,
                registry,
                metrics,
                audit,
            },
            connection_semaphore,
        })
    }

    /// The bound local address (useful with an OS-assigned port).
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Get the security metrics.
    pub fn metrics(&self) -> Arc<SecurityMetrics> {
        Arc::clone(&self.deps.metrics)
    }

    /// Get the active-connection registry.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.deps.registry)
    }

    /// Get the process-wide nonce cache.
    pub fn nonce_cache(&self) -> Arc<NonceCache> {
        Arc::clone(&self.deps.global_nonces)
    }

    /// Get the audit logger, when enabled.
    pub fn audit(&self) -> Option<Arc<AuditLogger>> {
        self.deps.audit.clone()
    }

    /// Run the listener, accepting connections.
    ///
    /// The listener stops accepting new connections when `shutdown` is
    /// notified. Active relays continue until they complete or are closed.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), ProxyError> {
        info!("Proxy listener running, waiting for charge points...");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            // Try to acquire a connection permit
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        max = self.deps.settings.limits.max_connections,
                                        "Connection limit reached, rejecting connection"
                                    );
                                    // Connection is dropped, rejecting the client
                                    continue;
                                }
                            };

                            let deps = self.deps.clone();
                            debug!(peer = %peer_addr, "New connection accepted");

                            // Permit is moved into the task and released when it ends
                            tokio::spawn(async move {
                                let _permit = permit;
                                match handle_connection(stream, deps).await {
                                    Ok(()) => {}
                                    // Violations are logged (and audited) where they fire.
                                    Err(ProxyError::Security { .. }) => {}
                                    Err(e) => {
                                        error!(peer = %peer_addr, error = %e, "Connection handler error");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Wait for all active relays to drain.
    ///
    /// Returns immediately if there are no active connections.
    pub async fn wait_for_drain(&self) {
        let poll_interval = Duration::from_millis(100);

        while !self.deps.registry.is_empty() {
            debug!(
                active = self.deps.registry.len(),
                "Waiting for connections to drain"
            );
            tokio::time::sleep(poll_interval).await;
        }

        info!("All connections drained");
    }
}
