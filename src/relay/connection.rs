//! Per-connection relay handler.
//!
//! Each accepted device connection gets an upstream connection to the
//! central system and two concurrent forwarding paths (device-to-central,
//! central-to-device) sharing one [`ConnectionContext`]. If either path hits
//! a closing condition the other is cancelled, so no half-open relay
//! leaks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger};
use crate::config::{NonceScope, Settings};
use crate::error::{ProxyError, SecurityErrorKind};
use crate::metrics::SecurityMetrics;
use crate::protocol::{Envelope, InnerFrame};
use crate::security::{unix_now, EnvelopeSigner, FloodDetector, NonceCache, OrderValidator};

use super::{ConnectionContext, ConnectionRegistry};

/// Subprotocol spoken on the upstream leg to the central system.
pub const ENVELOPE_SUBPROTOCOL: &str = "ocpp-envelope";

type DeviceSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type DeviceStream = SplitStream<WebSocketStream<TcpStream>>;
type CentralSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type CentralStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Shared collaborators handed to every connection handler.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub settings: Arc<Settings>,
    pub signer: Arc<EnvelopeSigner>,
    pub global_nonces: Arc<NonceCache>,
    pub flood: Arc<FloodDetector>,
    pub order: Arc<OrderValidator>,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: Arc<SecurityMetrics>,
    pub audit: Option<Arc<AuditLogger>>,
}

/// Handle a single charge point connection end to end.
pub async fn handle_connection(stream: TcpStream, deps: ConnectionDeps) -> Result<(), ProxyError> {
    let ws_config = || WebSocketConfig {
        max_message_size: Some(deps.settings.limits.max_message_size),
        ..Default::default()
    };

    // Capture the request path during the handshake; it identifies the
    // charge point. Echo the first offered subprotocol back so OCPP
    // clients that require negotiation stay happy.
    let mut path = String::new();
    let device_ws = accept_hdr_async_with_config(
        stream,
        |req: &Request, mut resp: Response| {
            path = req.uri().path().trim_start_matches('/').to_string();
            if let Some(offered) = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                if let Ok(value) = HeaderValue::from_str(offered) {
                    resp.headers_mut().insert("Sec-WebSocket-Protocol", value);
                }
            }
            Ok(resp)
        },
        Some(ws_config()),
    )
    .await?;

    let connection_id = if path.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        path
    };

    let local_nonces = match deps.settings.security.nonce_scope {
        NonceScope::Global => None,
        NonceScope::PerConnection => Some(Arc::new(NonceCache::new(
            deps.settings.security.nonce_ttl_seconds,
            deps.settings.security.nonce_cache_max,
        ))),
    };

    let ctx = Arc::new(ConnectionContext::new(connection_id, local_nonces));
    ctx.touch(unix_now());

    info!(
        connection_id = %ctx.id(),
        session = %ctx.session(),
        "Charge point connected"
    );

    // Open the upstream leg before registering: a connection that never
    // relays anything has nothing for the watchdog to close.
    let mut request = deps
        .settings
        .central
        .uri
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::Transport {
            message: format!("Invalid central URI: {}", e),
        })?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(ENVELOPE_SUBPROTOCOL),
    );

    let (central_ws, _) = connect_async_with_config(request, Some(ws_config()), false)
        .await
        .map_err(|e| ProxyError::Transport {
            message: format!("Failed to connect to central system: {}", e),
        })?;

    let close_rx = deps.registry.register(Arc::clone(&ctx));

    let (device_write, device_read) = device_ws.split();
    let device_write = Mutex::new(device_write);
    let (central_write, central_read) = central_ws.split();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    let result = tokio::select! {
        r = device_to_central(&deps, &ctx, device_read, central_write, &device_write, reply_rx) => r,
        r = central_to_device(&deps, &ctx, central_read, &device_write, reply_tx, close_rx) => r,
    };

    deps.registry.deregister(ctx.id(), ctx.session());

    match &result {
        Ok(()) => info!(
            connection_id = %ctx.id(),
            session = %ctx.session(),
            "Relay session ended"
        ),
        Err(ProxyError::Security { kind }) => info!(
            connection_id = %ctx.id(),
            session = %ctx.session(),
            close_code = kind.close_code(),
            "Relay session closed on security violation"
        ),
        Err(_) => {}
    }

    result
}

/// Device-to-central forwarding path: the full inspection pipeline.
async fn device_to_central(
    deps: &ConnectionDeps,
    ctx: &Arc<ConnectionContext>,
    mut device_read: DeviceStream,
    mut central_write: CentralSink,
    device_write: &Mutex<DeviceSink>,
    mut reply_rx: mpsc::UnboundedReceiver<String>,
) -> Result<(), ProxyError> {
    let response_wait = Duration::from_secs(deps.settings.central.response_wait_seconds);

    while let Some(message) = device_read.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!(connection_id = %ctx.id(), "Device closed connection");
                return Ok(());
            }
            Ok(Message::Binary(_)) => {
                deps.metrics.record_total();
                let kind = SecurityErrorKind::ProtocolError {
                    message: "binary frame on text protocol".to_string(),
                };
                return Err(violation_close(deps, ctx, device_write, kind, None).await);
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %ctx.id(), error = %e, "Device read error");
                return Ok(());
            }
        };

        deps.metrics.record_total();
        ctx.touch(unix_now());

        if let Err(kind) = deps.flood.observe(ctx) {
            return Err(violation_close(deps, ctx, device_write, kind, None).await);
        }

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                let kind = SecurityErrorKind::ProtocolError {
                    message: format!("frame is not JSON: {}", e),
                };
                return Err(violation_close(deps, ctx, device_write, kind, None).await);
            }
        };

        let inner_text = match Envelope::classify(&value) {
            Ok(Some(envelope)) => {
                let nonces = ctx.local_nonces().unwrap_or(&deps.global_nonces);
                if let Err(kind) = deps.signer.verify(&envelope, nonces) {
                    return Err(violation_close(deps, ctx, device_write, kind, None).await);
                }
                envelope.payload
            }
            // Legacy raw frame: bypasses unwrapping, still flood/order-checked.
            Ok(None) => text,
            Err(kind) => {
                return Err(violation_close(deps, ctx, device_write, kind, None).await);
            }
        };

        let frame = match InnerFrame::parse(&inner_text) {
            Ok(frame) => frame,
            Err(kind) => {
                return Err(violation_close(deps, ctx, device_write, kind, None).await);
            }
        };

        if let Some(action) = frame.action.as_deref() {
            if let Err(kind) = deps.order.observe(ctx, action) {
                return Err(violation_close(deps, ctx, device_write, kind, Some(action)).await);
            }
        }

        // Re-wrap into a fresh envelope before upstream forwarding.
        let wire = deps.signer.wrap(&inner_text).to_wire()?;
        let started = Instant::now();
        central_write
            .send(Message::Text(wire))
            .await
            .map_err(|e| ProxyError::Transport {
                message: format!("Upstream send failed: {}", e),
            })?;

        // Bounded wait for the correlated reply to have been relayed back
        // before the next frame. Expiry means "no immediate reply", never
        // an error.
        let correlated = timeout(response_wait, async {
            while let Some(correlation_id) = reply_rx.recv().await {
                if correlation_id == frame.correlation_id {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        let latency_ms = correlated.then(|| started.elapsed().as_secs_f64() * 1000.0);
        deps.metrics.record_forwarded(latency_ms);

        debug!(
            connection_id = %ctx.id(),
            action = frame.action.as_deref().unwrap_or("-"),
            correlated,
            "Frame forwarded upstream"
        );
    }

    debug!(connection_id = %ctx.id(), "Device stream ended");
    Ok(())
}

/// Central-to-device forwarding path, plus delivery of watchdog close
/// requests (the device sink lives here).
async fn central_to_device(
    deps: &ConnectionDeps,
    ctx: &Arc<ConnectionContext>,
    mut central_read: CentralStream,
    device_write: &Mutex<DeviceSink>,
    reply_tx: mpsc::UnboundedSender<String>,
    mut close_rx: mpsc::Receiver<SecurityErrorKind>,
) -> Result<(), ProxyError> {
    let mut close_rx_open = true;

    loop {
        tokio::select! {
            signal = close_rx.recv(), if close_rx_open => {
                match signal {
                    Some(kind) => {
                        // The sender (watchdog) already recorded the
                        // violation; only the close frame is owed here.
                        send_close(device_write, &kind).await;
                        return Err(ProxyError::security(kind));
                    }
                    None => {
                        // Registry entry replaced by a reconnect; no close
                        // requests can arrive anymore.
                        close_rx_open = false;
                    }
                }
            }
            message = central_read.next() => {
                let Some(message) = message else {
                    debug!(connection_id = %ctx.id(), "Central stream ended");
                    return Ok(());
                };

                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => {
                        debug!(connection_id = %ctx.id(), "Central closed connection");
                        return Ok(());
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(connection_id = %ctx.id(), error = %e, "Central read error");
                        return Ok(());
                    }
                };

                ctx.touch(unix_now());

                let value: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        let kind = SecurityErrorKind::ProtocolError {
                            message: format!("central frame is not JSON: {}", e),
                        };
                        return Err(violation_close(deps, ctx, device_write, kind, None).await);
                    }
                };

                let inner_text = match Envelope::classify(&value) {
                    Ok(Some(envelope)) => {
                        let nonces = ctx.local_nonces().unwrap_or(&deps.global_nonces);
                        if let Err(kind) = deps.signer.verify(&envelope, nonces) {
                            return Err(violation_close(deps, ctx, device_write, kind, None).await);
                        }
                        envelope.payload
                    }
                    Ok(None) => text,
                    Err(kind) => {
                        return Err(violation_close(deps, ctx, device_write, kind, None).await);
                    }
                };

                let frame = match InnerFrame::parse(&inner_text) {
                    Ok(frame) => frame,
                    Err(kind) => {
                        return Err(violation_close(deps, ctx, device_write, kind, None).await);
                    }
                };

                // The device speaks the unwrapped protocol: forward the
                // inner payload unchanged.
                {
                    let mut sink = device_write.lock().await;
                    if let Err(e) = sink.send(Message::Text(inner_text)).await {
                        debug!(connection_id = %ctx.id(), error = %e, "Device send failed");
                        return Ok(());
                    }
                }

                let _ = reply_tx.send(frame.correlation_id);
            }
        }
    }
}

/// Record a violation, deliver the close frame, and produce the error that
/// terminates the relay pair.
async fn violation_close(
    deps: &ConnectionDeps,
    ctx: &ConnectionContext,
    device_write: &Mutex<DeviceSink>,
    kind: SecurityErrorKind,
    action: Option<&str>,
) -> ProxyError {
    warn!(
        connection_id = %ctx.id(),
        session = %ctx.session(),
        violation = kind.label(),
        close_code = kind.close_code(),
        detail = %kind,
        "Security violation, closing connection"
    );

    deps.metrics.record_violation(&kind);

    if let Some(logger) = &deps.audit {
        let entry = AuditEntry::violation(
            Utc::now().to_rfc3339(),
            ctx.session(),
            ctx.id().to_string(),
            &kind,
            action.map(|s| s.to_string()),
        );
        if let Err(e) = logger.log(&entry) {
            error!(error = %e, "Failed to write audit log entry");
        }
    }

    deps.metrics.log_summary();
    send_close(device_write, &kind).await;

    ProxyError::security(kind)
}

/// Deliver a close frame carrying the violation's code and terse reason.
async fn send_close(device_write: &Mutex<DeviceSink>, kind: &SecurityErrorKind) {
    let frame = CloseFrame {
        code: CloseCode::from(kind.close_code()),
        reason: kind.close_reason().into(),
    };

    let mut sink = device_write.lock().await;
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}
