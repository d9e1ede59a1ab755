//! Server half: accepts WebSocket upgrades on `/ws` and serves `/health`
//! and `/info`.

use std::io::ErrorKind as IoErrorKind;
use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt, future};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::SyncTransport;
use super::shared::{Frame, FrameSink, FrameStream, read_handshake, send_handshake, wait_for_ready};
use super::websocket::WebSocketTransport;
use crate::protocol::{Envelope, ErrorMessage, Message};
use crate::sync::error::SyncError;
use crate::sync::peer_types::PeerInfo;

impl WebSocketTransport {
    /// Bind (with port fallback) and spawn the axum server.
    pub(super) async fn serve(&self) -> Result<SocketAddr, SyncError> {
        if let Ok(address) = self.get_server_address() {
            return Err(SyncError::ServerAlreadyRunning { address });
        }

        let config = &self.inner.config;
        let listener = bind_with_fallback(
            &config.bind_address,
            config.port,
            config.port_fallback_attempts,
        )
        .await?;
        let addr = listener.local_addr()?;
        self.inner.local.write().unwrap().port = addr.port();

        let router = self.create_router();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let cancel = self.inner.cancel.clone();

        tokio::spawn(
            async move {
                let _ = ready_tx.send(());
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        tokio::select! {
                            _ = shutdown_rx => {}
                            _ = cancel.cancelled() => {}
                        }
                    })
                    .await;
                if let Err(e) = result {
                    error!("Sync server failed: {e}");
                }
            }
            .instrument(info_span!("sync_server", %addr)),
        );

        wait_for_ready(ready_rx, &addr.to_string()).await?;
        self.inner
            .server
            .lock()
            .unwrap()
            .server_started(addr.to_string(), shutdown_tx);
        info!(%addr, "Sync server listening");
        Ok(addr)
    }

    fn create_router(&self) -> Router {
        Router::new()
            .route("/ws", get(handle_upgrade))
            .route("/health", get(handle_health))
            .route("/info", get(handle_info))
            .with_state(self.clone())
    }

    /// Run the server side of the handshake on an upgraded socket.
    async fn accept(&self, socket: WebSocket) {
        let (sink, stream) = socket.split();
        let mut sink: FrameSink = Box::pin(
            sink.sink_map_err(|e| SyncError::ConnectionFailed {
                address: "inbound".to_string(),
                reason: e.to_string(),
            })
            .with(|text: String| future::ready(Ok::<_, SyncError>(WsMessage::Text(text.into())))),
        );
        let mut stream: FrameStream = Box::pin(stream.map(Frame::from_axum));

        let local = self.local_info();
        let timeout = self.inner.config.handshake_timeout();
        let remote = match read_handshake(&mut stream, &local, "inbound", timeout).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Rejected inbound connection: {e}");
                let reply = Envelope::new(
                    local.peer_id.clone(),
                    self.inner.clock.now(),
                    Message::Error(ErrorMessage::from(&e)),
                );
                if let Ok(text) = reply.to_json() {
                    let _ = sink.send(text).await;
                }
                let _ = sink.close().await;
                return;
            }
        };

        if let Err(e) = send_handshake(&mut sink, &local, self.inner.clock.now()).await {
            warn!(peer = %remote.peer_id, "Handshake reply failed: {e}");
            return;
        }
        self.register(remote, sink, stream, None).await;
    }
}

async fn handle_upgrade(
    State(transport): State<WebSocketTransport>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { transport.accept(socket).await })
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_info(State(transport): State<WebSocketTransport>) -> Json<PeerInfo> {
    Json(transport.local_info())
}

/// Bind `host:port`, moving up one port at a time while the port is taken.
/// Port 0 binds an ephemeral port and never falls back.
async fn bind_with_fallback(
    host: &str,
    port: u16,
    fallback_attempts: u16,
) -> Result<TcpListener, SyncError> {
    let extra = if port == 0 { 0 } else { fallback_attempts };
    for offset in 0..=extra {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        let address = format!("{host}:{candidate}");
        match TcpListener::bind(&address).await {
            Ok(listener) => {
                if offset > 0 {
                    info!(requested = port, bound = candidate, "Preferred port busy, using fallback");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == IoErrorKind::AddrInUse => {
                debug!(%address, "Port in use");
            }
            Err(e) if e.kind() == IoErrorKind::PermissionDenied => {
                return Err(SyncError::PermissionDenied(format!("bind {address}: {e}")));
            }
            Err(e) => {
                return Err(SyncError::ServerBind {
                    address,
                    reason: e.to_string(),
                });
            }
        }
    }
    Err(SyncError::PortInUse {
        port,
        attempts: extra + 1,
    })
}
