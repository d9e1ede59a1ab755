//! Shared utilities for the server and client halves of the transport.

use std::pin::Pin;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::oneshot;

use crate::protocol::{Envelope, Message};
use crate::sync::error::SyncError;
use crate::sync::peer_types::PeerInfo;

/// Outgoing half of a WebSocket, reduced to text frames.
pub(crate) type FrameSink = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;
/// Incoming half of a WebSocket, reduced to [`Frame`]s.
pub(crate) type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// An inbound WebSocket frame, independent of the WebSocket library.
#[derive(Debug)]
pub(crate) enum Frame {
    Text(String),
    Close,
    /// Control frames handled by the WebSocket library itself.
    Ignored,
    Error(String),
}

impl Frame {
    pub(crate) fn from_axum(
        frame: Result<axum::extract::ws::Message, axum::Error>,
    ) -> Self {
        use axum::extract::ws::Message as WsMessage;
        match frame {
            Ok(WsMessage::Text(text)) => Frame::Text(text.as_str().to_owned()),
            Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => Frame::Text(text),
                Err(_) => Frame::Ignored,
            },
            Ok(WsMessage::Close(_)) => Frame::Close,
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => Frame::Ignored,
            Err(e) => Frame::Error(e.to_string()),
        }
    }

    pub(crate) fn from_tungstenite(
        frame: Result<tokio_tungstenite::tungstenite::Message, tokio_tungstenite::tungstenite::Error>,
    ) -> Self {
        use tokio_tungstenite::tungstenite::Message as WsMessage;
        match frame {
            Ok(WsMessage::Text(text)) => Frame::Text(text.as_str().to_owned()),
            Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => Frame::Text(text),
                Err(_) => Frame::Ignored,
            },
            Ok(WsMessage::Close(_)) => Frame::Close,
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => Frame::Ignored,
            Err(e) => Frame::Error(e.to_string()),
        }
    }
}

/// Manages the server lifecycle: whether it runs, where, and how to stop
/// it.
#[derive(Debug, Default)]
pub(crate) struct ServerState {
    running: bool,
    shutdown: Option<oneshot::Sender<()>>,
    address: Option<String>,
}

impl ServerState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn get_address(&self) -> Result<String, SyncError> {
        self.address.clone().ok_or(SyncError::ServerNotRunning)
    }

    pub(crate) fn server_started(&mut self, address: String, shutdown_sender: oneshot::Sender<()>) {
        self.running = true;
        self.address = Some(address);
        self.shutdown = Some(shutdown_sender);
    }

    /// Trigger shutdown and clear state.
    pub(crate) fn stop_server(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.running = false;
        self.address = None;
    }
}

/// Send our handshake over a fresh connection.
pub(crate) async fn send_handshake(
    sink: &mut FrameSink,
    local: &PeerInfo,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), SyncError> {
    let envelope = Envelope::new(local.peer_id.clone(), now, Message::Handshake(local.clone()));
    sink.send(envelope.to_json()?).await
}

/// Wait for the peer's handshake. It must be the first data frame.
pub(crate) async fn read_handshake(
    stream: &mut FrameStream,
    local: &PeerInfo,
    address: &str,
    timeout: Duration,
) -> Result<PeerInfo, SyncError> {
    let read = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Frame::Text(text) => {
                    let envelope = Envelope::from_json(&text)?;
                    return match envelope.message {
                        Message::Handshake(info) => Ok(info),
                        other => Err(SyncError::UnexpectedMessage {
                            expected: "handshake",
                            actual: other.message_type().as_str().to_string(),
                        }),
                    };
                }
                Frame::Ignored => continue,
                Frame::Close => {
                    return Err(SyncError::HandshakeFailed(
                        "connection closed during handshake".to_string(),
                    ));
                }
                Frame::Error(e) => return Err(SyncError::HandshakeFailed(e)),
            }
        }
        Err(SyncError::HandshakeFailed(
            "connection ended during handshake".to_string(),
        ))
    };

    let info = tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| SyncError::ConnectionTimeout {
            address: address.to_string(),
        })??;

    if info.peer_id.is_empty() {
        return Err(SyncError::HandshakeFailed("peer sent an empty id".to_string()));
    }
    if info.peer_id == local.peer_id {
        return Err(SyncError::HandshakeFailed("connected to ourselves".to_string()));
    }
    Ok(info)
}

/// Waits for server ready signal and maps errors appropriately.
pub(crate) async fn wait_for_ready(
    ready_rx: oneshot::Receiver<()>,
    address: &str,
) -> Result<(), SyncError> {
    ready_rx.await.map_err(|_| SyncError::ServerBind {
        address: address.to_string(),
        reason: "Server startup failed".to_string(),
    })
}
