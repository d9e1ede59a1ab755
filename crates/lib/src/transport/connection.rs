//! Per-connection tasks: a writer draining the outbound queue and a reader
//! that dispatches frames and runs the heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use super::TransportEvent;
use super::shared::{Frame, FrameSink, FrameStream};
use super::websocket::WebSocketTransport;
use crate::protocol::{Envelope, Message};
use crate::sync::error::SyncError;
use crate::sync::peer_types::{PeerId, PeerInfo};

/// Where a client-side connection was dialed, for reconnecting.
#[derive(Debug, Clone)]
pub(super) struct Dialed {
    pub(super) address: String,
    pub(super) port: u16,
}

impl Dialed {
    pub(super) fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// The registry's view of one live connection.
#[derive(Debug, Clone)]
pub(super) struct ConnectionHandle {
    pub(super) info: PeerInfo,
    pub(super) id: u64,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    closing: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub(super) fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    /// Close deliberately. A deliberately closed connection never
    /// reconnects.
    pub(super) fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub(super) fn try_send(&self, text: String) -> Result<(), SyncError> {
        self.outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SyncError::ResourceExhausted(format!(
                "outbound queue to {} is full",
                self.info.peer_id
            )),
            mpsc::error::TrySendError::Closed(_) => SyncError::ConnectionLost {
                peer: self.info.peer_id.clone(),
            },
        })
    }
}

/// State owned by a connection's reader task.
struct Reader {
    transport: WebSocketTransport,
    peer: PeerId,
    id: u64,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    closing: Arc<AtomicBool>,
    dialed: Option<Dialed>,
}

impl WebSocketTransport {
    /// Register a connection that completed its handshake and spawn its
    /// tasks. An existing connection to the same peer is replaced.
    pub(super) async fn register(
        &self,
        info: PeerInfo,
        sink: FrameSink,
        stream: FrameStream,
        dialed: Option<Dialed>,
    ) -> PeerInfo {
        let peer = info.peer_id.clone();
        let id = self.next_connection_id();
        let (outbound, outbound_rx) = mpsc::channel(self.inner.config.outbound_buffer.max(1));
        let cancel = self.inner.cancel.child_token();
        let closing = Arc::new(AtomicBool::new(false));
        let info = info.with_connected(true);

        let handle = ConnectionHandle {
            info: info.clone(),
            id,
            outbound: outbound.clone(),
            cancel: cancel.clone(),
            closing: closing.clone(),
        };
        let replaced = self
            .inner
            .connections
            .write()
            .unwrap()
            .insert(peer.clone(), handle);
        if let Some(old) = replaced {
            debug!(%peer, old = old.id, new = id, "Replacing existing connection");
            old.close();
        }

        let span = info_span!("connection", %peer, id);
        tokio::spawn(write_loop(sink, outbound_rx, cancel.clone()).instrument(span.clone()));

        info!(%peer, name = %info.display_name, address = %info.endpoint(), "Peer connected");
        self.emit(TransportEvent::Connected(info.clone())).await;

        let reader = Reader {
            transport: self.clone(),
            peer,
            id,
            outbound,
            cancel,
            closing,
            dialed,
        };
        tokio::spawn(reader.run(stream).instrument(span));
        info
    }

    /// Called once by a reader task when its connection ends.
    async fn connection_closed(
        &self,
        peer: PeerId,
        id: u64,
        closing: &AtomicBool,
        dialed: Option<Dialed>,
        reason: String,
    ) {
        let removed = {
            let mut connections = self.inner.connections.write().unwrap();
            match connections.get(&peer) {
                Some(handle) if handle.id == id => connections.remove(&peer).is_some(),
                _ => false,
            }
        };
        // Replaced by a newer connection, or removed by disconnect()
        if !removed {
            return;
        }
        info!(%peer, %reason, "Peer disconnected");
        self.emit(TransportEvent::Disconnected {
            peer: peer.clone(),
            reason,
        })
        .await;

        if let Some(dialed) = dialed
            && !closing.load(Ordering::SeqCst)
            && !self.inner.cancel.is_cancelled()
        {
            self.spawn_reconnect(Some(peer), dialed);
        }
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send(text).await {
                        debug!("Write failed: {e}");
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

impl Reader {
    async fn run(self, mut stream: FrameStream) {
        let config = &self.transport.inner.config;
        let dead_after = config.dead_after();
        let mut heartbeat = interval(config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        heartbeat.tick().await;
        let mut last_inbound = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break "closed locally".to_string(),

                frame = stream.next() => match frame {
                    None | Some(Frame::Close) => break "closed by peer".to_string(),
                    Some(Frame::Error(e)) => break format!("read error: {e}"),
                    Some(Frame::Ignored) => last_inbound = Instant::now(),
                    Some(Frame::Text(text)) => {
                        last_inbound = Instant::now();
                        self.handle_text(&text).await;
                    }
                },

                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() >= dead_after {
                        warn!(silent_ms = last_inbound.elapsed().as_millis() as u64, "Heartbeat missed, closing");
                        break "heartbeat timeout".to_string();
                    }
                    self.send_control(Message::Ping, None);
                }
            }
        };

        self.cancel.cancel();
        self.transport
            .connection_closed(self.peer, self.id, &self.closing, self.dialed, reason)
            .await;
    }

    async fn handle_text(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping frame: {e}");
                return;
            }
        };

        match envelope.message {
            Message::Ping => {
                trace!("ping");
                self.send_control(Message::Pong, Some(envelope.message_id));
            }
            Message::Pong => trace!("pong"),
            Message::Handshake(_) => debug!("Ignoring repeated handshake"),
            _ => {
                self.transport
                    .emit(TransportEvent::Message {
                        peer: self.peer.clone(),
                        envelope,
                    })
                    .await;
            }
        }
    }

    fn send_control(&self, message: Message, reply_to: Option<String>) {
        let local = self.transport.inner.local.read().unwrap().peer_id.clone();
        let mut envelope = Envelope::new(local, self.transport.inner.clock.now(), message);
        envelope.reply_to = reply_to;
        match envelope.to_json() {
            Ok(text) => {
                if let Err(e) = self.outbound.try_send(text) {
                    debug!("Control frame not queued: {e}");
                }
            }
            Err(e) => warn!("Failed to encode control frame: {e}"),
        }
    }
}
