//! Client half: dials peers and keeps dialed connections alive.

use futures_util::{SinkExt, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{Instrument, debug, info, info_span, warn};

use super::connection::Dialed;
use super::reconnect::ReconnectPolicy;
use super::shared::{Frame, FrameSink, FrameStream, read_handshake, send_handshake};
use super::websocket::WebSocketTransport;
use super::{SyncTransport, TransportEvent};
use crate::sync::error::SyncError;
use crate::sync::peer_types::{PeerId, PeerInfo};

impl WebSocketTransport {
    /// Connect to `ws://address:port/ws` and exchange handshakes.
    pub(super) async fn dial(&self, address: &str, port: u16) -> Result<PeerInfo, SyncError> {
        let endpoint = format!("{address}:{port}");
        let url = format!("ws://{endpoint}/ws");
        let timeout = self.inner.config.handshake_timeout();

        let (ws, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| SyncError::ConnectionTimeout {
                address: endpoint.clone(),
            })?
            .map_err(|e| SyncError::ConnectionFailed {
                address: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let (sink, stream) = ws.split();
        let sink_endpoint = endpoint.clone();
        let mut sink: FrameSink = Box::pin(
            sink.sink_map_err(move |e| SyncError::ConnectionFailed {
                address: sink_endpoint.clone(),
                reason: e.to_string(),
            })
            .with(|text: String| future::ready(Ok::<_, SyncError>(WsMessage::Text(text.into())))),
        );
        let mut stream: FrameStream = Box::pin(stream.map(Frame::from_tungstenite));

        let local = self.local_info();
        send_handshake(&mut sink, &local, self.inner.clock.now()).await?;
        let mut remote = match read_handshake(&mut stream, &local, &endpoint, timeout).await {
            Ok(remote) => remote,
            Err(e) => {
                let _ = sink.close().await;
                return Err(e);
            }
        };
        // Reach the peer where we dialed it, whatever it advertises.
        remote.address = address.to_string();
        remote.port = port;
        remote.touch_at(self.inner.clock.now());

        let dialed = Dialed {
            address: address.to_string(),
            port,
        };
        Ok(self.register(remote, sink, stream, Some(dialed)).await)
    }

    /// Redial `dialed` with exponential backoff until a connection is up,
    /// the transport shuts down, or the attempts run out.
    ///
    /// `peer` is the peer last reached there, if any. One loop runs per
    /// endpoint.
    pub(super) fn spawn_reconnect(&self, peer: Option<PeerId>, dialed: Dialed) {
        let endpoint = dialed.endpoint();
        if !self.inner.reconnecting.lock().unwrap().insert(endpoint.clone()) {
            debug!(%endpoint, "Reconnect already scheduled");
            return;
        }
        let transport = self.clone();
        let span = info_span!("reconnect", peer = ?peer, %endpoint);

        tokio::spawn(
            async move {
                transport.redial(peer, &dialed).await;
                transport.inner.reconnecting.lock().unwrap().remove(&endpoint);
            }
            .instrument(span),
        );
    }

    async fn redial(&self, peer: Option<PeerId>, dialed: &Dialed) {
        let cancel = self.inner.cancel.clone();
        let mut policy = ReconnectPolicy::new(self.inner.config.reconnect.clone());
        while let Some(delay) = policy.next_delay() {
            info!(
                attempt = policy.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(peer) = &peer
                && self.is_connected(peer)
            {
                info!("Peer came back on its own");
                return;
            }
            match self.dial(&dialed.address, dialed.port).await {
                Ok(info) if peer.as_ref().is_none_or(|p| *p == info.peer_id) => {
                    info!(peer = %info.peer_id, "Reconnected");
                    return;
                }
                Ok(info) => {
                    warn!(found = %info.peer_id, "Address now belongs to another peer");
                    return;
                }
                Err(e) => warn!("Reconnect failed: {e}"),
            }
        }

        warn!(attempts = policy.attempts(), "Giving up on reconnect");
        self.emit(TransportEvent::ReconnectGaveUp {
            peer,
            endpoint: dialed.endpoint(),
            attempts: policy.attempts(),
        })
        .await;
    }
}
