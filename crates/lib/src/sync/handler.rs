//! Inbound dispatch: transport events and discovery snapshots.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::SyncEngine;
use super::error::SyncError;
use super::peer_types::{PeerId, PeerInfo};
use super::queue::SyncDirection;
use super::session::SessionWindow;
use crate::protocol::{EncodedPayload, Envelope, ErrorMessage, Message};
use crate::transport::TransportEvent;

/// Consume transport events and discovery updates until cancelled.
pub(super) async fn run(
    engine: SyncEngine,
    mut events: mpsc::Receiver<TransportEvent>,
    mut discovered: Option<watch::Receiver<Vec<PeerInfo>>>,
    cancel: CancellationToken,
) {
    debug!("Inbound handler started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv() => match event {
                Some(event) => engine.handle_event(event).await,
                None => break,
            },

            peers = discovery_changed(&mut discovered) => match peers {
                Some(peers) => engine.on_discovered(peers),
                // Discovery stopped; keep serving the transport
                None => discovered = None,
            },
        }
    }
    debug!("Inbound handler stopped");
}

/// Next discovery snapshot, `None` once discovery is gone. Never resolves
/// without discovery.
async fn discovery_changed(rx: &mut Option<watch::Receiver<Vec<PeerInfo>>>) -> Option<Vec<PeerInfo>> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

impl SyncEngine {
    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(info) => self.on_connected(info),
            TransportEvent::Disconnected { peer, reason } => {
                info!(%peer, reason, "Peer disconnected");
                self.forget_connection(&peer);
                self.publish_connected();
                self.publish_timers();
            }
            TransportEvent::ReconnectGaveUp {
                peer: Some(peer),
                endpoint,
                attempts,
            } => {
                let dropped = self.inner.queue.remove_peer(&peer);
                warn!(%peer, %endpoint, attempts, dropped, "Giving up on peer");
                self.inner.events.report(Some(&peer), &SyncError::DeviceOffline(peer.clone()));
            }
            TransportEvent::ReconnectGaveUp {
                peer: None,
                endpoint,
                attempts,
            } => {
                warn!(%endpoint, attempts, "Giving up on endpoint");
                self.inner.events.report(
                    None,
                    &SyncError::ConnectionFailed {
                        address: endpoint,
                        reason: format!("no answer after {attempts} attempts"),
                    },
                );
            }
            TransportEvent::Message { peer, envelope } => self.on_message(peer, envelope).await,
        }
    }

    fn on_connected(&self, info: PeerInfo) {
        let peer = info.peer_id.clone();
        info!(%peer, name = %info.display_name, address = %info.endpoint(), "Peer connected");
        self.inner.dialing.lock().unwrap().remove(&peer);
        self.inner
            .connected
            .lock()
            .unwrap()
            .insert(peer.clone(), info.with_connected(true));
        self.publish_connected();

        // Let the new peer arbitrate against our running timers
        let timers = self.inner.timers.lock().unwrap().local_timers();
        if let Ok(transport) = self.transport() {
            let now = self.inner.clock.now();
            for timer in timers {
                let envelope = Envelope::new(self.local_peer(), now, Message::TimerStart(timer.at(now)));
                if let Err(e) = transport.send(&peer, &envelope) {
                    self.inner.events.report(Some(&peer), &e);
                }
            }
        }

        if self.inner.config.sync.sync_on_connect {
            self.enqueue(&peer, SyncDirection::Push);
        }
    }

    async fn on_message(&self, peer: PeerId, envelope: Envelope) {
        let message_id = envelope.message_id;
        let session_id = envelope.session_id;
        let reply_to = envelope.reply_to;
        match envelope.message {
            Message::DataUpdate(body) => {
                if let Err(e) = self.on_data_update(&peer, session_id.as_deref(), body).await {
                    self.inner.events.report(Some(&peer), &e);
                    // A corrupt payload is dropped without a reply
                    if !matches!(e, SyncError::DataCorrupted(_)) {
                        self.reply_error(&peer, &message_id, &e);
                    }
                }
            }
            Message::DataRequest(request) => {
                if let Err(e) = self.answer_request(&peer, &message_id, request).await {
                    self.inner.events.report(Some(&peer), &e);
                    self.reply_error(&peer, &message_id, &e);
                }
            }
            Message::DataResponse(body) => {
                let pending = reply_to
                    .as_deref()
                    .and_then(|id| self.inner.pending.lock().unwrap().remove(id));
                match pending {
                    Some(pull) => {
                        let _ = pull.respond.send(Ok(body));
                    }
                    None => debug!(%peer, ?reply_to, "Response for no pending request"),
                }
            }
            Message::Error(ErrorMessage { kind, message }) => {
                let err = SyncError::Remote {
                    peer: peer.clone(),
                    kind,
                    message,
                };
                let pending = reply_to
                    .as_deref()
                    .and_then(|id| self.inner.pending.lock().unwrap().remove(id));
                match pending {
                    Some(pull) => {
                        let _ = pull.respond.send(Err(err));
                    }
                    None => self.inner.events.report(Some(&peer), &err),
                }
            }
            Message::TimerStart(timer) | Message::TimerUpdate(timer) => {
                trace!(%peer, entity_id = %timer.entity_id, "Remote timer");
                let conflict = self.inner.timers.lock().unwrap().observe_remote(timer);
                if let Some(conflict) = conflict
                    && let Err(e) = self.apply_timer_conflict(conflict).await
                {
                    self.inner.events.report(Some(&peer), &e);
                }
                self.publish_timers();
            }
            Message::TimerStop(timer) => {
                self.inner.timers.lock().unwrap().remove_remote(&peer, &timer.entity_id);
                self.publish_timers();
            }
            Message::TimerForceStop(stop) => {
                if let Err(e) = self.force_stop_timer(&peer, stop).await {
                    self.inner.events.report(Some(&peer), &e);
                }
            }
            Message::Handshake(_) | Message::Ping | Message::Pong => {
                trace!(%peer, "Ignoring transport-level message");
            }
        }
    }

    /// Apply a pushed batch once per push session and data type.
    async fn on_data_update(
        &self,
        peer: &PeerId,
        session_id: Option<&str>,
        body: EncodedPayload,
    ) -> Result<(), SyncError> {
        let value = self.inner.codec.unwrap(body)?;
        if let Some(session_id) = session_id {
            let data_type = value.get("dataType").and_then(|v| v.as_str()).unwrap_or_default();
            let key = SessionWindow::key(session_id, data_type);
            if !self.inner.sessions.lock().unwrap().insert(key) {
                debug!(%peer, session_id, data_type, "Skipping already applied session");
                return Ok(());
            }
        }
        self.apply_value(peer, value).await?;
        Ok(())
    }

    fn reply_error(&self, peer: &PeerId, reply_to: &str, err: &SyncError) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let envelope = Envelope::new(
            self.local_peer(),
            self.inner.clock.now(),
            Message::Error(ErrorMessage::from(err)),
        )
        .in_reply_to(reply_to);
        if let Err(e) = transport.send(peer, &envelope) {
            debug!(%peer, "Could not send error reply: {e}");
        }
    }

    /// Publish a discovery snapshot and dial new peers when auto-connect is
    /// on.
    ///
    /// Only the side with the smaller peer id dials, so two auto-connecting
    /// peers open one connection between them.
    fn on_discovered(&self, peers: Vec<PeerInfo>) {
        self.inner.events.publish_discovered(peers.clone());
        if !self.inner.config.sync.auto_connect {
            return;
        }
        let local = self.local_peer();
        for peer in peers {
            if peer.peer_id <= local || self.is_connected(&peer.peer_id) {
                continue;
            }
            if !self.inner.dialing.lock().unwrap().insert(peer.peer_id.clone()) {
                continue;
            }
            let engine = self.clone();
            tokio::spawn(async move {
                debug!(peer = %peer.peer_id, address = %peer.endpoint(), "Auto-connecting");
                if let Err(e) = engine.connect(&peer.address, peer.port).await {
                    engine.inner.events.report(Some(&peer.peer_id), &e);
                }
                engine.inner.dialing.lock().unwrap().remove(&peer.peer_id);
            });
        }
    }
}
