//! WebSocket transport implementation for peer messaging.
//!
//! The server half lives in `server.rs`, the dialing half in `client.rs`
//! and the per-connection tasks in `connection.rs`. This file holds the
//! shared state and the [`SyncTransport`] implementation.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::{ConnectionHandle, Dialed};
use super::shared::ServerState;
use super::{SyncTransport, TransportEvent};
use crate::clock::Clock;
use crate::config::TransportConfig;
use crate::protocol::Envelope;
use crate::sync::error::SyncError;
use crate::sync::peer_types::{PeerId, PeerInfo};

/// Capacity of the transport event channel.
const EVENT_BUFFER: usize = 1024;

/// WebSocket transport. Cheap to clone; clones share connections and the
/// server.
#[derive(Clone)]
pub struct WebSocketTransport {
    pub(super) inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) local: RwLock<PeerInfo>,
    pub(super) config: TransportConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) connections: RwLock<HashMap<PeerId, ConnectionHandle>>,
    pub(super) events: mpsc::Sender<TransportEvent>,
    pub(super) server: Mutex<ServerState>,
    pub(super) cancel: CancellationToken,
    /// Endpoints with a reconnect loop running.
    pub(super) reconnecting: Mutex<HashSet<String>>,
    next_connection_id: AtomicU64,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("local", &self.local_info().peer_id)
            .field("connections", &self.connected_peers().len())
            .finish()
    }
}

impl WebSocketTransport {
    /// Create a transport announcing itself as `local`.
    ///
    /// Returns the transport and the receiver for its events. `cancel`
    /// stops the server, every connection and every reconnect loop.
    pub fn new(
        local: PeerInfo,
        config: TransportConfig,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let transport = Self {
            inner: Arc::new(Inner {
                local: RwLock::new(local),
                config,
                clock,
                connections: RwLock::new(HashMap::new()),
                events,
                server: Mutex::new(ServerState::new()),
                cancel,
                reconnecting: Mutex::new(HashSet::new()),
                next_connection_id: AtomicU64::new(1),
            }),
        };
        (transport, events_rx)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub(super) fn next_connection_id(&self) -> u64 {
        self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) async fn emit(&self, event: TransportEvent) {
        if self.inner.events.send(event).await.is_err() {
            debug!("Transport event dropped: receiver gone");
        }
    }
}

#[async_trait]
impl SyncTransport for WebSocketTransport {
    async fn start_server(&self) -> Result<SocketAddr, SyncError> {
        self.serve().await
    }

    fn stop_server(&self) -> Result<(), SyncError> {
        let mut server = self.inner.server.lock().unwrap();
        if !server.is_running() {
            return Err(SyncError::ServerNotRunning);
        }
        server.stop_server();
        info!("Sync server stopped");
        Ok(())
    }

    fn is_server_running(&self) -> bool {
        self.inner.server.lock().unwrap().is_running()
    }

    fn get_server_address(&self) -> Result<String, SyncError> {
        self.inner.server.lock().unwrap().get_address()
    }

    fn local_info(&self) -> PeerInfo {
        self.inner.local.read().unwrap().clone()
    }

    async fn connect(&self, address: &str, port: u16) -> Result<PeerInfo, SyncError> {
        let result = self.dial(address, port).await;
        if let Err(e) = &result
            && e.is_network_error()
            && !self.inner.cancel.is_cancelled()
        {
            let dialed = Dialed {
                address: address.to_string(),
                port,
            };
            self.spawn_reconnect(None, dialed);
        }
        result
    }

    fn disconnect(&self, peer: &PeerId) -> bool {
        let removed = self.inner.connections.write().unwrap().remove(peer);
        match removed {
            Some(handle) => {
                handle.close();
                info!(%peer, "Disconnected");
                true
            }
            None => false,
        }
    }

    fn send(&self, peer: &PeerId, envelope: &Envelope) -> Result<(), SyncError> {
        let text = envelope.to_json()?;
        let connections = self.inner.connections.read().unwrap();
        let handle = connections
            .get(peer)
            .ok_or_else(|| SyncError::DeviceNotFound(peer.clone()))?;
        handle.try_send(text)
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner
            .connections
            .read()
            .unwrap()
            .get(peer)
            .is_some_and(ConnectionHandle::is_open)
    }

    fn connected_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .inner
            .connections
            .read()
            .unwrap()
            .values()
            .filter(|h| h.is_open())
            .map(|h| h.info.with_connected(true))
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    fn prune_dead(&self) -> usize {
        let mut connections = self.inner.connections.write().unwrap();
        let before = connections.len();
        connections.retain(|_, handle| handle.is_open());
        before - connections.len()
    }

    fn shutdown(&self) {
        let _ = self.stop_server();
        let handles: Vec<ConnectionHandle> = self
            .inner
            .connections
            .write()
            .unwrap()
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in &handles {
            handle.close();
        }
        self.inner.cancel.cancel();
        info!(closed = handles.len(), "Transport shut down");
    }
}
