//! Transport layer: bidirectional JSON messaging with peers.
//!
//! The [`SyncTransport`] trait is the seam the orchestrator talks to.
//! [`WebSocketTransport`] implements it with an axum WebSocket server
//! (plus `/health` and `/info`) and a tokio-tungstenite client. Each
//! connection starts with a handshake exchange, is kept alive by pings and
//! is registered under the peer id announced in the handshake.
//!
//! Everything that happens on a connection is reported as a
//! [`TransportEvent`] on the channel returned by
//! [`WebSocketTransport::new`].

mod client;
mod connection;
pub mod reconnect;
mod server;
mod shared;
mod websocket;

pub use reconnect::{ReconnectPolicy, backoff_delay};
pub use websocket::WebSocketTransport;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::protocol::Envelope;
use crate::sync::error::SyncError;
use crate::sync::peer_types::{PeerId, PeerInfo};

/// Something that happened on the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Handshake completed; the peer can be sent to.
    Connected(PeerInfo),
    /// A registered connection went away.
    Disconnected { peer: PeerId, reason: String },
    /// A data-level message arrived. Pings and pongs are handled by the
    /// transport and never surface here.
    Message { peer: PeerId, envelope: Envelope },
    /// Redialing `endpoint` failed `attempts` times in a row. `peer` is
    /// `None` when no connection to the endpoint was ever established.
    ReconnectGaveUp {
        peer: Option<PeerId>,
        endpoint: String,
        attempts: u32,
    },
}

/// Peer messaging used by the sync engine.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Start accepting connections. Returns the bound address, which may
    /// be on a fallback port.
    async fn start_server(&self) -> Result<SocketAddr, SyncError>;

    fn stop_server(&self) -> Result<(), SyncError>;

    fn is_server_running(&self) -> bool;

    fn get_server_address(&self) -> Result<String, SyncError>;

    /// Our own peer info, as sent in handshakes and served on `/info`.
    fn local_info(&self) -> PeerInfo;

    /// Dial `address:port`, exchange handshakes and register the
    /// connection. Dialed connections reconnect on loss, and a dial that
    /// fails on the network keeps being retried in the background.
    async fn connect(&self, address: &str, port: u16) -> Result<PeerInfo, SyncError>;

    /// Close the connection to `peer` without reconnecting. Returns whether
    /// one existed.
    fn disconnect(&self, peer: &PeerId) -> bool;

    /// Queue `envelope` for `peer`. Delivery is not confirmed.
    fn send(&self, peer: &PeerId, envelope: &Envelope) -> Result<(), SyncError>;

    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Snapshot of registered connections.
    fn connected_peers(&self) -> Vec<PeerInfo>;

    /// Forget connections whose tasks have already ended. Returns how many
    /// were removed.
    fn prune_dead(&self) -> usize;

    /// Stop the server, close every connection and cancel reconnects.
    fn shutdown(&self);
}
