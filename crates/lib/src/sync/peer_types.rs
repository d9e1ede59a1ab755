//! Peer identity types shared by discovery, transport and the orchestrator.

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A peer's unique identifier.
///
/// A v4 UUID generated once per device and persisted by the host
/// application; it never changes across restarts or address changes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new PeerId from a string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Generate a fresh random PeerId.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the underlying string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&String> for PeerId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

/// Information about a remote peer in the sync network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// The peer's unique identifier
    pub peer_id: PeerId,
    /// Human-readable device name
    pub display_name: String,
    /// LAN address the peer's sync server listens on
    pub address: String,
    /// Port of the peer's sync server
    pub port: u16,
    /// When the peer was last heard from
    pub last_seen: DateTime<Utc>,
    /// Whether a transport connection is currently established
    #[serde(default)]
    pub connected: bool,
}

impl PeerInfo {
    /// Create a new, disconnected PeerInfo seen at `now`.
    pub fn new(
        peer_id: impl Into<PeerId>,
        display_name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            address: address.into(),
            port,
            last_seen: now,
            connected: false,
        }
    }

    /// Update the last_seen timestamp.
    pub fn touch_at(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
    }

    /// `address:port`, suitable for dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// WebSocket URL of the peer's sync endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.endpoint())
    }

    /// Copy of this info marked as connected or not.
    pub fn with_connected(&self, connected: bool) -> Self {
        Self {
            connected,
            ..self.clone()
        }
    }
}
