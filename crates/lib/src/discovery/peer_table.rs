//! The table of peers heard on the broadcast domain.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::sync::peer_types::{PeerId, PeerInfo};

/// One entry per peer id. Owned and mutated by the discovery task only;
/// everyone else reads [`PeerTable::snapshot`]s.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerInfo>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh `info`. Returns `true` if the peer is new or its
    /// name, address or port changed.
    pub fn observe(&mut self, info: PeerInfo) -> bool {
        match self.peers.get_mut(&info.peer_id) {
            Some(existing) => {
                let changed = existing.display_name != info.display_name
                    || existing.address != info.address
                    || existing.port != info.port;
                *existing = PeerInfo {
                    connected: existing.connected,
                    ..info
                };
                changed
            }
            None => {
                self.peers.insert(info.peer_id.clone(), info);
                true
            }
        }
    }

    /// Drop entries not refreshed for more than `ttl`. Returns the evicted
    /// ids.
    pub fn evict_stale(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<PeerId> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| now - p.last_seen > ttl)
            .map(|p| p.peer_id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Copy of the table, ordered by peer id.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}
