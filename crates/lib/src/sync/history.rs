//! Bounded sync history and per-peer metrics.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::peer_types::PeerId;
use super::queue::SyncDirection;

/// Default number of entries kept.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// One finished (or abandoned) push or pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryEntry {
    pub id: String,
    pub peer_id: PeerId,
    pub direction: SyncDirection,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    /// Records sent (push) or received (pull).
    pub records: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncHistoryEntry {
    pub fn success(
        peer_id: PeerId,
        direction: SyncDirection,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        records: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_id,
            direction,
            started_at,
            finished_at,
            success: true,
            records,
            error: None,
        }
    }

    pub fn failure(
        peer_id: PeerId,
        direction: SyncDirection,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(peer_id, direction, started_at, finished_at, 0)
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Running totals for one peer. Unlike the entry ring these are never
/// evicted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSyncStats {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub total_records: u64,
    pub average_duration_ms: f64,
    /// Start of the most recent successful sync in either direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PeerSyncStats {
    fn record(&mut self, entry: &SyncHistoryEntry) {
        self.total_syncs += 1;
        let duration_ms = entry.duration().num_milliseconds().max(0) as f64;
        self.average_duration_ms += (duration_ms - self.average_duration_ms) / self.total_syncs as f64;

        if entry.success {
            self.successful_syncs += 1;
            self.total_records += entry.records as u64;
            if self.last_successful_sync.is_none_or(|last| entry.started_at > last) {
                self.last_successful_sync = Some(entry.started_at);
            }
        } else {
            self.failed_syncs += 1;
            self.last_error = entry.error.clone();
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_syncs == 0 {
            return 0.0;
        }
        self.successful_syncs as f64 / self.total_syncs as f64
    }
}

/// Ring of recent [`SyncHistoryEntry`]s plus per-peer [`PeerSyncStats`].
#[derive(Debug, Clone)]
pub struct SyncHistory {
    capacity: usize,
    entries: VecDeque<SyncHistoryEntry>,
    stats: HashMap<PeerId, PeerSyncStats>,
    last_success: HashMap<(PeerId, SyncDirection), DateTime<Utc>>,
}

impl Default for SyncHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl SyncHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            stats: HashMap::new(),
            last_success: HashMap::new(),
        }
    }

    /// Append `entry`, evicting the oldest one when full.
    pub fn record(&mut self, entry: SyncHistoryEntry) {
        self.stats
            .entry(entry.peer_id.clone())
            .or_default()
            .record(&entry);
        if entry.success {
            let last = self
                .last_success
                .entry((entry.peer_id.clone(), entry.direction))
                .or_insert(entry.started_at);
            *last = (*last).max(entry.started_at);
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<SyncHistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// The `n` newest entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<SyncHistoryEntry> {
        self.entries.iter().rev().take(n).cloned().collect()
    }

    pub fn for_peer(&self, peer: &PeerId) -> Vec<SyncHistoryEntry> {
        self.entries
            .iter()
            .filter(|e| &e.peer_id == peer)
            .cloned()
            .collect()
    }

    pub fn stats(&self, peer: &PeerId) -> Option<PeerSyncStats> {
        self.stats.get(peer).cloned()
    }

    pub fn last_successful_sync(&self, peer: &PeerId) -> Option<DateTime<Utc>> {
        self.stats.get(peer).and_then(|s| s.last_successful_sync)
    }

    /// Start of the last successful sync with `peer` in one direction.
    pub fn last_successful(&self, peer: &PeerId, direction: SyncDirection) -> Option<DateTime<Utc>> {
        self.last_success.get(&(peer.clone(), direction)).copied()
    }

    /// Fraction of retained entries that succeeded; 0 when empty.
    pub fn success_rate(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let ok = self.entries.iter().filter(|e| e.success).count();
        ok as f64 / self.entries.len() as f64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget a peer's totals, e.g. after it was reset.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.stats.remove(peer);
        self.last_success.retain(|(p, _), _| p != peer);
    }
}
