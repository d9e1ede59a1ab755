//! Event streams exposed to the UI and notification collaborators.
//!
//! State-like streams (peer lists, running timers) are `watch` channels so
//! a late subscriber sees the current value. Occurrences (data applied,
//! progress, errors) are `broadcast` channels; a slow subscriber loses the
//! oldest events rather than stalling the engine.

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::error::{ErrorKind, SyncError};
use super::peer_types::{PeerId, PeerInfo};
use super::timers::LiveTimerState;
use crate::record::EntityType;

const BROADCAST_CAPACITY: usize = 256;

/// Stage of a push or pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Timers,
    Pushing,
    Pulling,
    Complete,
    Failed,
}

/// Progress of one sync with one peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub peer: PeerId,
    pub phase: SyncPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<EntityType>,
    /// Fraction done, 0.0 to 1.0.
    pub progress: f32,
}

/// Records from a peer were written to storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUpdated {
    pub peer: PeerId,
    pub data_type: EntityType,
    /// Ids of the records whose local copy changed.
    pub ids: Vec<String>,
    /// How many of those needed conflict resolution.
    pub conflicts: usize,
}

/// An error worth showing to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerId>,
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

impl SyncErrorEvent {
    pub fn new(peer: Option<PeerId>, err: &SyncError) -> Self {
        Self {
            peer,
            kind: err.kind(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}

/// All engine event channels.
#[derive(Debug)]
pub struct SyncEvents {
    discovered: watch::Sender<Vec<PeerInfo>>,
    connected: watch::Sender<Vec<PeerInfo>>,
    active_timers: watch::Sender<Vec<LiveTimerState>>,
    data_updated: broadcast::Sender<DataUpdated>,
    progress: broadcast::Sender<SyncProgress>,
    errors: broadcast::Sender<SyncErrorEvent>,
}

impl Default for SyncEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEvents {
    pub fn new() -> Self {
        Self {
            discovered: watch::channel(Vec::new()).0,
            connected: watch::channel(Vec::new()).0,
            active_timers: watch::channel(Vec::new()).0,
            data_updated: broadcast::channel(BROADCAST_CAPACITY).0,
            progress: broadcast::channel(BROADCAST_CAPACITY).0,
            errors: broadcast::channel(BROADCAST_CAPACITY).0,
        }
    }

    pub fn discovered_peers(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.discovered.subscribe()
    }

    pub fn connected_peers(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.connected.subscribe()
    }

    pub fn active_timers(&self) -> watch::Receiver<Vec<LiveTimerState>> {
        self.active_timers.subscribe()
    }

    pub fn data_updated(&self) -> broadcast::Receiver<DataUpdated> {
        self.data_updated.subscribe()
    }

    pub fn sync_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn errors(&self) -> broadcast::Receiver<SyncErrorEvent> {
        self.errors.subscribe()
    }

    pub(crate) fn publish_discovered(&self, peers: Vec<PeerInfo>) {
        self.discovered.send_replace(peers);
    }

    pub(crate) fn publish_connected(&self, peers: Vec<PeerInfo>) {
        self.connected.send_replace(peers);
    }

    pub(crate) fn publish_timers(&self, timers: Vec<LiveTimerState>) {
        self.active_timers.send_replace(timers);
    }

    pub(crate) fn data_applied(&self, event: DataUpdated) {
        // No subscribers is fine
        let _ = self.data_updated.send(event);
    }

    pub(crate) fn progress(
        &self,
        peer: &PeerId,
        phase: SyncPhase,
        data_type: Option<EntityType>,
        progress: f32,
    ) {
        let _ = self.progress.send(SyncProgress {
            peer: peer.clone(),
            phase,
            data_type,
            progress: progress.clamp(0.0, 1.0),
        });
    }

    /// Log `err` and, if it should reach the user, emit it.
    pub(crate) fn report(&self, peer: Option<&PeerId>, err: &SyncError) {
        if err.should_surface() {
            warn!(peer = ?peer.map(PeerId::as_str), kind = ?err.kind(), "{err}");
            let _ = self.errors.send(SyncErrorEvent::new(peer.cloned(), err));
        } else {
            debug!(peer = ?peer.map(PeerId::as_str), kind = ?err.kind(), "{err}");
        }
    }

    /// Emit an event regardless of the error's own surfacing rule.
    pub(crate) fn surface(&self, event: SyncErrorEvent) {
        warn!(peer = ?event.peer.as_ref().map(PeerId::as_str), kind = ?event.kind, "{}", event.message);
        let _ = self.errors.send(event);
    }
}
