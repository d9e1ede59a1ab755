//! Two-way conflict resolution.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{ConflictResolution, ConflictType, ResolutionStrategy, Winner};
use crate::clock::Clock;
use crate::record::{ReplicaMetadata, Syncable};
use crate::sync::peer_types::PeerId;

/// Two equal-version edits this close together are treated as concurrent.
pub const CONCURRENT_WINDOW_MS: i64 = 5_000;

/// Compares a local and a remote replica without any shared history.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    local_peer: PeerId,
    strategy: ResolutionStrategy,
    clock: Arc<dyn Clock>,
}

impl ConflictResolver {
    pub fn new(local_peer: PeerId, strategy: ResolutionStrategy, clock: Arc<dyn Clock>) -> Self {
        Self {
            local_peer,
            strategy,
            clock,
        }
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// [`Self::resolve_at`] at the clock's current time.
    pub fn resolve<T: Syncable>(
        &self,
        local: Option<&T>,
        remote: Option<&T>,
    ) -> Option<ConflictResolution<T>> {
        self.resolve_at(local, remote, self.clock.now())
    }

    /// Decide between `local` and `remote`. `None` only when both are absent.
    pub fn resolve_at<T: Syncable>(
        &self,
        local: Option<&T>,
        remote: Option<&T>,
        now: DateTime<Utc>,
    ) -> Option<ConflictResolution<T>> {
        match (local, remote) {
            (None, None) => None,
            (None, Some(remote)) => Some(ConflictResolution {
                conflict_type: ConflictType::NoConflict,
                resolved: remote.clone(),
                winner: Winner::Remote,
                rewritten: false,
                reason: "no local copy".to_string(),
            }),
            (Some(local), None) => Some(ConflictResolution {
                conflict_type: ConflictType::NoConflict,
                resolved: local.clone(),
                winner: Winner::Local,
                rewritten: false,
                reason: "no remote copy".to_string(),
            }),
            (Some(local), Some(remote)) => Some(self.resolve_pair(local, remote, now)),
        }
    }

    /// Classify how two replicas relate. First matching rule wins.
    pub fn classify(local: &ReplicaMetadata, remote: &ReplicaMetadata) -> ConflictType {
        if local.is_deleted && remote.is_deleted {
            return ConflictType::DeleteDelete;
        }
        if local.is_deleted != remote.is_deleted {
            return ConflictType::UpdateDelete;
        }
        if local.last_modified_by == remote.last_modified_by {
            return ConflictType::NoConflict;
        }

        let skew = (local.last_modified_at - remote.last_modified_at)
            .num_milliseconds()
            .abs();
        if local.version == remote.version {
            return if skew <= CONCURRENT_WINDOW_MS {
                ConflictType::UpdateUpdate
            } else {
                ConflictType::NoConflict
            };
        }

        let (higher, lower) = if local.version > remote.version {
            (local, remote)
        } else {
            (remote, local)
        };
        let gap = higher.version - lower.version;
        if gap == 1 && lower.last_modified_at > higher.last_modified_at {
            ConflictType::UpdateUpdate
        } else {
            ConflictType::NoConflict
        }
    }

    fn resolve_pair<T: Syncable>(&self, local: &T, remote: &T, now: DateTime<Utc>) -> ConflictResolution<T> {
        let lm = local.metadata();
        let rm = remote.metadata();
        match Self::classify(lm, rm) {
            ConflictType::NoConflict => {
                if rm.version > lm.version {
                    keep(remote, Winner::Remote, "remote is a newer sequential version")
                } else {
                    keep(local, Winner::Local, "local is current")
                }
            }
            _ => self.resolve_concurrent(local, remote, now),
        }
    }

    /// Resolve two replicas already known to be concurrent.
    ///
    /// Tombstones still follow the delete rules; anything else is an
    /// `updateUpdate` decided by the strategy.
    pub fn resolve_concurrent<T: Syncable>(
        &self,
        local: &T,
        remote: &T,
        now: DateTime<Utc>,
    ) -> ConflictResolution<T> {
        let lm = local.metadata();
        let rm = remote.metadata();

        if lm.is_deleted && rm.is_deleted {
            let mut resolution = if rm.version > lm.version {
                keep(remote, Winner::Remote, "both deleted; remote tombstone is newer")
            } else {
                keep(local, Winner::Local, "both deleted")
            };
            resolution.conflict_type = ConflictType::DeleteDelete;
            return resolution;
        }

        if lm.is_deleted != rm.is_deleted {
            let (tombstone, live, winner) = if lm.is_deleted {
                (local, remote, Winner::Local)
            } else {
                (remote, local, Winner::Remote)
            };
            if tombstone.metadata().version > live.metadata().version {
                let mut resolution = keep(tombstone, winner, "delete wins over edit");
                resolution.conflict_type = ConflictType::UpdateDelete;
                return resolution;
            }
            return self.stamp(
                tombstone,
                lm.version.max(rm.version),
                now,
                ConflictType::UpdateDelete,
                winner,
                "delete wins over edit",
            );
        }

        let winner = match self.compare(lm, rm) {
            Ordering::Less => Winner::Remote,
            _ => Winner::Local,
        };
        let (source, reason) = match (winner, self.strategy) {
            (Winner::Local, ResolutionStrategy::LastWriteWins) => (local, "local write is later"),
            (Winner::Remote, ResolutionStrategy::LastWriteWins) => (remote, "remote write is later"),
            (Winner::Local, ResolutionStrategy::HighestVersionWins) => {
                (local, "local version is higher")
            }
            (Winner::Remote, ResolutionStrategy::HighestVersionWins) => {
                (remote, "remote version is higher")
            }
        };
        self.stamp(
            source,
            lm.version.max(rm.version),
            now,
            ConflictType::UpdateUpdate,
            winner,
            reason,
        )
    }

    /// Order two replicas under the configured strategy. The final
    /// tie-break on origin makes every peer pick the same winner.
    fn compare(&self, local: &ReplicaMetadata, remote: &ReplicaMetadata) -> Ordering {
        let primary = match self.strategy {
            ResolutionStrategy::LastWriteWins => local
                .last_modified_at
                .cmp(&remote.last_modified_at)
                .then(local.version.cmp(&remote.version)),
            ResolutionStrategy::HighestVersionWins => local
                .version
                .cmp(&remote.version)
                .then(local.last_modified_at.cmp(&remote.last_modified_at)),
        };
        primary.then_with(|| local.last_modified_by.cmp(&remote.last_modified_by))
    }

    fn stamp<T: Syncable>(
        &self,
        source: &T,
        max_version: u64,
        now: DateTime<Utc>,
        conflict_type: ConflictType,
        winner: Winner,
        reason: &str,
    ) -> ConflictResolution<T> {
        let metadata = ReplicaMetadata {
            last_modified_at: now,
            last_modified_by: self.local_peer.clone(),
            version: max_version + 1,
            ..source.metadata().clone()
        };
        ConflictResolution {
            conflict_type,
            resolved: source.with_metadata(metadata),
            winner,
            rewritten: true,
            reason: reason.to_string(),
        }
    }
}

fn keep<T: Syncable>(record: &T, winner: Winner, reason: &str) -> ConflictResolution<T> {
    ConflictResolution {
        conflict_type: ConflictType::NoConflict,
        resolved: record.clone(),
        winner,
        rewritten: false,
        reason: reason.to_string(),
    }
}
