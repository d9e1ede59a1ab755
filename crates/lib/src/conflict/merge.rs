//! Three-way merge using the acknowledged base of each replica.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ConflictResolution, ConflictResolver, ConflictType, Winner};
use crate::record::{Record, RecordKind, ReplicaMetadata, Syncable};

/// How a merge was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Nothing to do: the remote state is already known locally.
    UpToDate,
    /// Adopt the remote state.
    FastForward,
    /// Local moved on; the peer will receive it on the next push.
    KeepLocal,
    /// Both moved on concurrently; the resolver picked a winner.
    Resolved,
    /// At least one side had no base, so the two-way resolver decided.
    TwoWayFallback,
}

/// Result of merging a remote replica into the local one.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult<T> {
    pub kind: MergeKind,
    pub resolution: ConflictResolution<T>,
}

impl<T> MergeResult<T> {
    /// Whether storage must be updated with [`Self::record`].
    pub fn changes_local(&self) -> bool {
        self.resolution.changes_local()
    }

    pub fn record(&self) -> &T {
        &self.resolution.resolved
    }

    pub fn into_record(self) -> T {
        self.resolution.resolved
    }

    pub fn conflict_type(&self) -> ConflictType {
        self.resolution.conflict_type
    }
}

/// Wraps a [`ConflictResolver`] with base-aware fast-forwarding.
#[derive(Debug, Clone)]
pub struct ThreeWayMerger {
    resolver: ConflictResolver,
}

impl ThreeWayMerger {
    pub fn new(resolver: ConflictResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// [`Self::merge_at`] at the resolver clock's current time.
    pub fn merge<T: Syncable>(&self, local: Option<&T>, remote: &T) -> MergeResult<T> {
        self.merge_at(local, remote, self.resolver.clock().now())
    }

    /// Merge `remote` into `local`.
    ///
    /// Whenever the local replica changes, the stored record's base is set
    /// to its new state so the next exchange with the peer can
    /// fast-forward.
    pub fn merge_at<T: Syncable>(
        &self,
        local: Option<&T>,
        remote: &T,
        now: DateTime<Utc>,
    ) -> MergeResult<T> {
        let Some(local) = local else {
            return fast_forward(remote, "new record");
        };
        let lm = local.metadata();
        let rm = remote.metadata();

        if !(lm.has_base() && rm.has_base()) {
            // Without a shared base the two-way rules apply, which can report
            // false conflicts after a peer loses its history.
            debug!(id = local.id(), "merging without base, falling back to two-way resolution");
            return self.two_way(local, remote, now);
        }

        if already_acknowledged(lm, rm) {
            return unchanged(local, MergeKind::UpToDate, "remote state already merged");
        }
        if rm.base_matches(lm) {
            return fast_forward(remote, "remote builds on local state");
        }
        if supersedes(rm, lm) {
            return fast_forward(remote, "remote merged past local state");
        }

        match (lm.changed_since_base(), rm.changed_since_base()) {
            (false, false) if settled_ahead(rm, lm) => {
                fast_forward(remote, "both settled; remote state wins the tie")
            }
            (false, false) => unchanged(local, MergeKind::UpToDate, "neither side changed"),
            (false, true) => fast_forward(remote, "only remote changed"),
            (true, false) => unchanged(local, MergeKind::KeepLocal, "only local changed"),
            (true, true) => {
                if lm.base_matches(rm) || rm.base_matches(lm) {
                    if rm.version > lm.version {
                        fast_forward(remote, "linear history, remote is ahead")
                    } else {
                        unchanged(local, MergeKind::KeepLocal, "linear history, local is ahead")
                    }
                } else {
                    let mut resolution = self.resolver.resolve_concurrent(local, remote, now);
                    resolution.resolved = acknowledge(&resolution.resolved);
                    resolution.rewritten = true;
                    MergeResult {
                        kind: MergeKind::Resolved,
                        resolution,
                    }
                }
            }
        }
    }

    fn two_way<T: Syncable>(&self, local: &T, remote: &T, now: DateTime<Utc>) -> MergeResult<T> {
        let Some(mut resolution) = self.resolver.resolve_at(Some(local), Some(remote), now) else {
            return unchanged(local, MergeKind::UpToDate, "nothing to merge");
        };
        if resolution.changes_local() {
            resolution.resolved = acknowledge(&resolution.resolved);
        }
        MergeResult {
            kind: MergeKind::TwoWayFallback,
            resolution,
        }
    }

    /// [`Self::merge_at`] over untyped records.
    ///
    /// A `local` record of a different kind than `remote` is treated as
    /// absent.
    pub fn merge_record(&self, local: Option<Record>, remote: Record, now: DateTime<Utc>) -> RecordMerge {
        fn typed<T: RecordKind>(
            merger: &ThreeWayMerger,
            local: Option<Record>,
            remote: T,
            now: DateTime<Utc>,
        ) -> RecordMerge {
            let local = local.and_then(T::from_record);
            let result = merger.merge_at(local.as_ref(), &remote, now);
            RecordMerge {
                kind: result.kind,
                conflict_type: result.conflict_type(),
                changes_local: result.changes_local(),
                record: result.into_record().into_record(),
            }
        }

        match remote {
            Record::TaskList(r) => typed(self, local, r, now),
            Record::Task(r) => typed(self, local, r, now),
            Record::TimeLogEntry(r) => typed(self, local, r, now),
            Record::Goal(r) => typed(self, local, r, now),
        }
    }
}

/// Outcome of [`ThreeWayMerger::merge_record`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMerge {
    pub kind: MergeKind,
    pub conflict_type: ConflictType,
    /// Whether `record` must be written to storage.
    pub changes_local: bool,
    pub record: Record,
}

/// The remote state is the local base or older than it.
fn already_acknowledged(local: &ReplicaMetadata, remote: &ReplicaMetadata) -> bool {
    let is_older = local.base_version.is_some_and(|base| remote.version < base);
    local.base_matches(remote) || is_older || local.same_state(remote)
}

/// `remote` acknowledged a newer merge point than `local` and moved past
/// local's version, so it already accounts for the local edits.
fn supersedes(remote: &ReplicaMetadata, local: &ReplicaMetadata) -> bool {
    let (Some(remote_base), Some(local_base)) = (remote.base_version, local.base_version) else {
        return false;
    };
    remote.version > local.version && (remote_base > local_base || remote_base >= local.version)
}

/// Between two settled replicas, the higher version wins, then the later
/// write, then the greater origin. Both peers pick the same one.
fn settled_ahead(remote: &ReplicaMetadata, local: &ReplicaMetadata) -> bool {
    let key = |m: &ReplicaMetadata| (m.version, m.last_modified_at, m.last_modified_by.clone());
    key(remote) > key(local)
}

fn acknowledge<T: Syncable>(record: &T) -> T {
    record.with_metadata(record.metadata().acknowledged())
}

fn fast_forward<T: Syncable>(remote: &T, reason: &str) -> MergeResult<T> {
    MergeResult {
        kind: MergeKind::FastForward,
        resolution: ConflictResolution {
            conflict_type: ConflictType::NoConflict,
            resolved: acknowledge(remote),
            winner: Winner::Remote,
            rewritten: false,
            reason: reason.to_string(),
        },
    }
}

fn unchanged<T: Syncable>(local: &T, kind: MergeKind, reason: &str) -> MergeResult<T> {
    MergeResult {
        kind,
        resolution: ConflictResolution {
            conflict_type: ConflictType::NoConflict,
            resolved: local.clone(),
            winner: Winner::Local,
            rewritten: false,
            reason: reason.to_string(),
        },
    }
}
