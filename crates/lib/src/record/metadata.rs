//! Replica bookkeeping attached to every syncable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::peer_types::PeerId;

/// Version, timestamp and origin of one replica of a record.
///
/// `version` increases on every local mutation. The `base_*` fields hold the
/// last state both sides acknowledged (the common ancestor used by the
/// three-way merge); they are `None` until the first merge point is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaMetadata {
    pub last_modified_at: DateTime<Utc>,
    pub last_modified_by: PeerId,
    pub version: u64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_modified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_modified_by: Option<PeerId>,
}

impl ReplicaMetadata {
    /// Metadata for a record freshly created by `peer`.
    pub fn new(peer: impl Into<PeerId>, now: DateTime<Utc>) -> Self {
        Self {
            last_modified_at: now,
            last_modified_by: peer.into(),
            version: 1,
            is_deleted: false,
            base_modified_at: None,
            base_version: None,
            base_modified_by: None,
        }
    }

    /// Metadata after a local mutation by `peer`.
    pub fn touched(&self, peer: &PeerId, now: DateTime<Utc>) -> Self {
        Self {
            last_modified_at: now,
            last_modified_by: peer.clone(),
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// Metadata after a local delete by `peer`.
    pub fn tombstoned(&self, peer: &PeerId, now: DateTime<Utc>) -> Self {
        Self {
            is_deleted: true,
            ..self.touched(peer, now)
        }
    }

    /// Whether both the base version and its origin are known.
    pub fn has_base(&self) -> bool {
        self.base_version.is_some()
            && self.base_modified_at.is_some()
            && self.base_modified_by.is_some()
    }

    /// Whether this replica moved past its base. `false` without a base.
    pub fn changed_since_base(&self) -> bool {
        self.base_version.is_some_and(|base| self.version > base)
    }

    /// Whether this replica's base is exactly `other`'s current state.
    pub fn base_matches(&self, other: &ReplicaMetadata) -> bool {
        self.base_version == Some(other.version)
            && self.base_modified_at == Some(other.last_modified_at)
            && self.base_modified_by.as_ref() == Some(&other.last_modified_by)
    }

    /// Copy with the base set to this replica's own current state.
    pub fn acknowledged(&self) -> Self {
        Self {
            base_modified_at: Some(self.last_modified_at),
            base_version: Some(self.version),
            base_modified_by: Some(self.last_modified_by.clone()),
            ..self.clone()
        }
    }

    /// Whether two replicas describe the same state.
    pub fn same_state(&self, other: &ReplicaMetadata) -> bool {
        self.version == other.version
            && self.last_modified_at == other.last_modified_at
            && self.last_modified_by == other.last_modified_by
            && self.is_deleted == other.is_deleted
    }
}
