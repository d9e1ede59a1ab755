//! Conflict detection and resolution for replicated records.
//!
//! [`ConflictResolver`] is the two-way rule set that compares two replicas
//! by version, timestamp and origin. [`ThreeWayMerger`] sits in front of it
//! and uses the `base*` fields of [`crate::record::ReplicaMetadata`] to turn
//! most comparisons into fast-forwards, only calling the resolver for
//! genuinely concurrent edits.
//!
//! Both are pure: the current time is an argument (or read from an injected
//! [`crate::Clock`]) and the inputs are never mutated.

mod merge;
mod resolver;

pub use merge::{MergeKind, MergeResult, RecordMerge, ThreeWayMerger};
pub use resolver::{CONCURRENT_WINDOW_MS, ConflictResolver};

use serde::{Deserialize, Serialize};

/// How two replicas relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    /// Ordinary sequential update or an echo; one side simply wins.
    NoConflict,
    /// Both sides edited concurrently.
    UpdateUpdate,
    /// One side deleted, the other edited.
    UpdateDelete,
    /// Both sides deleted.
    DeleteDelete,
}

impl ConflictType {
    pub fn is_conflict(self) -> bool {
        !matches!(self, ConflictType::NoConflict)
    }
}

/// Which input the resolved record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Winner {
    Local,
    Remote,
}

/// Policy for picking a winner between concurrent edits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    /// Later `lastModifiedAt` wins, then higher `version`.
    #[default]
    LastWriteWins,
    /// Higher `version` wins, then later `lastModifiedAt`.
    HighestVersionWins,
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lww" | "last-write-wins" | "lastWriteWins" => Ok(Self::LastWriteWins),
            "highest-version" | "highest-version-wins" | "highestVersionWins" => {
                Ok(Self::HighestVersionWins)
            }
            other => Err(format!("unknown resolution strategy: {other}")),
        }
    }
}

/// Outcome of comparing two replicas of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution<T> {
    pub conflict_type: ConflictType,
    pub resolved: T,
    pub winner: Winner,
    /// The resolved record carries new metadata (bumped version, new
    /// origin) rather than one input's metadata verbatim.
    pub rewritten: bool,
    pub reason: String,
}

impl<T> ConflictResolution<T> {
    /// Whether the local replica must be replaced by `resolved`.
    pub fn changes_local(&self) -> bool {
        self.winner == Winner::Remote || self.rewritten
    }
}
