//! The storage collaborator.
//!
//! The engine never owns persistence; it reads and writes records through
//! the [`Storage`] trait. [`InMemoryStorage`] is a complete implementation
//! backed by maps, with optional JSON file persistence.

mod in_memory;

pub use in_memory::InMemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Result;
use crate::record::{EntityType, Record, ReplicaMetadata};
use crate::sync::peer_types::PeerId;

/// Errors raised by storage implementations.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record with this id.
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: EntityType, id: String },

    /// File I/O failed while loading or saving.
    #[error("Storage file I/O error: {source}")]
    FileIo {
        #[source]
        source: std::io::Error,
    },

    /// Serializing the stored state failed.
    #[error("Failed to serialize storage: {source}")]
    SerializationFailed {
        #[source]
        source: serde_json::Error,
    },

    /// A persisted file could not be parsed.
    #[error("Failed to deserialize storage: {source}")]
    DeserializationFailed {
        #[source]
        source: serde_json::Error,
    },

    /// The backing store rejected the operation.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_io_error(&self) -> bool {
        matches!(self, StorageError::FileIo { .. })
    }

    pub fn is_serialization_error(&self) -> bool {
        matches!(
            self,
            StorageError::SerializationFailed { .. } | StorageError::DeserializationFailed { .. }
        )
    }
}

/// Record persistence consumed by the sync engine.
///
/// Deletions are tombstones: `mark_deleted` keeps the record with
/// `isDeleted = true` so the delete can propagate.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Every record of one kind, tombstones included.
    async fn get_all(&self, entity_type: EntityType) -> Result<Vec<Record>>;

    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>>;

    /// Insert or replace a record by kind and id.
    async fn upsert(&self, record: Record) -> Result<()>;

    /// Tombstone a record as a local mutation by `by`, returning the new
    /// snapshot.
    async fn mark_deleted(
        &self,
        entity_type: EntityType,
        id: &str,
        by: &PeerId,
        at: DateTime<Utc>,
    ) -> Result<Record>;

    async fn get_replica_metadata(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<ReplicaMetadata>>;

    /// Replace only the metadata of an existing record.
    async fn save_replica_metadata(
        &self,
        entity_type: EntityType,
        id: &str,
        metadata: ReplicaMetadata,
    ) -> Result<()>;
}
