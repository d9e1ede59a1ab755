//! Map-backed [`Storage`] with JSON file persistence.
//!
//! Durability is "last flush wins": nothing reaches disk until
//! [`InMemoryStorage::save_to_file`] is called.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;

use super::{Storage, StorageError};
use crate::Result;
use crate::record::{EntityType, Record, ReplicaMetadata};
use crate::sync::peer_types::PeerId;

/// The current persistence file format version.
const PERSISTENCE_VERSION: u8 = 0;

fn is_v0(v: &u8) -> bool {
    *v == 0
}

fn validate_persistence_version<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let version = u8::deserialize(deserializer)?;
    if version != PERSISTENCE_VERSION {
        return Err(serde::de::Error::custom(format!(
            "unsupported persistence version {version}; only version {PERSISTENCE_VERSION} is supported"
        )));
    }
    Ok(version)
}

#[derive(Serialize, Deserialize)]
struct SerializableStorage {
    #[serde(
        rename = "_v",
        default,
        skip_serializing_if = "is_v0",
        deserialize_with = "validate_persistence_version"
    )]
    version: u8,
    records: Vec<Record>,
}

type Tables = HashMap<EntityType, BTreeMap<String, Record>>;

/// In-memory record store.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-filled with `records`.
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut tables = Tables::new();
        for record in records {
            tables
                .entry(record.entity_type())
                .or_default()
                .insert(record.id().to_string(), record);
        }
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Total number of records, tombstones included.
    pub async fn len(&self) -> usize {
        self.tables.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Save every record to `path` as JSON.
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let records: Vec<Record> = {
            let tables = self.tables.read().await;
            EntityType::SYNC_ORDER
                .iter()
                .filter_map(|kind| tables.get(kind))
                .flat_map(|table| table.values().cloned())
                .collect()
        };
        let serializable = SerializableStorage {
            version: PERSISTENCE_VERSION,
            records,
        };
        let json = serde_json::to_string_pretty(&serializable)
            .map_err(|source| StorageError::SerializationFailed { source })?;
        tokio::fs::write(path, json)
            .await
            .map_err(|source| StorageError::FileIo { source })?;
        Ok(())
    }

    /// Load a store from `path`. A missing file yields an empty store.
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let serializable: SerializableStorage = serde_json::from_str(&json)
                    .map_err(|source| StorageError::DeserializationFailed { source })?;
                Ok(Self::with_records(serializable.records))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(source) => Err(StorageError::FileIo { source }.into()),
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_all(&self, entity_type: EntityType) -> Result<Vec<Record>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&entity_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&entity_type)
            .and_then(|table| table.get(id))
            .cloned())
    }

    async fn upsert(&self, record: Record) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .entry(record.entity_type())
            .or_default()
            .insert(record.id().to_string(), record);
        Ok(())
    }

    async fn mark_deleted(
        &self,
        entity_type: EntityType,
        id: &str,
        by: &PeerId,
        at: DateTime<Utc>,
    ) -> Result<Record> {
        let mut tables = self.tables.write().await;
        let record = tables
            .get_mut(&entity_type)
            .and_then(|table| table.get_mut(id))
            .ok_or_else(|| StorageError::NotFound {
                entity_type,
                id: id.to_string(),
            })?;
        let tombstone = record.with_metadata(record.metadata().tombstoned(by, at));
        *record = tombstone.clone();
        Ok(tombstone)
    }

    async fn get_replica_metadata(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<ReplicaMetadata>> {
        Ok(self
            .get(entity_type, id)
            .await?
            .map(|record| record.metadata().clone()))
    }

    async fn save_replica_metadata(
        &self,
        entity_type: EntityType,
        id: &str,
        metadata: ReplicaMetadata,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .get_mut(&entity_type)
            .and_then(|table| table.get_mut(id))
            .ok_or_else(|| StorageError::NotFound {
                entity_type,
                id: id.to_string(),
            })?;
        *record = record.with_metadata(metadata);
        Ok(())
    }
}
