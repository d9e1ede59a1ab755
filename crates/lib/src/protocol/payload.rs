//! Data-bearing message bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::compression;
use crate::record::{EntityType, Goal, Record, RecordKind, Task, TaskList, TimeLogEntry};
use crate::sync::error::SyncError;

/// A batch of records of one kind, tagged by `dataType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dataType", content = "records", rename_all = "camelCase")]
pub enum DataPayload {
    TaskList(Vec<TaskList>),
    Task(Vec<Task>),
    TimeLogEntry(Vec<TimeLogEntry>),
    Goal(Vec<Goal>),
}

impl DataPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            DataPayload::TaskList(_) => EntityType::TaskList,
            DataPayload::Task(_) => EntityType::Task,
            DataPayload::TimeLogEntry(_) => EntityType::TimeLogEntry,
            DataPayload::Goal(_) => EntityType::Goal,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataPayload::TaskList(r) => r.len(),
            DataPayload::Task(r) => r.len(),
            DataPayload::TimeLogEntry(r) => r.len(),
            DataPayload::Goal(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a payload of `entity_type` from records, skipping records of
    /// any other kind.
    pub fn from_records(entity_type: EntityType, records: Vec<Record>) -> Self {
        fn collect<T: RecordKind>(records: Vec<Record>) -> Vec<T> {
            records.into_iter().filter_map(T::from_record).collect()
        }

        match entity_type {
            EntityType::TaskList => DataPayload::TaskList(collect(records)),
            EntityType::Task => DataPayload::Task(collect(records)),
            EntityType::TimeLogEntry => DataPayload::TimeLogEntry(collect(records)),
            EntityType::Goal => DataPayload::Goal(collect(records)),
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        fn convert<T: RecordKind>(records: Vec<T>) -> Vec<Record> {
            records.into_iter().map(RecordKind::into_record).collect()
        }

        match self {
            DataPayload::TaskList(r) => convert(r),
            DataPayload::Task(r) => convert(r),
            DataPayload::TimeLogEntry(r) => convert(r),
            DataPayload::Goal(r) => convert(r),
        }
    }
}

/// Body of a `dataRequest`: ask the peer for one kind of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub data_type: EntityType,
    /// Only records modified strictly after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

/// The still-encoded body of a `dataUpdate` or `dataResponse`.
///
/// Kept as raw JSON so the receiver can decompress and validate it before
/// committing to a typed decode.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPayload(pub Value);

impl EncodedPayload {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn is_compressed(&self) -> bool {
        compression::is_compressed(&self.0)
    }
}

/// Encodes outbound payloads and unwraps inbound ones.
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    pub compression_threshold: usize,
    pub max_payload_bytes: usize,
}

impl PayloadCodec {
    pub fn new(compression_threshold: usize, max_payload_bytes: usize) -> Self {
        Self {
            compression_threshold,
            max_payload_bytes,
        }
    }

    /// Serialize `payload`, compressing it when over the threshold.
    pub fn encode(&self, payload: &DataPayload) -> Result<EncodedPayload, SyncError> {
        let json = serde_json::to_string(payload)?;
        if json.len() > self.max_payload_bytes {
            return Err(SyncError::DataTooLarge {
                size: json.len(),
                limit: self.max_payload_bytes,
            });
        }
        Ok(EncodedPayload(compression::wrap(
            json,
            self.compression_threshold,
        )?))
    }

    /// Decompress an inbound body into plain JSON, enforcing the size limit.
    pub fn unwrap(&self, encoded: EncodedPayload) -> Result<Value, SyncError> {
        compression::unwrap(encoded.0, self.max_payload_bytes)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(8 * 1024, 16 * 1024 * 1024)
    }
}
