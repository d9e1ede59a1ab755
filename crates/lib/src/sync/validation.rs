//! Schema checks for inbound record payloads.
//!
//! Runs on the decompressed JSON before any typed decoding, so a rejected
//! payload never reaches the merger or storage. Errors name the offending
//! path, e.g. `records[2].metadata.version`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::error::SyncError;
use crate::record::EntityType;

/// Validate a `{dataType, records}` payload and return its kind.
pub fn validate_payload(value: &Value) -> Result<EntityType, SyncError> {
    let root = Fields::root(value)?;
    let data_type = root.required_str("dataType")?;
    let entity_type: EntityType = serde_json::from_value(Value::String(data_type.to_string()))
        .map_err(|_| invalid("dataType", format!("unknown data type {data_type:?}")))?;

    let records = root
        .get("records")
        .ok_or_else(|| invalid("records", "missing"))?
        .as_array()
        .ok_or_else(|| invalid("records", "expected an array"))?;

    for (index, record) in records.iter().enumerate() {
        let path = format!("records[{index}]");
        let fields = Fields::object(record, &path)?;
        validate_record(entity_type, &fields)?;
        let metadata = fields
            .get("metadata")
            .ok_or_else(|| invalid(&format!("{path}.metadata"), "missing"))?;
        validate_metadata(metadata, &format!("{path}.metadata"))?;
    }
    Ok(entity_type)
}

fn validate_record(entity_type: EntityType, fields: &Fields<'_>) -> Result<(), SyncError> {
    fields.required_str("id")?;
    match entity_type {
        EntityType::Task => {
            fields.required_str("title")?;
            fields.optional_str("notes")?;
            fields.optional_str("listId")?;
            fields.optional_bool("completed")?;
            fields.optional_timestamp("dueAt")?;
            fields.optional_i64("priority")?;
        }
        EntityType::TaskList => {
            fields.required_str("name")?;
            fields.optional_str("color")?;
            fields.optional_i64("position")?;
        }
        EntityType::TimeLogEntry => {
            fields.optional_str("taskId")?;
            fields.required_str("label")?;
            let start = fields.required_timestamp("startTime")?;
            if let Some(end) = fields.optional_timestamp("endTime")?
                && end < start
            {
                return Err(fields.error("endTime", "before startTime"));
            }
            fields.optional_u64("durationSeconds")?;
        }
        EntityType::Goal => {
            fields.required_str("title")?;
            let minutes = fields.required_u64("targetMinutes")?;
            if minutes > u64::from(u32::MAX) {
                return Err(fields.error("targetMinutes", "out of range"));
            }
            let period = fields.required_str("period")?;
            if !matches!(period, "daily" | "weekly" | "monthly") {
                return Err(fields.error("period", format!("unknown period {period:?}")));
            }
            fields.optional_str("taskId")?;
        }
    }
    Ok(())
}

/// Validate one `metadata` object.
pub fn validate_metadata(value: &Value, path: &str) -> Result<(), SyncError> {
    let fields = Fields::object(value, path)?;
    fields.required_timestamp("lastModifiedAt")?;
    if fields.required_str("lastModifiedBy")?.is_empty() {
        return Err(fields.error("lastModifiedBy", "empty"));
    }
    let version = fields.required_u64("version")?;
    if version < 1 {
        return Err(fields.error("version", "must be at least 1"));
    }
    fields.optional_bool("isDeleted")?;
    fields.optional_timestamp("baseModifiedAt")?;
    fields.optional_str("baseModifiedBy")?;
    if let Some(base) = fields.optional_u64("baseVersion")?
        && base > version
    {
        return Err(fields.error(
            "baseVersion",
            format!("{base} is greater than version {version}"),
        ));
    }
    Ok(())
}

fn invalid(path: &str, reason: impl std::fmt::Display) -> SyncError {
    SyncError::ValidationFailed(format!("{path}: {reason}"))
}

/// Typed accessors over one JSON object, reporting errors with a path.
struct Fields<'a> {
    map: &'a Map<String, Value>,
    path: String,
}

impl<'a> Fields<'a> {
    fn root(value: &'a Value) -> Result<Self, SyncError> {
        Self::object(value, "")
    }

    fn object(value: &'a Value, path: &str) -> Result<Self, SyncError> {
        let map = value.as_object().ok_or_else(|| {
            invalid(if path.is_empty() { "payload" } else { path }, "expected an object")
        })?;
        Ok(Self {
            map,
            path: path.to_string(),
        })
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key)
    }

    /// A present, non-null value.
    fn present(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn error(&self, key: &str, reason: impl std::fmt::Display) -> SyncError {
        if self.path.is_empty() {
            invalid(key, reason)
        } else {
            invalid(&format!("{}.{key}", self.path), reason)
        }
    }

    fn required(&self, key: &str) -> Result<&'a Value, SyncError> {
        self.present(key).ok_or_else(|| self.error(key, "missing"))
    }

    fn required_str(&self, key: &str) -> Result<&'a str, SyncError> {
        self.required(key)?
            .as_str()
            .ok_or_else(|| self.error(key, "expected a string"))
    }

    fn optional_str(&self, key: &str) -> Result<Option<&'a str>, SyncError> {
        self.present(key)
            .map(|v| v.as_str().ok_or_else(|| self.error(key, "expected a string")))
            .transpose()
    }

    fn optional_bool(&self, key: &str) -> Result<Option<bool>, SyncError> {
        self.present(key)
            .map(|v| v.as_bool().ok_or_else(|| self.error(key, "expected a boolean")))
            .transpose()
    }

    fn required_u64(&self, key: &str) -> Result<u64, SyncError> {
        self.required(key)?
            .as_u64()
            .ok_or_else(|| self.error(key, "expected a non-negative integer"))
    }

    fn optional_u64(&self, key: &str) -> Result<Option<u64>, SyncError> {
        self.present(key)
            .map(|v| v.as_u64().ok_or_else(|| self.error(key, "expected a non-negative integer")))
            .transpose()
    }

    fn optional_i64(&self, key: &str) -> Result<Option<i64>, SyncError> {
        self.present(key)
            .map(|v| v.as_i64().ok_or_else(|| self.error(key, "expected an integer")))
            .transpose()
    }

    fn required_timestamp(&self, key: &str) -> Result<DateTime<Utc>, SyncError> {
        let text = self.required_str(key)?;
        parse_timestamp(text).ok_or_else(|| self.error(key, format!("not an RFC 3339 timestamp: {text:?}")))
    }

    fn optional_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        match self.optional_str(key)? {
            None => Ok(None),
            Some(text) => parse_timestamp(text)
                .map(Some)
                .ok_or_else(|| self.error(key, format!("not an RFC 3339 timestamp: {text:?}"))),
        }
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
