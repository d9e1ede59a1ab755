//! Gzip + base64 compression envelope for large payloads.
//!
//! A compressed body travels as `{"compressed": true, "data": "<base64>"}`
//! where `data` is the gzip of the payload's JSON text.

use std::io::{Read, Write};

use base64ct::{Base64, Encoding};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde_json::{Value, json};

use crate::sync::error::SyncError;

/// Gzip `json` and encode it as base64.
pub fn compress(json: &str) -> Result<String, SyncError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(json.as_bytes())?;
    let bytes = encoder.finish()?;
    Ok(Base64::encode_string(&bytes))
}

/// Reverse [`compress`], refusing output larger than `limit` bytes.
pub fn decompress(encoded: &str, limit: usize) -> Result<String, SyncError> {
    let bytes = Base64::decode_vec(encoded)
        .map_err(|e| SyncError::DataCorrupted(format!("invalid base64 in compressed payload: {e}")))?;

    let mut out = Vec::new();
    GzDecoder::new(bytes.as_slice())
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| SyncError::DataCorrupted(format!("invalid gzip stream: {e}")))?;
    if out.len() > limit {
        return Err(SyncError::DataTooLarge {
            size: out.len(),
            limit,
        });
    }

    String::from_utf8(out)
        .map_err(|e| SyncError::DataCorrupted(format!("decompressed payload is not UTF-8: {e}")))
}

/// Whether `value` is a compression envelope.
pub fn is_compressed(value: &Value) -> bool {
    value.get("compressed").and_then(Value::as_bool) == Some(true)
}

/// Wrap `json` in a compression envelope when it is longer than `threshold`.
pub fn wrap(json: String, threshold: usize) -> Result<Value, SyncError> {
    if json.len() > threshold {
        let data = compress(&json)?;
        Ok(json!({ "compressed": true, "data": data }))
    } else {
        Ok(serde_json::from_str(&json)?)
    }
}

/// Unwrap a body that may or may not be compressed.
///
/// Decompression failures are [`SyncError::DataCorrupted`]; bodies over
/// `limit` bytes are [`SyncError::DataTooLarge`].
pub fn unwrap(value: Value, limit: usize) -> Result<Value, SyncError> {
    if !is_compressed(&value) {
        let size = serde_json::to_vec(&value)?.len();
        if size > limit {
            return Err(SyncError::DataTooLarge { size, limit });
        }
        return Ok(value);
    }

    let encoded = value
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::DataCorrupted("compressed payload has no data".to_string()))?;
    let json = decompress(encoded, limit)?;
    serde_json::from_str(&json)
        .map_err(|e| SyncError::DataCorrupted(format!("decompressed payload is not JSON: {e}")))
}
