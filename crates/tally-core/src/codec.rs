//! # Record Codec
//!
//! Converts between local [`SyncRecord`]s and the documents stored in the
//! remote backend.
//!
//! ## Document Layout
//! ```text
//! {
//!   "name": "Cola 330ml",          ← payload fields, in order
//!   "price_cents": 150,
//!   "_id": "r-7f3a",               ← remote key (absent on first write)
//!   "_local_id": "p-1",            ← authoring device's id
//!   "_updated_at": "2024-...Z",    ← conflict tie-break value
//!   "_origin": "local",            ← every outbound write is tagged local
//!   "_device": "till-02"           ← authoring device
//! }
//! ```
//!
//! Every key starting with `_` belongs to the codec. A payload that tries to
//! use one is rejected at encode time, and decode strips them all.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::types::{Origin, Payload, SyncRecord, SyncState, SyncTable};

/// Document as stored by the remote backend.
pub type WireDocument = serde_json::Map<String, Value>;

pub const RESERVED_PREFIX: char = '_';
pub const FIELD_ID: &str = "_id";
pub const FIELD_LOCAL_ID: &str = "_local_id";
pub const FIELD_UPDATED_AT: &str = "_updated_at";
pub const FIELD_ORIGIN: &str = "_origin";
pub const FIELD_DEVICE: &str = "_device";

/// Encodes a record for an outbound write.
pub fn encode(record: &SyncRecord, device_id: &str) -> CoreResult<WireDocument> {
    if let Some(field) = record
        .payload
        .keys()
        .find(|k| k.starts_with(RESERVED_PREFIX))
    {
        return Err(CoreError::ReservedField {
            field: field.clone(),
        });
    }

    let mut doc = record.payload.clone();
    if let Some(remote_id) = &record.remote_id {
        doc.insert(FIELD_ID.to_string(), Value::String(remote_id.clone()));
    }
    doc.insert(
        FIELD_LOCAL_ID.to_string(),
        Value::String(record.local_id.clone()),
    );
    doc.insert(
        FIELD_UPDATED_AT.to_string(),
        Value::String(format_timestamp(&record.updated_at)),
    );
    doc.insert(
        FIELD_ORIGIN.to_string(),
        Value::String(Origin::Local.as_str().to_string()),
    );
    doc.insert(FIELD_DEVICE.to_string(), Value::String(device_id.to_string()));

    Ok(doc)
}

/// Decodes a remote document stored under `key`.
///
/// The result is marked `origin = remote`, `sync_state = synced`, and carries
/// `key` as its remote id.
pub fn decode(table: SyncTable, key: &str, doc: &WireDocument) -> CoreResult<SyncRecord> {
    let updated_at = match doc.get(FIELD_UPDATED_AT) {
        Some(Value::String(raw)) => parse_timestamp(raw)
            .ok_or_else(|| CoreError::malformed(key, format!("bad {FIELD_UPDATED_AT}: {raw}")))?,
        Some(_) => {
            return Err(CoreError::malformed(
                key,
                format!("{FIELD_UPDATED_AT} is not a string"),
            ))
        }
        None => return Err(CoreError::malformed(key, format!("missing {FIELD_UPDATED_AT}"))),
    };

    let local_id = match doc.get(FIELD_LOCAL_ID) {
        Some(Value::String(id)) => id.clone(),
        Some(_) => {
            return Err(CoreError::malformed(
                key,
                format!("{FIELD_LOCAL_ID} is not a string"),
            ))
        }
        None => key.to_string(),
    };

    let payload: Payload = doc
        .iter()
        .filter(|(k, _)| !k.starts_with(RESERVED_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(SyncRecord {
        table,
        local_id,
        remote_id: Some(key.to_string()),
        payload,
        sync_state: SyncState::Synced,
        updated_at,
        origin: Origin::Remote,
    })
}

/// Reads the `updated_at` stamp from a document, if present and valid.
pub fn document_updated_at(doc: &WireDocument) -> Option<DateTime<Utc>> {
    doc.get(FIELD_UPDATED_AT)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

/// RFC 3339 with as many fractional digits as needed, so the stamp survives
/// the round trip exactly.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
