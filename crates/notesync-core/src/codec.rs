//! Row codecs: mapping a module's domain record to and from row fields.
//!
//! A codec never touches sync metadata. `encode` strips the reserved keys
//! so a record cannot spoof `updated_at` or `deleted_at`; `decode` puts the
//! row's `id` back so records that carry their own id round-trip.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::merge::MaterializedState;
use crate::row::{Fields, SyncRow, RESERVED_FIELDS};

/// (De)serializes a module's domain record into the row shape.
pub trait RowCodec: Send + Sync {
    /// The module's domain record.
    type Record;

    /// Produce the module fields for `record`.
    fn encode(&self, record: &Self::Record) -> Result<Fields>;

    /// Rebuild the record from a live row.
    fn decode(&self, row: &SyncRow) -> Result<Self::Record>;

    /// Decode every live row of a table, in id order.
    fn decode_state(&self, state: &MaterializedState) -> Result<Vec<Self::Record>> {
        state.live_rows().map(|row| self.decode(row)).collect()
    }
}

/// Codec for any serde record that serializes to a JSON object.
pub struct JsonCodec<T> {
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RowCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    type Record = T;

    fn encode(&self, record: &T) -> Result<Fields> {
        match serde_json::to_value(record)? {
            Value::Object(mut fields) => {
                for key in RESERVED_FIELDS {
                    fields.remove(key);
                }
                Ok(fields)
            }
            other => Err(CoreError::NotAnObject(json_kind(&other))),
        }
    }

    fn decode(&self, row: &SyncRow) -> Result<T> {
        let mut object = row.fields.clone();
        object.insert("id".to_string(), Value::String(row.id.as_str().to_string()));
        serde_json::from_value(Value::Object(object)).map_err(|e| CoreError::MalformedRow {
            id: row.id.to_string(),
            reason: e.to_string(),
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Serialize rows for durable storage.
pub fn encode_rows<'a>(rows: impl IntoIterator<Item = &'a SyncRow>) -> Result<String> {
    let rows: Vec<&SyncRow> = rows.into_iter().collect();
    Ok(serde_json::to_string(&rows)?)
}

/// Parse rows written by [`encode_rows`].
pub fn decode_rows(raw: &str) -> Result<Vec<SyncRow>> {
    Ok(serde_json::from_str(raw)?)
}
