//! Wire types exchanged with the remote store and between contexts.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use notesync_core::{DeviceId, Fields, RowId, SyncRow, UserId};

/// Rows per table, as sent by `push_batch` and returned by `pull_batch`.
pub type TableRows = BTreeMap<String, Vec<SyncRow>>;

/// Payload of `push_batch`.
pub type PushBatch = TableRows;

/// Response of `pull_batch`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Rows with `updated_at > since`, tombstones included, per table.
    #[serde(default)]
    pub diffs: TableRows,

    /// Server time at the moment of the pull. `None` when the remote sent
    /// nothing usable, in which case the cursor is left alone.
    #[serde(default, deserialize_with = "lenient_millis")]
    pub server_time_ms: Option<i64>,
}

/// Accept any JSON for the server time; keep it only if it is a finite
/// number.
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        _ => None,
    })
}

/// One row of a `push_generic` request: an id plus either module fields
/// (upsert) or `deleted_at` (tombstone).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRow {
    pub id: RowId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,

    #[serde(flatten)]
    pub fields: Fields,
}

impl PushRow {
    pub fn upsert(id: RowId, fields: Fields) -> Self {
        Self {
            id,
            deleted_at: None,
            fields,
        }
    }

    pub fn tombstone(id: RowId, deleted_at: i64) -> Self {
        Self {
            id,
            deleted_at: Some(deleted_at),
            fields: Fields::new(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Payload of `push_generic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushGeneric {
    pub table: String,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub rows: Vec<PushRow>,
}

/// A whole-document record for modules synchronized as one JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDocument {
    pub body: Value,
    pub updated_at: i64,
    pub updated_by: DeviceId,
}

/// Signals exchanged between contexts (tabs, windows, embedded frames).
///
/// Wire shape: `{"type": "PULL"}`, `{"type": "LOCAL_DOC_APPLIED", "docKey": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusMessage {
    /// Re-pull from the remote.
    Pull,
    /// Push anything still pending.
    Push,
    /// Drop local state; always followed by a `Pull`.
    Reset,
    /// Another context already wrote the authoritative local copy of a
    /// document; reload it from local storage instead of re-pulling.
    LocalDocApplied {
        #[serde(rename = "docKey")]
        doc_key: String,
    },
}
