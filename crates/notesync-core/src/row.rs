//! SyncRow: the unit every replica exchanges and merges.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DeviceId, RowId, UserId};

/// Module-specific fields of a row, flattened next to the metadata.
pub type Fields = serde_json::Map<String, Value>;

/// Metadata keys owned by the sync layer. Module fields never use them.
pub const RESERVED_FIELDS: [&str; 5] = ["id", "user_id", "updated_at", "updated_by", "deleted_at"];

/// One record of a synchronized table.
///
/// Serialized flat: `{"id", "user_id", "updated_at", "updated_by",
/// "deleted_at", ...fields}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRow {
    /// Client-generated id, stable across devices.
    pub id: RowId,

    /// Owner of the row.
    pub user_id: UserId,

    /// Last write time in Unix ms. The only merge key.
    pub updated_at: i64,

    /// Device that performed the last write.
    pub updated_by: DeviceId,

    /// Set when the row is a tombstone.
    #[serde(default)]
    pub deleted_at: Option<i64>,

    /// Module fields.
    #[serde(flatten)]
    pub fields: Fields,
}

impl SyncRow {
    /// Create a live row with no module fields.
    pub fn new(id: RowId, user_id: UserId, updated_at: i64, updated_by: DeviceId) -> Self {
        Self {
            id,
            user_id,
            updated_at,
            updated_by,
            deleted_at: None,
            fields: Fields::new(),
        }
    }

    /// Set a module field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Replace all module fields.
    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    /// Turn this row into a tombstone deleted at `at`.
    pub fn into_tombstone(mut self, at: i64) -> Self {
        self.deleted_at = Some(at);
        self.fields.clear();
        self
    }

    /// Whether this row marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Look up a module field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_flattens_fields() {
        let row = SyncRow::new("a".into(), "u".into(), 100, "dev".into()).with_field("title", "x");
        let value = serde_json::to_value(&row).unwrap();

        assert_eq!(value["title"], json!("x"));
        assert_eq!(value["updated_at"], json!(100));
        assert_eq!(value["deleted_at"], Value::Null);
    }

    #[test]
    fn test_row_parses_without_deleted_at() {
        let row: SyncRow = serde_json::from_value(json!({
            "id": "a",
            "user_id": "u",
            "updated_at": 5,
            "updated_by": "dev",
            "title": "hello",
        }))
        .unwrap();

        assert!(!row.is_tombstone());
        assert_eq!(row.field("title"), Some(&json!("hello")));
        assert!(!row.fields.contains_key("id"));
    }

    #[test]
    fn test_tombstone_drops_fields() {
        let row = SyncRow::new("a".into(), "u".into(), 1, "dev".into())
            .with_field("title", "x")
            .into_tombstone(7);

        assert!(row.is_tombstone());
        assert!(row.fields.is_empty());
        assert_eq!(row.deleted_at, Some(7));
    }
}
