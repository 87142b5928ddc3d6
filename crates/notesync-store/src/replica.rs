//! Local replica persistence: one key per (module group, table) holding the
//! full materialized state, tombstones included.

use std::sync::Arc;

use notesync_core::{decode_rows, encode_rows, MaterializedState, ModuleGroup};

use crate::error::Result;
use crate::traits::KvStore;

/// Storage key for a table's materialized state.
pub fn replica_key(group: &ModuleGroup, table: &str) -> String {
    format!("replica:{}:{}", group, table)
}

/// Loads and saves materialized tables.
pub struct LocalReplicaStore<S: KvStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KvStore + ?Sized> Clone for LocalReplicaStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KvStore + ?Sized> LocalReplicaStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Load a table. Missing or corrupt data yields an empty state.
    pub async fn load(&self, group: &ModuleGroup, table: &str) -> Result<MaterializedState> {
        let key = replica_key(group, table);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(MaterializedState::new());
        };

        match decode_rows(&raw) {
            Ok(rows) => Ok(MaterializedState::from_rows(rows)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "corrupt local replica, starting empty");
                Ok(MaterializedState::new())
            }
        }
    }

    /// Replace the stored copy of a table.
    pub async fn save(
        &self,
        group: &ModuleGroup,
        table: &str,
        state: &MaterializedState,
    ) -> Result<()> {
        let raw = encode_rows(state.entries())?;
        self.store.set(&replica_key(group, table), &raw).await
    }

    pub async fn clear(&self, group: &ModuleGroup, table: &str) -> Result<()> {
        self.store.remove(&replica_key(group, table)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use notesync_core::SyncRow;

    fn row(id: &str, at: i64) -> SyncRow {
        SyncRow::new(id.into(), "u".into(), at, "dev".into()).with_field("title", id)
    }

    #[tokio::test]
    async fn test_replica_roundtrip_keeps_tombstones() {
        let store = Arc::new(MemoryStore::new());
        let replicas = LocalReplicaStore::new(store);
        let group = ModuleGroup::from("tasks");

        let state = MaterializedState::from_rows([row("a", 1), row("b", 2).into_tombstone(2)]);
        replicas.save(&group, "items", &state).await.unwrap();

        let loaded = replicas.load(&group, "items").await.unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.tombstones().count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_replica_loads_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set("replica:tasks:items", "[{\"id\":").await.unwrap();

        let replicas = LocalReplicaStore::new(store);
        let loaded = replicas.load(&"tasks".into(), "items").await.unwrap();
        assert!(loaded.is_blank());
    }

    #[tokio::test]
    async fn test_clear_removes_key() {
        let store = Arc::new(MemoryStore::new());
        let replicas = LocalReplicaStore::new(store.clone());
        let group = ModuleGroup::from("tasks");

        replicas
            .save(&group, "items", &MaterializedState::from_rows([row("a", 1)]))
            .await
            .unwrap();
        replicas.clear(&group, "items").await.unwrap();

        assert!(store.is_empty());
    }
}
