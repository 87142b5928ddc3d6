//! In-memory implementation of the KvStore trait.
//!
//! Same semantics as SQLite, nothing persisted. Sharing one `Arc<MemoryStore>`
//! between several contexts models tabs of one browser profile sharing an
//! origin's storage.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{Result, StoreError};
use crate::traits::{KvStore, StorageEvent};

/// Capacity of the change feed before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 256;

/// In-memory store implementation. Thread-safe via RwLock.
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            values: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.values.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, key: &str, value: Option<String>) {
        // No subscribers is fine.
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            value,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Poisoned(e.to_string())
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.read().map_err(poisoned)?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut values = self.values.write().map_err(poisoned)?;
            values.insert(key.to_string(), value.to_string());
        }
        self.publish(key, Some(value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let existed = {
            let mut values = self.values.write().map_err(poisoned)?;
            values.remove(key).is_some()
        };
        if existed {
            self.publish(key, None);
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let values = self.values.read().map_err(poisoned)?;
        Ok(values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
