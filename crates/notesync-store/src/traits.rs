//! KvStore trait: the abstract interface for durable client storage.
//!
//! Implementations include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::Result;

/// A write observed on a store: the key and its new value (`None` when
/// the key was removed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub value: Option<String>,
}

/// Async string key-value store.
///
/// # Design Notes
///
/// - **Whole-value writes**: `set` replaces the value of a key entirely.
/// - **Change feed**: every `set`/`remove` is published to subscribers,
///   which is how other contexts sharing the store notice a write.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a key, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Subscribe to writes made through this store.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// Extension trait for JSON values.
pub trait StoreExt: KvStore {
    /// Read and parse a JSON value.
    fn get_json<T>(&self, key: &str) -> impl std::future::Future<Output = Result<Option<T>>> + Send
    where
        T: DeserializeOwned + Send;

    /// Serialize and write a JSON value.
    fn set_json<T>(&self, key: &str, value: &T) -> impl std::future::Future<Output = Result<()>> + Send
    where
        T: Serialize + Sync;

    /// Read a JSON value, treating a missing or corrupt value as `T::default()`.
    ///
    /// Storage errors still propagate; only parse failures are absorbed.
    fn load_json_or_default<T>(&self, key: &str) -> impl std::future::Future<Output = Result<T>> + Send
    where
        T: DeserializeOwned + Default + Send;
}

impl<S: KvStore + ?Sized> StoreExt for S {
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw).await
    }

    async fn load_json_or_default<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default + Send,
    {
        let Some(raw) = self.get(key).await? else {
            return Ok(T::default());
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "corrupt local value, using default");
                Ok(T::default())
            }
        }
    }
}
