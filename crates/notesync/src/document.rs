//! Whole-document sync for single-document modules.
//!
//! Every edit is saved locally right away. The remote copy only changes on
//! an explicit push, and the local copy only takes the remote one on an
//! explicit pull. The last explicit push wins in full; there is no merge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use notesync_core::{Clock, DeviceId, UserId};
use notesync_store::{KvStore, StoreExt};
use notesync_sync::{BusHandler, BusMessage, CrossContextBus, RemoteDocuments, UserDocument};

use crate::error::{NotesyncError, Result};
use crate::registry::ManualSync;

/// Local storage key of a document.
pub fn doc_key(key: &str) -> String {
    format!("doc:{}", key)
}

/// What a document pull did.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentPull {
    /// The remote had no copy; the local one was pushed as the first sync.
    SeededRemote,
    /// The remote copy was newer or equal and replaced the local one.
    Replaced(UserDocument),
    /// The local copy is strictly newer and was kept.
    KeptLocal,
    /// Neither side has the document.
    Empty,
}

/// Syncs whole JSON documents by key.
pub struct DocumentSyncAdapter {
    store: Arc<dyn KvStore>,
    remote: Arc<dyn RemoteDocuments>,
    bus: Option<Arc<CrossContextBus>>,
    clock: Arc<dyn Clock>,
    user_id: UserId,
    device_id: DeviceId,
    keys: Vec<String>,
    cache: Mutex<HashMap<String, UserDocument>>,
}

impl DocumentSyncAdapter {
    /// Create an adapter managing `keys`. Pulls and pushes triggered
    /// through [`ManualSync`] cover those keys.
    pub fn new<I, K>(
        store: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteDocuments>,
        clock: Arc<dyn Clock>,
        user_id: UserId,
        device_id: DeviceId,
        keys: I,
    ) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            store,
            remote,
            bus: None,
            clock,
            user_id,
            device_id,
            keys: keys.into_iter().map(Into::into).collect(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Announce applied pulls on `bus`.
    pub fn with_bus(mut self, bus: Arc<CrossContextBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The in-memory copy of a document, as last loaded or saved.
    pub fn cached(&self, key: &str) -> Option<UserDocument> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remember(&self, key: &str, doc: Option<UserDocument>) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        match doc {
            Some(doc) => {
                cache.insert(key.to_string(), doc);
            }
            None => {
                cache.remove(key);
            }
        }
    }

    /// Read the local copy. A corrupt copy reads as absent.
    pub async fn load_local(&self, key: &str) -> Result<Option<UserDocument>> {
        let doc: Option<UserDocument> = self.store.load_json_or_default(&doc_key(key)).await?;
        self.remember(key, doc.clone());
        Ok(doc)
    }

    /// Persist an edit locally.
    pub async fn save_local(&self, key: &str, body: Value) -> Result<UserDocument> {
        let doc = UserDocument {
            body,
            updated_at: self.clock.now_millis(),
            updated_by: self.device_id.clone(),
        };
        self.write_local(key, &doc).await?;
        Ok(doc)
    }

    async fn write_local(&self, key: &str, doc: &UserDocument) -> Result<()> {
        self.store.set_json(&doc_key(key), doc).await?;
        self.remember(key, Some(doc.clone()));
        Ok(())
    }

    /// Fetch the remote copy and reconcile it with the local one.
    pub async fn pull(&self, key: &str) -> Result<DocumentPull> {
        let local = self.load_local(key).await?;
        let remote = self.remote.load_user_doc(&self.user_id, key).await?;

        match (remote, local) {
            (None, None) => Ok(DocumentPull::Empty),
            (None, Some(local)) => {
                self.remote.save_user_doc(&self.user_id, key, local).await?;
                tracing::info!(%key, "remote document missing, local copy pushed");
                Ok(DocumentPull::SeededRemote)
            }
            (Some(remote), Some(local)) if local.updated_at > remote.updated_at => {
                tracing::debug!(%key, local = local.updated_at, remote = remote.updated_at, "local document newer, kept");
                Ok(DocumentPull::KeptLocal)
            }
            (Some(remote), _) => {
                self.write_local(key, &remote).await?;
                self.announce(key).await;
                tracing::debug!(%key, updated_at = remote.updated_at, "remote document applied");
                Ok(DocumentPull::Replaced(remote))
            }
        }
    }

    /// Push the local copy, stamped now, replacing the remote one in full.
    pub async fn push(&self, key: &str) -> Result<UserDocument> {
        let Some(mut doc) = self.load_local(key).await? else {
            return Err(NotesyncError::MissingDocument(key.to_string()));
        };
        doc.updated_at = self.clock.now_millis();
        doc.updated_by = self.device_id.clone();

        self.remote.save_user_doc(&self.user_id, key, doc.clone()).await?;
        self.write_local(key, &doc).await?;
        tracing::debug!(%key, updated_at = doc.updated_at, "document pushed");
        Ok(doc)
    }

    /// Another context wrote the local copy; reload it.
    pub async fn on_local_doc_applied(&self, key: &str) -> Result<()> {
        self.load_local(key).await?;
        Ok(())
    }

    async fn announce(&self, key: &str) {
        let Some(bus) = &self.bus else {
            return;
        };
        let message = BusMessage::LocalDocApplied {
            doc_key: key.to_string(),
        };
        if let Err(e) = bus.publish(message).await {
            tracing::warn!(%key, error = %e, "could not announce applied document");
        }
    }
}

#[async_trait]
impl BusHandler for DocumentSyncAdapter {
    async fn on_local_doc_applied(&self, doc_key: &str) {
        if !self.keys.iter().any(|key| key == doc_key) {
            return;
        }
        if let Err(e) = DocumentSyncAdapter::on_local_doc_applied(self, doc_key).await {
            tracing::warn!(key = %doc_key, error = %e, "reloading document failed");
        }
    }
}

#[async_trait]
impl ManualSync for DocumentSyncAdapter {
    async fn pull(&self) -> anyhow::Result<()> {
        for key in &self.keys {
            DocumentSyncAdapter::pull(self, key).await?;
        }
        Ok(())
    }

    async fn push(&self) -> anyhow::Result<()> {
        for key in &self.keys {
            match DocumentSyncAdapter::push(self, key).await {
                Ok(_) | Err(NotesyncError::MissingDocument(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        for key in &self.keys {
            self.store.remove(&doc_key(key)).await?;
            self.remember(key, None);
            DocumentSyncAdapter::pull(self, key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_core::ManualClock;
    use notesync_store::MemoryStore;
    use notesync_sync::MemoryRemote;
    use serde_json::json;

    struct Setup {
        store: Arc<MemoryStore>,
        remote: Arc<MemoryRemote>,
        clock: Arc<ManualClock>,
    }

    impl Setup {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(100));
            Self {
                store: Arc::new(MemoryStore::new()),
                remote: MemoryRemote::new(clock.clone()),
                clock,
            }
        }

        fn adapter(&self, device: &str) -> DocumentSyncAdapter {
            DocumentSyncAdapter::new(
                self.store.clone(),
                self.remote.clone(),
                self.clock.clone(),
                "u".into(),
                device.into(),
                ["journal"],
            )
        }
    }

    #[tokio::test]
    async fn test_first_pull_pushes_local_copy() {
        let s = Setup::new();
        let adapter = s.adapter("dev-a");
        adapter.save_local("journal", json!({"text": "hi"})).await.unwrap();

        assert_eq!(adapter.pull("journal").await.unwrap(), DocumentPull::SeededRemote);
        let remote = s.remote.document(&"u".into(), "journal").unwrap();
        assert_eq!(remote.body, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_pull_with_nothing_anywhere() {
        let s = Setup::new();
        assert_eq!(s.adapter("dev-a").pull("journal").await.unwrap(), DocumentPull::Empty);
    }

    #[tokio::test]
    async fn test_newer_remote_replaces_local() {
        let s = Setup::new();
        let adapter = s.adapter("dev-a");
        adapter.save_local("journal", json!("old")).await.unwrap();

        s.clock.set(200);
        let remote = UserDocument {
            body: json!("new"),
            updated_at: 200,
            updated_by: "dev-b".into(),
        };
        s.remote
            .save_user_doc(&"u".into(), "journal", remote.clone())
            .await
            .unwrap();

        assert_eq!(adapter.pull("journal").await.unwrap(), DocumentPull::Replaced(remote));
        assert_eq!(adapter.cached("journal").unwrap().body, json!("new"));
        assert_eq!(adapter.load_local("journal").await.unwrap().unwrap().body, json!("new"));
    }

    #[tokio::test]
    async fn test_strictly_newer_local_is_kept() {
        let s = Setup::new();
        let adapter = s.adapter("dev-a");
        s.remote
            .save_user_doc(
                &"u".into(),
                "journal",
                UserDocument {
                    body: json!("remote"),
                    updated_at: 50,
                    updated_by: "dev-b".into(),
                },
            )
            .await
            .unwrap();
        adapter.save_local("journal", json!("local")).await.unwrap();

        assert_eq!(adapter.pull("journal").await.unwrap(), DocumentPull::KeptLocal);
        assert_eq!(adapter.cached("journal").unwrap().body, json!("local"));
    }

    #[tokio::test]
    async fn test_push_stamps_and_replaces_remote() {
        let s = Setup::new();
        let adapter = s.adapter("dev-a");
        adapter.save_local("journal", json!({"text": "draft"})).await.unwrap();

        s.clock.set(900);
        let pushed = adapter.push("journal").await.unwrap();

        assert_eq!(pushed.updated_at, 900);
        assert_eq!(pushed.updated_by.as_str(), "dev-a");
        assert_eq!(s.remote.document(&"u".into(), "journal").unwrap(), pushed);
    }

    #[tokio::test]
    async fn test_push_without_local_copy_fails() {
        let s = Setup::new();
        let err = s.adapter("dev-a").push("journal").await.unwrap_err();
        assert!(matches!(err, NotesyncError::MissingDocument(_)));
    }

    #[tokio::test]
    async fn test_corrupt_local_copy_reads_as_absent() {
        let s = Setup::new();
        s.store.set("doc:journal", "{not json").await.unwrap();
        assert!(s.adapter("dev-a").load_local("journal").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reload_after_other_context_applied() {
        let s = Setup::new();
        let tab_a = s.adapter("dev-a");
        let tab_b = s.adapter("dev-a");
        tab_a.save_local("journal", json!("v1")).await.unwrap();
        tab_b.load_local("journal").await.unwrap();

        tab_a.save_local("journal", json!("v2")).await.unwrap();
        BusHandler::on_local_doc_applied(&tab_b, "journal").await;

        assert_eq!(tab_b.cached("journal").unwrap().body, json!("v2"));
    }
}
