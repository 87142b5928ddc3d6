//! Pull cursors: the server-time watermark of the last applied pull, per
//! (user, module group).
//!
//! A cursor only moves forward. An incremental pull adopts the server time
//! when it is not older than the stored value; a forced full pull adopts it
//! only when strictly newer, so a resync can never regress a cursor that a
//! concurrent normal pull already moved.

use std::sync::Arc;

use tokio::sync::Mutex;

use notesync_core::{ModuleGroup, UserId};

use crate::error::Result;
use crate::traits::KvStore;

/// How a pull was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// `since` = stored cursor.
    Incremental,
    /// `since` = 0.
    Full,
}

impl PullMode {
    pub fn from_force_full(force_full: bool) -> Self {
        if force_full {
            PullMode::Full
        } else {
            PullMode::Incremental
        }
    }
}

/// Storage key for a cursor.
pub fn cursor_key(user_id: &UserId, group: &ModuleGroup) -> String {
    format!("sync:since:{}:{}", user_id, group)
}

/// Reads and advances cursors.
///
/// Cloning shares the internal lock, so every clone handed to coordinators
/// of one process serializes its read-compare-write.
pub struct CursorTracker<S: KvStore + ?Sized> {
    store: Arc<S>,
    lock: Arc<Mutex<()>>,
}

impl<S: KvStore + ?Sized> Clone for CursorTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lock: Arc::clone(&self.lock),
        }
    }
}

impl<S: KvStore + ?Sized> CursorTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Current cursor, or 0 when absent or unreadable.
    pub async fn read(&self, user_id: &UserId, group: &ModuleGroup) -> Result<i64> {
        let key = cursor_key(user_id, group);
        Ok(self.read_key(&key).await?.unwrap_or(0))
    }

    async fn read_key(&self, key: &str) -> Result<Option<i64>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<i64>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                tracing::warn!(key, raw = %raw, "unreadable cursor, treating as 0");
                Ok(None)
            }
        }
    }

    /// Move the cursor to `server_time` if allowed.
    ///
    /// `None` (the remote sent no usable time) is a no-op. Returns whether
    /// the stored cursor changed.
    pub async fn advance(
        &self,
        user_id: &UserId,
        group: &ModuleGroup,
        server_time: Option<i64>,
        mode: PullMode,
    ) -> Result<bool> {
        let Some(server_time) = server_time else {
            return Ok(false);
        };

        let key = cursor_key(user_id, group);
        let _guard = self.lock.lock().await;

        let stored = self.read_key(&key).await?;
        let adopt = match (stored, mode) {
            (None, _) => true,
            (Some(stored), PullMode::Incremental) => server_time >= stored,
            (Some(stored), PullMode::Full) => server_time > stored,
        };

        if adopt && stored != Some(server_time) {
            self.store.set(&key, &server_time.to_string()).await?;
            tracing::debug!(%user_id, %group, since = server_time, "cursor advanced");
            return Ok(true);
        }
        Ok(false)
    }

    /// Forget the cursor so the next pull is a full resync.
    pub async fn reset(&self, user_id: &UserId, group: &ModuleGroup) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store.remove(&cursor_key(user_id, group)).await
    }
}
