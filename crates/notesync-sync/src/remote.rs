//! Remote store abstraction.
//!
//! The HTTP layer that reaches the real remote lives outside this crate;
//! it implements [`RemoteSyncClient`] (and [`RemoteDocuments`] for whole
//! document modules). Calls are fire-and-forget from the caller's point of
//! view: a failure comes back as a [`RemoteError`] and is never retried here.

use async_trait::async_trait;

use notesync_core::UserId;

use crate::error::RemoteResult;
use crate::messages::{PullResponse, PushBatch, PushGeneric, UserDocument};

/// Incremental diff pull and batched upsert/tombstone push.
#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    /// Rows of `tables` with `updated_at > since_ms`, tombstones included,
    /// plus the server's current time.
    async fn pull_batch(
        &self,
        user_id: &UserId,
        since_ms: i64,
        tables: &[String],
    ) -> RemoteResult<PullResponse>;

    /// Upsert or tombstone full rows across tables. The remote stamps
    /// `updated_at` with its own clock.
    async fn push_batch(&self, payload: PushBatch) -> RemoteResult<()>;

    /// Upsert or tombstone rows of one table, stamping `updated_at = now`
    /// and `updated_by = device_id`.
    async fn push_generic(&self, request: PushGeneric) -> RemoteResult<()>;
}

/// Whole-document storage for single-document modules.
#[async_trait]
pub trait RemoteDocuments: Send + Sync {
    /// `None` when no document exists yet.
    async fn load_user_doc(&self, user_id: &UserId, key: &str) -> RemoteResult<Option<UserDocument>>;

    /// Replace the document in full.
    async fn save_user_doc(&self, user_id: &UserId, key: &str, doc: UserDocument) -> RemoteResult<()>;
}

/// An in-memory remote for tests and local development.
///
/// Behaves like the real remote: stamps pushes with its own clock, answers
/// pulls by `updated_at > since`, and can be told to fail or to enforce a
/// "single active row" rule on a table.
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};

    use serde_json::Value;

    use notesync_core::{Clock, DeviceId, RowId, SyncRow};

    use crate::error::RemoteError;
    use crate::messages::PushRow;

    type TableKey = (UserId, String);

    #[derive(Default)]
    struct Inner {
        tables: HashMap<TableKey, BTreeMap<RowId, SyncRow>>,
        documents: HashMap<TableKey, UserDocument>,
        /// table -> boolean field at most one live row may set.
        exclusive: HashMap<String, String>,
        offline: bool,
        fail_pulls: usize,
        fail_pushes: usize,
    }

    /// Shared in-memory remote.
    pub struct MemoryRemote {
        clock: Arc<dyn Clock>,
        inner: Mutex<Inner>,
        pulls: AtomicUsize,
        pushes: AtomicUsize,
    }

    impl MemoryRemote {
        /// Create a remote whose server time comes from `clock`.
        pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
            Arc::new(Self {
                clock,
                inner: Mutex::new(Inner::default()),
                pulls: AtomicUsize::new(0),
                pushes: AtomicUsize::new(0),
            })
        }

        fn inner(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Reject every call until switched back on.
        pub fn set_offline(&self, offline: bool) {
            self.inner().offline = offline;
        }

        /// Fail the next `n` pulls with a network error.
        pub fn fail_next_pulls(&self, n: usize) {
            self.inner().fail_pulls = n;
        }

        /// Fail the next `n` pushes with a network error.
        pub fn fail_next_pushes(&self, n: usize) {
            self.inner().fail_pushes = n;
        }

        /// Reject pushes that would leave two live rows of `table` with
        /// `field == true`.
        pub fn require_single_active(&self, table: &str, field: &str) {
            self.inner()
                .exclusive
                .insert(table.to_string(), field.to_string());
        }

        /// Number of `pull_batch` round trips served (or failed).
        pub fn pull_count(&self) -> usize {
            self.pulls.load(Ordering::SeqCst)
        }

        /// Number of push calls received.
        pub fn push_count(&self) -> usize {
            self.pushes.load(Ordering::SeqCst)
        }

        /// Every stored row of a table, tombstones included.
        pub fn rows(&self, user_id: &UserId, table: &str) -> Vec<SyncRow> {
            self.inner()
                .tables
                .get(&(user_id.clone(), table.to_string()))
                .map(|rows| rows.values().cloned().collect())
                .unwrap_or_default()
        }

        /// Store a row exactly as given, bypassing stamping.
        pub fn insert_raw(&self, table: &str, row: SyncRow) {
            self.inner()
                .tables
                .entry((row.user_id.clone(), table.to_string()))
                .or_default()
                .insert(row.id.clone(), row);
        }

        pub fn document(&self, user_id: &UserId, key: &str) -> Option<UserDocument> {
            self.inner()
                .documents
                .get(&(user_id.clone(), key.to_string()))
                .cloned()
        }

        fn check_online(inner: &mut Inner, pushing: bool) -> RemoteResult<()> {
            if inner.offline {
                return Err(RemoteError::Network("remote unreachable".into()));
            }
            let budget = if pushing {
                &mut inner.fail_pushes
            } else {
                &mut inner.fail_pulls
            };
            if *budget > 0 {
                *budget -= 1;
                return Err(RemoteError::Network("injected failure".into()));
            }
            Ok(())
        }

        /// Validate the single-active rule for a set of incoming rows, then
        /// store them all stamped with the current server time.
        fn apply_rows(&self, inner: &mut Inner, user_id: &UserId, table: &str, rows: Vec<SyncRow>) -> RemoteResult<()> {
            let key = (user_id.clone(), table.to_string());

            if let Some(field) = inner.exclusive.get(table) {
                let is_active =
                    |row: &SyncRow| !row.is_tombstone() && row.field(field) == Some(&Value::Bool(true));

                let mut active: BTreeMap<RowId, bool> = inner
                    .tables
                    .get(&key)
                    .map(|stored| {
                        stored
                            .values()
                            .map(|row| (row.id.clone(), is_active(row)))
                            .collect()
                    })
                    .unwrap_or_default();
                for row in &rows {
                    active.insert(row.id.clone(), is_active(row));
                }

                let running: Vec<&RowId> = active
                    .iter()
                    .filter(|(_, on)| **on)
                    .map(|(id, _)| id)
                    .collect();
                if running.len() > 1 {
                    return Err(RemoteError::Conflict(format!(
                        "{} already has an active row ({} requested)",
                        table,
                        running.len()
                    )));
                }
            }

            let now = self.clock.now_millis();
            let stored = inner.tables.entry(key).or_default();
            for mut row in rows {
                row.updated_at = now;
                row.user_id = user_id.clone();
                stored.insert(row.id.clone(), row);
            }
            Ok(())
        }

        fn push_row_to_sync_row(user_id: &UserId, device_id: &DeviceId, row: PushRow) -> SyncRow {
            let base = SyncRow::new(row.id, user_id.clone(), 0, device_id.clone());
            match row.deleted_at {
                Some(at) => base.into_tombstone(at),
                None => base.with_fields(row.fields),
            }
        }
    }

    #[async_trait]
    impl RemoteSyncClient for MemoryRemote {
        async fn pull_batch(
            &self,
            user_id: &UserId,
            since_ms: i64,
            tables: &[String],
        ) -> RemoteResult<PullResponse> {
            // A real round trip always suspends the caller.
            tokio::task::yield_now().await;
            self.pulls.fetch_add(1, Ordering::SeqCst);

            let mut inner = self.inner();
            Self::check_online(&mut inner, false)?;

            let mut diffs = BTreeMap::new();
            for table in tables {
                let rows: Vec<SyncRow> = inner
                    .tables
                    .get(&(user_id.clone(), table.clone()))
                    .map(|stored| {
                        stored
                            .values()
                            .filter(|row| row.updated_at > since_ms)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                diffs.insert(table.clone(), rows);
            }

            Ok(PullResponse {
                diffs,
                server_time_ms: Some(self.clock.now_millis()),
            })
        }

        async fn push_batch(&self, payload: PushBatch) -> RemoteResult<()> {
            tokio::task::yield_now().await;
            self.pushes.fetch_add(1, Ordering::SeqCst);

            let mut inner = self.inner();
            Self::check_online(&mut inner, true)?;

            for (table, rows) in payload {
                let Some(user_id) = rows.first().map(|row| row.user_id.clone()) else {
                    continue;
                };
                self.apply_rows(&mut inner, &user_id, &table, rows)?;
            }
            Ok(())
        }

        async fn push_generic(&self, request: PushGeneric) -> RemoteResult<()> {
            tokio::task::yield_now().await;
            self.pushes.fetch_add(1, Ordering::SeqCst);

            let mut inner = self.inner();
            Self::check_online(&mut inner, true)?;

            let PushGeneric {
                table,
                user_id,
                device_id,
                rows,
            } = request;
            let rows = rows
                .into_iter()
                .map(|row| Self::push_row_to_sync_row(&user_id, &device_id, row))
                .collect();
            self.apply_rows(&mut inner, &user_id, &table, rows)
        }
    }

    #[async_trait]
    impl RemoteDocuments for MemoryRemote {
        async fn load_user_doc(&self, user_id: &UserId, key: &str) -> RemoteResult<Option<UserDocument>> {
            tokio::task::yield_now().await;
            let mut inner = self.inner();
            Self::check_online(&mut inner, false)?;
            Ok(inner
                .documents
                .get(&(user_id.clone(), key.to_string()))
                .cloned())
        }

        async fn save_user_doc(&self, user_id: &UserId, key: &str, doc: UserDocument) -> RemoteResult<()> {
            tokio::task::yield_now().await;
            let mut inner = self.inner();
            Self::check_online(&mut inner, true)?;
            inner
                .documents
                .insert((user_id.clone(), key.to_string()), doc);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryRemote;
    use super::*;
    use crate::error::RemoteError;
    use crate::messages::PushRow;
    use notesync_core::{Fields, ManualClock, SyncRow};
    use serde_json::json;
    use std::sync::Arc;

    fn fields(title: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".into(), json!(title));
        fields
    }

    fn push(table: &str, rows: Vec<PushRow>) -> PushGeneric {
        PushGeneric {
            table: table.into(),
            user_id: "u".into(),
            device_id: "dev-a".into(),
            rows,
        }
    }

    #[tokio::test]
    async fn test_push_is_stamped_with_server_time() {
        let clock = Arc::new(ManualClock::new(1_000));
        let remote = MemoryRemote::new(clock.clone());

        remote
            .push_generic(push("tasks", vec![PushRow::upsert("a".into(), fields("x"))]))
            .await
            .unwrap();

        let rows = remote.rows(&"u".into(), "tasks");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].updated_at, 1_000);
        assert_eq!(rows[0].updated_by.as_str(), "dev-a");
    }

    #[tokio::test]
    async fn test_pull_returns_rows_after_since() {
        let clock = Arc::new(ManualClock::new(100));
        let remote = MemoryRemote::new(clock.clone());

        remote
            .push_generic(push("tasks", vec![PushRow::upsert("old".into(), fields("o"))]))
            .await
            .unwrap();
        clock.set(200);
        remote
            .push_generic(push("tasks", vec![PushRow::tombstone("gone".into(), 200)]))
            .await
            .unwrap();
        clock.set(300);

        let response = remote
            .pull_batch(&"u".into(), 150, &["tasks".to_string(), "other".to_string()])
            .await
            .unwrap();

        assert_eq!(response.server_time_ms, Some(300));
        let rows = &response.diffs["tasks"];
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_tombstone());
        assert!(response.diffs["other"].is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let remote = MemoryRemote::new(Arc::new(ManualClock::new(0)));
        remote.fail_next_pulls(1);

        let err = remote.pull_batch(&"u".into(), 0, &[]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));
        assert!(remote.pull_batch(&"u".into(), 0, &[]).await.is_ok());
        assert_eq!(remote.pull_count(), 2);
    }

    #[tokio::test]
    async fn test_single_active_rule() {
        let remote = MemoryRemote::new(Arc::new(ManualClock::new(10)));
        remote.require_single_active("timers", "running");

        let mut running = Fields::new();
        running.insert("running".into(), json!(true));

        remote
            .push_generic(push("timers", vec![PushRow::upsert("t1".into(), running.clone())]))
            .await
            .unwrap();
        let err = remote
            .push_generic(push("timers", vec![PushRow::upsert("t2".into(), running.clone())]))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Conflict(_)));

        // Restarting the active row itself is fine.
        remote
            .push_generic(push("timers", vec![PushRow::upsert("t1".into(), running)]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_push_batch_keeps_row_provenance() {
        let remote = MemoryRemote::new(Arc::new(ManualClock::new(50)));
        let row = SyncRow::new("a".into(), "u".into(), 1, "dev-b".into()).with_field("title", "x");

        let mut payload = PushBatch::new();
        payload.insert("tasks".into(), vec![row]);
        remote.push_batch(payload).await.unwrap();

        let rows = remote.rows(&"u".into(), "tasks");
        assert_eq!(rows[0].updated_at, 50);
        assert_eq!(rows[0].updated_by.as_str(), "dev-b");
    }
}
