//! Test fixtures and helpers.
//!
//! A [`TestFixture`] is one "world": a remote, a server clock and the
//! broadcast channels of one process. Tabs and devices are shells built on
//! top of it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use notesync::{ShellConfig, SyncShell};
use notesync_core::{Fields, ManualClock, SyncRow, UserId};
use notesync_store::MemoryStore;
use notesync_sync::{ChannelHub, MemoryRemote, PushGeneric, PushRow, RemoteSyncClient};

/// Shared remote, clock and channels.
pub struct TestFixture {
    pub clock: Arc<ManualClock>,
    pub remote: Arc<MemoryRemote>,
    pub hub: ChannelHub,
    pub user_id: UserId,
}

impl TestFixture {
    /// Server time starts at 1000 ms.
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(1_000));
        Self {
            remote: MemoryRemote::new(clock.clone()),
            clock,
            hub: ChannelHub::new(),
            user_id: UserId::from("user-1"),
        }
    }

    /// Config for tests: no background polling.
    pub fn config() -> ShellConfig {
        ShellConfig {
            auto_poll: false,
            ..ShellConfig::default()
        }
    }

    /// A context over `store`. Tabs of one profile share a store; separate
    /// devices each get their own.
    pub async fn context(&self, store: Arc<MemoryStore>) -> SyncShell {
        SyncShell::builder(store, self.remote.clone(), self.remote.clone())
            .config(Self::config())
            .clock(self.clock.clone())
            .channel_hub(self.hub.clone())
            .build(self.user_id.clone())
            .await
            .expect("shell")
    }

    /// A context with a store of its own.
    pub async fn device(&self) -> SyncShell {
        self.context(Arc::new(MemoryStore::new())).await
    }

    /// Write rows to the remote as another device would, at the current
    /// server time.
    pub async fn push_as(&self, device: &str, table: &str, rows: Vec<PushRow>) {
        self.remote
            .push_generic(PushGeneric {
                table: table.to_string(),
                user_id: self.user_id.clone(),
                device_id: device.into(),
                rows,
            })
            .await
            .expect("push");
    }

    /// A remote row with a fixed timestamp.
    pub fn row(&self, id: &str, updated_at: i64, title: &str) -> SyncRow {
        SyncRow::new(id.into(), self.user_id.clone(), updated_at, "dev-remote".into())
            .with_field("title", title)
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Build module fields from pairs.
pub fn fields<'a>(pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Fields {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// `{"title": title}`.
pub fn title(title: &str) -> Fields {
    fields([("title", Value::from(title))])
}

/// Wait up to two seconds for `check` to hold. Bus delivery runs on
/// spawned tasks, so assertions on its effects have to poll.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_devices_get_distinct_ids() {
        let fixture = TestFixture::new();
        let a = fixture.device().await;
        let b = fixture.device().await;
        assert_ne!(a.device_id(), b.device_id());
    }

    #[tokio::test]
    async fn test_tabs_share_device_id() {
        let fixture = TestFixture::new();
        let store = Arc::new(MemoryStore::new());
        let a = fixture.context(store.clone()).await;
        let b = fixture.context(store).await;
        assert_eq!(a.device_id(), b.device_id());
    }

    #[tokio::test]
    async fn test_push_as_uses_server_time() {
        let fixture = TestFixture::new();
        fixture.clock.set(4_000);
        fixture
            .push_as("dev-b", "items", vec![PushRow::upsert("a".into(), title("x"))])
            .await;

        let rows = fixture.remote.rows(&fixture.user_id, "items");
        assert_eq!(rows[0].updated_at, 4_000);
        assert_eq!(rows[0].field("title"), Some(&json!("x")));
    }
}
