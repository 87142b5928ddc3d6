//! Multi-context convergence scenarios.
//!
//! Tabs share a store and a channel hub; devices only share the remote.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use notesync::store::{MemoryStore, SqliteStore};
use notesync::sync::{verify_tables, BusMessage, ConvergenceResult, MemoryRemote, PushRow};
use notesync::{BatchSyncCoordinator, FailurePolicy, ManualSync, PullOutcome, RowId, ShellConfig, SyncShell};
use notesync_testkit::{eventually, title, TestFixture};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn title_of(tasks: &BatchSyncCoordinator, id: &str) -> Option<serde_json::Value> {
    tasks
        .state("items")
        .unwrap()
        .get(&RowId::from(id))
        .and_then(|row| row.field("title").cloned())
}

fn all_converged(results: &[(String, ConvergenceResult)]) -> bool {
    results.iter().all(|(_, result)| result.is_converged())
}

#[tokio::test]
async fn tabs_converge_after_pull_signal() {
    init_tracing();
    let fixture = TestFixture::new();
    let store = Arc::new(MemoryStore::new());
    let tab_a = fixture.context(store.clone()).await;
    let tab_b = fixture.context(store).await;

    let tasks_a = tab_a.coordinator("tasks", ["items"]).await.unwrap();
    let tasks_b = tab_b.coordinator("tasks", ["items"]).await.unwrap();

    fixture.clock.advance(10);
    tasks_b
        .upsert("items", "milk".into(), title("milk"), FailurePolicy::KeepOptimistic)
        .await
        .unwrap();
    tab_b.bus().publish(BusMessage::Pull).await.unwrap();

    let reached = eventually(|| tasks_a.rows("items").map(|rows| rows.len() == 1).unwrap_or(false)).await;
    assert!(reached, "tab A never saw tab B's edit");
    assert!(all_converged(&verify_tables(&tasks_a, &tasks_b).unwrap()));
}

#[tokio::test]
async fn devices_converge_through_remote() {
    init_tracing();
    let fixture = TestFixture::new();
    let phone = fixture.device().await;
    let laptop = fixture.device().await;

    let notes_phone = phone.coordinator("notes", ["folders", "notes"]).await.unwrap();
    let notes_laptop = laptop.coordinator("notes", ["folders", "notes"]).await.unwrap();

    fixture.clock.advance(5);
    notes_phone
        .upsert("folders", "inbox".into(), title("Inbox"), FailurePolicy::Rollback)
        .await
        .unwrap();
    fixture.clock.advance(5);
    notes_laptop
        .upsert("notes", "n1".into(), title("first"), FailurePolicy::Rollback)
        .await
        .unwrap();

    // The laptop's own full pull after its push already picked up the
    // folder; the phone has to ask.
    notes_phone.pull(false).await.unwrap();

    assert!(all_converged(&verify_tables(&notes_phone, &notes_laptop).unwrap()));
    assert_eq!(notes_phone.rows("notes").unwrap().len(), 1);
    assert_eq!(notes_laptop.rows("folders").unwrap().len(), 1);
}

#[tokio::test]
async fn late_older_copy_does_not_resurrect_tombstone() {
    let fixture = TestFixture::new();
    let device = fixture.device().await;
    let tasks = device.coordinator("tasks", ["items"]).await.unwrap();

    fixture.remote.insert_raw("items", fixture.row("b", 300, "bread"));
    tasks.pull(false).await.unwrap();
    assert_eq!(tasks.rows("items").unwrap().len(), 1);

    fixture
        .remote
        .insert_raw("items", fixture.row("b", 400, "bread").into_tombstone(400));
    tasks.pull(true).await.unwrap();
    assert!(tasks.rows("items").unwrap().is_empty());

    fixture.remote.insert_raw("items", fixture.row("b", 350, "bread"));
    let outcome = tasks.pull(true).await.unwrap();

    assert_eq!(outcome.report().unwrap().merge.stale, 1);
    assert!(tasks.rows("items").unwrap().is_empty());
    let state = tasks.state("items").unwrap();
    assert!(state.entry(&RowId::from("b")).unwrap().is_tombstone());
}

#[tokio::test]
async fn tabs_editing_one_row_settle_on_latest_push() {
    init_tracing();
    let fixture = TestFixture::new();
    let store = Arc::new(MemoryStore::new());
    let tab_a = fixture.context(store.clone()).await;
    let tab_b = fixture.context(store).await;
    let tasks_a = tab_a.coordinator("tasks", ["items"]).await.unwrap();
    let tasks_b = tab_b.coordinator("tasks", ["items"]).await.unwrap();

    fixture.clock.set(10);
    tasks_a
        .upsert("items", "x".into(), title("from A"), FailurePolicy::Rollback)
        .await
        .unwrap();
    fixture.clock.set(11);
    tasks_b
        .upsert("items", "x".into(), title("from B"), FailurePolicy::Rollback)
        .await
        .unwrap();
    tab_b.bus().publish(BusMessage::Pull).await.unwrap();

    let reached = eventually(|| title_of(&tasks_a, "x") == Some(json!("from B"))).await;
    assert!(reached, "tab A kept its own older edit");
    assert_eq!(title_of(&tasks_b, "x"), Some(json!("from B")));
    assert_eq!(tasks_a.state("items").unwrap().get(&RowId::from("x")).unwrap().updated_at, 11);
    assert!(all_converged(&verify_tables(&tasks_a, &tasks_b).unwrap()));
}

#[tokio::test]
async fn incremental_pull_carries_tombstone() {
    let fixture = TestFixture::new();
    let device = fixture.device().await;
    let tasks = device.coordinator("tasks", ["items"]).await.unwrap();

    fixture.clock.set(300);
    fixture
        .push_as("dev-other", "items", vec![PushRow::upsert("b".into(), title("bread"))])
        .await;
    fixture.clock.set(400);
    tasks.pull(false).await.unwrap();
    assert_eq!(tasks.rows("items").unwrap().len(), 1);

    fixture.clock.set(500);
    fixture
        .push_as("dev-other", "items", vec![PushRow::tombstone("b".into(), 500)])
        .await;
    let outcome = tasks.pull(false).await.unwrap();

    assert_eq!(outcome.report().unwrap().since, 400);
    assert!(tasks.rows("items").unwrap().is_empty());
    let state = tasks.state("items").unwrap();
    let entry = state.entry(&RowId::from("b")).unwrap();
    assert!(entry.is_tombstone());
    assert_eq!(entry.updated_at, 500);
}

#[tokio::test]
async fn concurrent_pulls_share_one_round_trip() {
    let fixture = TestFixture::new();
    let device = fixture.device().await;
    let tasks = device.coordinator("tasks", ["items"]).await.unwrap();
    let before = fixture.remote.pull_count();

    let (first, second) = tokio::join!(tasks.pull(false), tasks.pull(false));
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(fixture.remote.pull_count() - before, 1);
    assert_eq!(outcomes.iter().filter(|o| **o == PullOutcome::Skipped).count(), 1);
}

struct Unreachable;

#[async_trait]
impl ManualSync for Unreachable {
    async fn pull(&self) -> anyhow::Result<()> {
        anyhow::bail!("calendar backend unreachable")
    }

    async fn push(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn one_failing_module_does_not_block_others() {
    let fixture = TestFixture::new();
    let device = fixture.device().await;
    let tasks = device.coordinator("tasks", ["items"]).await.unwrap();
    let _calendar = device.registry().register("calendar", Arc::new(Unreachable));

    fixture
        .push_as("dev-other", "items", vec![PushRow::upsert("eggs".into(), title("eggs"))])
        .await;

    let report = device.sync_now().await;
    assert!(!report.is_success());
    assert!(report.failure("calendar").is_some());
    assert!(report.succeeded.contains(&"tasks".to_string()));
    assert_eq!(tasks.rows("items").unwrap().len(), 1);
}

#[tokio::test]
async fn pulled_document_reaches_other_tab() {
    init_tracing();
    let fixture = TestFixture::new();
    let store = Arc::new(MemoryStore::new());
    let tab_a = fixture.context(store.clone()).await;
    let tab_b = fixture.context(store).await;
    let journal_a = tab_a.document_adapter("journal", ["journal"]);
    let journal_b = tab_b.document_adapter("journal", ["journal"]);

    let other = fixture.device().await;
    let journal_other = other.document_adapter("journal", ["journal"]);
    fixture.clock.advance(100);
    journal_other.save_local("journal", json!({"text": "from phone"})).await.unwrap();
    journal_other.push("journal").await.unwrap();

    journal_a.pull("journal").await.unwrap();

    let reached = eventually(|| {
        journal_b
            .cached("journal")
            .map(|doc| doc.body == json!({"text": "from phone"}))
            .unwrap_or(false)
    })
    .await;
    assert!(reached, "tab B never reloaded the document");
}

#[tokio::test]
async fn reset_signal_clears_other_tab() {
    let fixture = TestFixture::new();
    let store = Arc::new(MemoryStore::new());
    let tab_a = fixture.context(store.clone()).await;
    let tab_b = fixture.context(store).await;
    let tasks_a = tab_a.coordinator("tasks", ["items"]).await.unwrap();
    let tasks_b = tab_b.coordinator("tasks", ["items"]).await.unwrap();

    fixture
        .push_as("dev-other", "items", vec![PushRow::upsert("jam".into(), title("jam"))])
        .await;
    tasks_a.pull(false).await.unwrap();
    tasks_b.pull(false).await.unwrap();
    let revision = tasks_b.revision();

    let report = tab_a.reset_all().await;
    assert!(report.is_success());

    // Tab B drops its state on Reset, then refills it on the following Pull.
    let reached = eventually(|| tasks_b.revision() > revision + 1).await;
    assert!(reached, "tab B never reset");
    assert!(eventually(|| tasks_b.rows("items").map(|r| r.len() == 1).unwrap_or(false)).await);
}

#[tokio::test]
async fn sqlite_shell_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notesync.db");
    let fixture = TestFixture::new();
    let config = ShellConfig {
        auto_poll: false,
        ..ShellConfig::default()
    };

    let open = |remote: Arc<MemoryRemote>| {
        let path = path.clone();
        let config = config.clone();
        let clock = fixture.clock.clone();
        async move {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            SyncShell::builder(store, remote.clone(), remote)
                .config(config)
                .clock(clock)
                .build("user-1")
                .await
                .unwrap()
        }
    };

    let first = open(fixture.remote.clone()).await;
    let device = first.device_id().clone();
    let tasks = first.coordinator("tasks", ["items"]).await.unwrap();
    tasks
        .upsert("items", "tea".into(), title("tea"), FailurePolicy::KeepOptimistic)
        .await
        .unwrap();
    drop(tasks);
    drop(first);

    // The remote is gone; only the replica can answer.
    fixture.remote.set_offline(true);
    let second = open(fixture.remote.clone()).await;
    assert_eq!(second.device_id(), &device);

    let tasks = second
        .attach(second.new_coordinator("tasks", ["items"]))
        .await
        .unwrap();
    let rows = tasks.rows("items").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].field("title"), Some(&json!("tea")));
}
