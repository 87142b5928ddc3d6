//! Batch pull/push coordinator for one module group.
//!
//! A coordinator owns the materialized tables of a module group. Pulls fold
//! remote diffs into them through the LWW merge, persist them, and advance
//! the group's cursor. Local edits are applied optimistically first and
//! pushed afterwards; a failed push either keeps the edit pending or undoes
//! it.
//!
//! ```text
//! pull(force_full)
//!   guard ── since = force_full ? 0 : cursor ── pull_batch ── merge/persist
//!         ── advance cursor ── seed defaults (first sync only)
//!
//! mutate(table, mutation, policy)
//!   apply_optimistic ── push_generic ─┬─ ok:  confirm ── full pull
//!                                     └─ err: keep pending | rollback
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use notesync_core::{
    merge, Clock, DeviceId, Fields, MaterializedState, MergeReport, ModuleGroup, RowCodec, RowId,
    SyncRow, UserId,
};
use notesync_store::{CursorTracker, KvStore, LocalReplicaStore, PullMode};

use crate::bus::BusHandler;
use crate::error::{Result, SyncError};
use crate::messages::{PushBatch, PushGeneric, PushRow, TableRows};
use crate::remote::RemoteSyncClient;

/// Tuning for a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Interval between background pulls while mounted.
    pub poll_interval_ms: u64,
    /// Force a full pull after every successful push.
    pub full_pull_after_push: bool,
    /// Maximum rows per push call.
    pub max_batch_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            full_pull_after_push: true,
            max_batch_size: 200,
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }
}

/// Everything a coordinator needs from its surroundings.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub remote: Arc<dyn RemoteSyncClient>,
    pub cursors: CursorTracker<dyn KvStore>,
    pub replicas: LocalReplicaStore<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl CoordinatorContext {
    /// Build a context over one store. Every coordinator created from clones
    /// of this context shares the cursor lock.
    pub fn new(
        store: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteSyncClient>,
        clock: Arc<dyn Clock>,
        user_id: UserId,
        device_id: DeviceId,
    ) -> Self {
        Self {
            remote,
            cursors: CursorTracker::new(Arc::clone(&store)),
            replicas: LocalReplicaStore::new(store),
            clock,
            user_id,
            device_id,
        }
    }
}

/// What the coordinator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Pulling,
    Pushing,
}

/// Counts from one applied pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Cursor the pull started from (0 for a full pull).
    pub since: i64,
    pub merge: MergeReport,
    pub cursor_advanced: bool,
    /// Default rows were pushed because the module was brand new.
    pub seeded: bool,
}

/// Result of [`BatchSyncCoordinator::pull`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Another pull was already in flight.
    Skipped,
    /// The coordinator was unmounted before the response arrived.
    Discarded,
    Applied(PullReport),
}

impl PullOutcome {
    pub fn report(&self) -> Option<&PullReport> {
        match self {
            PullOutcome::Applied(report) => Some(report),
            PullOutcome::Skipped | PullOutcome::Discarded => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, PullOutcome::Applied(_))
    }
}

/// A local edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Create or fully replace a row.
    Upsert { id: RowId, fields: Fields },
    /// Overwrite some fields of a row, keeping the rest (rename, toggle).
    Patch { id: RowId, fields: Fields },
    /// Tombstone a row.
    Delete { id: RowId },
}

impl Mutation {
    pub fn id(&self) -> &RowId {
        match self {
            Mutation::Upsert { id, .. } | Mutation::Patch { id, .. } | Mutation::Delete { id } => id,
        }
    }
}

/// What to do with an optimistic edit whose push failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Keep the edit locally; [`BatchSyncCoordinator::push_pending`] retries it.
    KeepOptimistic,
    /// Undo the edit.
    Rollback,
}

/// Handle to an optimistic edit, consumed by `confirm` or `rollback`.
#[derive(Debug)]
#[must_use = "an optimistic edit must be confirmed or rolled back"]
pub struct UndoToken {
    table: String,
    previous: Option<SyncRow>,
    applied: SyncRow,
}

impl UndoToken {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The row written locally.
    pub fn row(&self) -> &SyncRow {
        &self.applied
    }
}

/// Default rows per table, pushed once when a module starts out empty.
pub type SeedRows = BTreeMap<String, Vec<(RowId, Fields)>>;

type RowKey = (String, RowId);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held while a pull runs. Clears the guard and wakes queued pulls when
/// the pull ends, however it ends.
struct PullGuard<'a> {
    flag: &'a AtomicBool,
    released: &'a Notify,
}

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.released.notify_waiters();
    }
}

const NO_REQUEST: u8 = 0;
const INCREMENTAL_REQUEST: u8 = 1;
const FULL_REQUEST: u8 = 2;

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn to_push_row(row: &SyncRow) -> PushRow {
    match row.deleted_at {
        Some(at) => PushRow::tombstone(row.id.clone(), at),
        None => PushRow::upsert(row.id.clone(), row.fields.clone()),
    }
}

/// Pull/push coordinator for one module group.
pub struct BatchSyncCoordinator {
    ctx: CoordinatorContext,
    group: ModuleGroup,
    tables: Vec<String>,
    config: CoordinatorConfig,
    defaults: SeedRows,

    states: Mutex<BTreeMap<String, MaterializedState>>,
    /// Optimistic rows not yet accepted by the remote.
    pending: Mutex<BTreeMap<RowKey, SyncRow>>,
    /// Rows just pushed, with the pull epoch at the time the remote
    /// accepted them. A pull started after that takes the server copy
    /// regardless of timestamps, since the remote restamped it.
    awaiting_server: Mutex<HashMap<RowKey, u64>>,

    pulling: AtomicBool,
    /// Number of fetches started so far.
    pull_epoch: AtomicU64,
    /// A pull asked for while another was running; the running one
    /// performs it before releasing the guard.
    pull_requested: AtomicU8,
    pull_released: Notify,
    pushes_in_flight: AtomicUsize,
    mounted: AtomicBool,
    generation: AtomicU64,
    revision: watch::Sender<u64>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl BatchSyncCoordinator {
    /// Create an unmounted coordinator for `group` covering `tables`.
    pub fn new<I, T>(
        ctx: CoordinatorContext,
        group: impl Into<ModuleGroup>,
        tables: I,
        config: CoordinatorConfig,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tables: Vec<String> = tables.into_iter().map(Into::into).collect();
        let states = tables
            .iter()
            .map(|table| (table.clone(), MaterializedState::new()))
            .collect();
        let (revision, _) = watch::channel(0);

        Self {
            ctx,
            group: group.into(),
            tables,
            config,
            defaults: SeedRows::new(),
            states: Mutex::new(states),
            pending: Mutex::new(BTreeMap::new()),
            awaiting_server: Mutex::new(HashMap::new()),
            pulling: AtomicBool::new(false),
            pull_epoch: AtomicU64::new(0),
            pull_requested: AtomicU8::new(NO_REQUEST),
            pull_released: Notify::new(),
            pushes_in_flight: AtomicUsize::new(0),
            mounted: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            revision,
            poller: Mutex::new(None),
        }
    }

    /// Rows pushed for `table` the first time the module syncs against an
    /// empty remote.
    pub fn with_defaults(mut self, table: impl Into<String>, rows: Vec<(RowId, Fields)>) -> Self {
        self.defaults.insert(table.into(), rows);
        self
    }

    pub fn group(&self) -> &ModuleGroup {
        &self.group
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn user_id(&self) -> &UserId {
        &self.ctx.user_id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the persisted tables and start accepting pull results.
    pub async fn mount(&self) -> Result<()> {
        self.load_local().await?;
        self.mounted.store(true, Ordering::Release);
        tracing::debug!(group = %self.group, "coordinator mounted");
        Ok(())
    }

    /// Stop polling and discard the results of calls still in flight.
    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(poller) = lock(&self.poller).take() {
            poller.abort();
        }
        tracing::debug!(group = %self.group, "coordinator unmounted");
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.is_mounted() && self.generation.load(Ordering::Acquire) == generation
    }

    /// Replace the in-memory tables with their persisted copies.
    pub async fn load_local(&self) -> Result<()> {
        let mut loaded = BTreeMap::new();
        for table in &self.tables {
            let state = self.ctx.replicas.load(&self.group, table).await?;
            loaded.insert(table.clone(), state);
        }
        *lock(&self.states) = loaded;
        self.bump();
        Ok(())
    }

    /// Run `pull(false)` every poll interval until unmounted.
    pub fn spawn_polling(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.poll_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if !this.is_mounted() {
                    break;
                }
                if let Err(e) = this.pull(false).await {
                    tracing::warn!(group = %this.group, error = %e, "poll failed");
                }
            }
        });

        if let Some(previous) = lock(&self.poller).replace(handle) {
            previous.abort();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn phase(&self) -> SyncPhase {
        if self.pulling.load(Ordering::Acquire) {
            SyncPhase::Pulling
        } else if self.pushes_in_flight.load(Ordering::Acquire) > 0 {
            SyncPhase::Pushing
        } else {
            SyncPhase::Idle
        }
    }

    /// Receiver that changes whenever a materialized table changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn check_table(&self, table: &str) -> Result<()> {
        if self.tables.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(SyncError::UnknownTable(table.to_string()))
        }
    }

    /// Snapshot of a table, tombstones included.
    pub fn state(&self, table: &str) -> Result<MaterializedState> {
        self.check_table(table)?;
        Ok(lock(&self.states).get(table).cloned().unwrap_or_default())
    }

    /// Live rows of a table in id order.
    pub fn rows(&self, table: &str) -> Result<Vec<SyncRow>> {
        Ok(self.state(table)?.live_rows().cloned().collect())
    }

    /// Decode the live rows of a table with `codec`.
    pub fn records<C: RowCodec>(&self, codec: &C, table: &str) -> Result<Vec<C::Record>> {
        let state = self.state(table)?;
        Ok(codec.decode_state(&state)?)
    }

    /// Number of optimistic edits still waiting for a successful push.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pull
    // ─────────────────────────────────────────────────────────────────────────

    /// Pull remote changes into the local tables.
    ///
    /// At most one pull runs at a time; a concurrent call returns
    /// [`PullOutcome::Skipped`] without touching the network. Pulls asked
    /// for with [`request_pull`](Self::request_pull) while one runs are
    /// performed by the running pull before it returns.
    pub async fn pull(&self, force_full: bool) -> Result<PullOutcome> {
        let mut mode = PullMode::from_force_full(force_full);
        let mut outcome = PullOutcome::Skipped;

        loop {
            let Some(_guard) = self.try_enter_pull() else {
                if outcome == PullOutcome::Skipped {
                    tracing::debug!(group = %self.group, "pull already in flight, skipped");
                }
                return Ok(outcome);
            };

            loop {
                if self.take_pull_request() == Some(PullMode::Full) {
                    mode = PullMode::Full;
                }
                outcome = self.pull_once(mode).await?;
                if !outcome.is_applied() || !self.has_pull_request() {
                    break;
                }
                tracing::debug!(group = %self.group, "pull requested while pulling, running again");
                mode = PullMode::Incremental;
            }

            drop(_guard);
            // A request made between the last check and the release found
            // the guard still held.
            if !outcome.is_applied() || !self.has_pull_request() {
                return Ok(outcome);
            }
            mode = PullMode::Incremental;
        }
    }

    /// Like [`pull`](Self::pull), but waits for a pull in flight to finish
    /// and then runs its own instead of skipping.
    pub async fn pull_queued(&self, force_full: bool) -> Result<PullOutcome> {
        loop {
            let mut released = std::pin::pin!(self.pull_released.notified());
            released.as_mut().enable();
            match self.pull(force_full).await? {
                PullOutcome::Skipped => released.await,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Ask for a pull. Runs it now if no pull is in flight; otherwise the
    /// pull in flight runs it once more (as a full pull if `force_full`)
    /// before finishing.
    pub async fn request_pull(&self, force_full: bool) -> Result<PullOutcome> {
        let request = if force_full { FULL_REQUEST } else { INCREMENTAL_REQUEST };
        self.pull_requested.fetch_max(request, Ordering::SeqCst);
        self.pull(force_full).await
    }

    fn try_enter_pull(&self) -> Option<PullGuard<'_>> {
        self.pulling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(PullGuard {
            flag: &self.pulling,
            released: &self.pull_released,
        })
    }

    fn take_pull_request(&self) -> Option<PullMode> {
        match self.pull_requested.swap(NO_REQUEST, Ordering::SeqCst) {
            NO_REQUEST => None,
            FULL_REQUEST => Some(PullMode::Full),
            _ => Some(PullMode::Incremental),
        }
    }

    fn has_pull_request(&self) -> bool {
        self.pull_requested.load(Ordering::SeqCst) != NO_REQUEST
    }

    /// One guarded fetch, plus seeding on a first full sync.
    async fn pull_once(&self, mode: PullMode) -> Result<PullOutcome> {
        let Some(mut report) = self.fetch(mode).await? else {
            return Ok(PullOutcome::Discarded);
        };

        if report.since == 0 && !self.defaults.is_empty() {
            report.seeded = self.seed_blank(&self.defaults).await?;
        }

        Ok(PullOutcome::Applied(report))
    }

    /// One round trip: pull, merge, persist, advance. `None` when the
    /// result was discarded after an unmount.
    async fn fetch(&self, mode: PullMode) -> Result<Option<PullReport>> {
        let ctx = &self.ctx;
        let generation = self.generation.load(Ordering::Acquire);
        let epoch = self.pull_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // The cursor may have been advanced by another context sharing the
        // store; take its persisted rows first so none are skipped.
        self.absorb_persisted().await?;

        let since = match mode {
            PullMode::Full => 0,
            PullMode::Incremental => ctx.cursors.read(&ctx.user_id, &self.group).await?,
        };

        let response = ctx
            .remote
            .pull_batch(&ctx.user_id, since, &self.tables)
            .await
            .map_err(|e| {
                tracing::warn!(group = %self.group, since, error = %e, "pull failed");
                e
            })?;

        if !self.is_current(generation) {
            tracing::debug!(group = %self.group, "coordinator unmounted, pull result discarded");
            return Ok(None);
        }

        let mut report = PullReport {
            since,
            ..PullReport::default()
        };
        let changed = self.apply_remote(response.diffs, epoch, &mut report.merge);
        for (table, snapshot) in &changed {
            ctx.replicas.save(&self.group, table, snapshot).await?;
        }

        report.cursor_advanced = ctx
            .cursors
            .advance(&ctx.user_id, &self.group, response.server_time_ms, mode)
            .await?;

        if !changed.is_empty() {
            self.bump();
        }

        tracing::debug!(
            group = %self.group,
            since,
            applied = report.merge.applied,
            removed = report.merge.removed,
            stale = report.merge.stale,
            "pull applied"
        );
        Ok(Some(report))
    }

    /// Merge the persisted copy of every table into memory.
    async fn absorb_persisted(&self) -> Result<()> {
        let mut loaded = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            loaded.push((table, self.ctx.replicas.load(&self.group, table).await?));
        }

        let mut changed = false;
        {
            let mut states = lock(&self.states);
            for (table, persisted) in loaded {
                let state = states.entry(table.clone()).or_default();
                let differing: Vec<SyncRow> = persisted
                    .entries()
                    .filter(|row| state.entry(&row.id) != Some(*row))
                    .cloned()
                    .collect();
                changed |= merge(state, differing).changed();
            }
        }

        if changed {
            self.bump();
        }
        Ok(())
    }

    /// Merge pulled diffs from the fetch numbered `epoch`, returning
    /// snapshots of the tables that changed.
    ///
    /// A row awaiting its server copy skips the timestamp comparison only
    /// when the fetch started after the push was accepted. An older fetch
    /// may carry the copy from before the push, which must lose to the
    /// local edit like any stale row.
    fn apply_remote(
        &self,
        diffs: TableRows,
        epoch: u64,
        report: &mut MergeReport,
    ) -> Vec<(String, MaterializedState)> {
        let mut states = lock(&self.states);
        let mut awaiting = lock(&self.awaiting_server);
        let mut changed = Vec::new();

        for (table, rows) in diffs {
            if !self.tables.contains(&table) {
                tracing::debug!(group = %self.group, %table, "ignoring diff for foreign table");
                continue;
            }
            let state = states.entry(table.clone()).or_default();

            let mut table_report = MergeReport::default();
            let mut contested = Vec::with_capacity(rows.len());
            for row in rows {
                let key = (table.clone(), row.id.clone());
                let after_push = awaiting.get(&key).is_some_and(|pushed_at| epoch > *pushed_at);
                if after_push {
                    awaiting.remove(&key);
                    if row.is_tombstone() {
                        table_report.removed += 1;
                    } else {
                        table_report.applied += 1;
                    }
                    state.replace(row);
                } else {
                    contested.push(row);
                }
            }
            table_report.absorb(merge(state, contested));

            if table_report.changed() {
                changed.push((table, state.clone()));
            }
            report.absorb(table_report);
        }

        changed
    }

    /// Full pull, then push `defaults` into every table that is still
    /// empty and pull once more. Takes the pull guard like [`pull`](Self::pull):
    /// returns [`PullOutcome::Skipped`] while another pull is in flight.
    /// `seeded` in the report tells whether anything was pushed.
    pub async fn seed_if_empty(&self, defaults: &SeedRows) -> Result<PullOutcome> {
        let Some(_guard) = self.try_enter_pull() else {
            tracing::debug!(group = %self.group, "pull already in flight, seeding skipped");
            return Ok(PullOutcome::Skipped);
        };

        let Some(mut report) = self.fetch(PullMode::Full).await? else {
            return Ok(PullOutcome::Discarded);
        };
        report.seeded = self.seed_blank(defaults).await?;
        Ok(PullOutcome::Applied(report))
    }

    async fn seed_blank(&self, defaults: &SeedRows) -> Result<bool> {
        let targets: Vec<(&String, &Vec<(RowId, Fields)>)> = {
            let states = lock(&self.states);
            defaults
                .iter()
                .filter(|(table, rows)| {
                    !rows.is_empty()
                        && self.tables.contains(*table)
                        && states.get(*table).map_or(true, MaterializedState::is_blank)
                })
                .collect()
        };
        if targets.is_empty() {
            return Ok(false);
        }

        for (table, rows) in targets {
            let rows: Vec<PushRow> = rows
                .iter()
                .map(|(id, fields)| PushRow::upsert(id.clone(), fields.clone()))
                .collect();
            let count = rows.len();
            self.send_generic(table, rows).await?;
            tracing::info!(group = %self.group, %table, count, "seeded default rows");
        }

        self.fetch(PullMode::Full).await?;
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Optimistic mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply an edit locally, before any network call.
    pub async fn apply_optimistic(&self, table: &str, mutation: Mutation) -> Result<UndoToken> {
        self.check_table(table)?;
        let now = self.ctx.clock.now_millis();

        let (token, snapshot) = {
            let mut states = lock(&self.states);
            let state = states.entry(table.to_string()).or_default();
            let row = self.build_row(table, state, mutation, now)?;
            let previous = state.replace(row.clone());
            lock(&self.pending).insert((table.to_string(), row.id.clone()), row.clone());

            let token = UndoToken {
                table: table.to_string(),
                previous,
                applied: row,
            };
            (token, state.clone())
        };

        if let Err(e) = self.ctx.replicas.save(&self.group, table, &snapshot).await {
            self.restore_entry(&token);
            return Err(e.into());
        }
        self.bump();
        Ok(token)
    }

    fn build_row(&self, table: &str, state: &MaterializedState, mutation: Mutation, now: i64) -> Result<SyncRow> {
        let id = mutation.id().clone();
        // Never stamp an edit older than the row it replaces.
        let updated_at = state
            .entry(&id)
            .map_or(now, |existing| now.max(existing.updated_at));
        let base = SyncRow::new(id, self.ctx.user_id.clone(), updated_at, self.ctx.device_id.clone());

        let row = match mutation {
            Mutation::Upsert { fields, .. } => base.with_fields(fields),
            Mutation::Patch { id, fields } => {
                // A patch only edits a live row; an absent id is a create.
                if state.entry(&id).is_some_and(SyncRow::is_tombstone) {
                    return Err(SyncError::RowDeleted {
                        table: table.to_string(),
                        id: id.to_string(),
                    });
                }
                let mut merged = state.get(&id).map(|row| row.fields.clone()).unwrap_or_default();
                merged.extend(fields);
                base.with_fields(merged)
            }
            Mutation::Delete { .. } => base.into_tombstone(updated_at),
        };
        Ok(row)
    }

    /// The remote accepted the edit.
    pub fn confirm(&self, token: UndoToken) {
        let key = (token.table, token.applied.id.clone());
        {
            let mut pending = lock(&self.pending);
            if pending.get(&key) == Some(&token.applied) {
                pending.remove(&key);
            }
        }
        let epoch = self.pull_epoch.load(Ordering::SeqCst);
        lock(&self.awaiting_server).insert(key, epoch);
    }

    /// Undo the edit, unless a newer row has replaced it since.
    pub async fn rollback(&self, token: UndoToken) -> Result<()> {
        let Some(snapshot) = self.restore_entry(&token) else {
            return Ok(());
        };
        self.ctx
            .replicas
            .save(&self.group, &token.table, &snapshot)
            .await?;
        self.bump();
        tracing::warn!(group = %self.group, table = %token.table, id = %token.applied.id, "optimistic edit rolled back");
        Ok(())
    }

    fn restore_entry(&self, token: &UndoToken) -> Option<MaterializedState> {
        let mut states = lock(&self.states);
        {
            let key = (token.table.clone(), token.applied.id.clone());
            let mut pending = lock(&self.pending);
            if pending.get(&key) == Some(&token.applied) {
                pending.remove(&key);
            }
        }

        let state = states.get_mut(&token.table)?;
        if state.entry(&token.applied.id) != Some(&token.applied) {
            return None;
        }
        state.restore(&token.applied.id, token.previous.clone());
        Some(state.clone())
    }

    /// Optimistic apply, push, then confirm or handle the failure per
    /// `policy`. The push error is returned either way.
    pub async fn mutate(&self, table: &str, mutation: Mutation, policy: FailurePolicy) -> Result<()> {
        let token = self.apply_optimistic(table, mutation).await?;

        match self.push_rows(table, vec![token.row().clone()]).await {
            Ok(()) => {
                self.confirm(token);
                self.after_push().await
            }
            Err(e) => {
                tracing::warn!(group = %self.group, %table, error = %e, ?policy, "push failed");
                match policy {
                    FailurePolicy::KeepOptimistic => drop(token),
                    FailurePolicy::Rollback => self.rollback(token).await?,
                }
                Err(e)
            }
        }
    }

    pub async fn upsert(&self, table: &str, id: RowId, fields: Fields, policy: FailurePolicy) -> Result<()> {
        self.mutate(table, Mutation::Upsert { id, fields }, policy).await
    }

    /// Create a row under a fresh id.
    pub async fn create(&self, table: &str, fields: Fields, policy: FailurePolicy) -> Result<RowId> {
        let id = RowId::random();
        self.upsert(table, id.clone(), fields, policy).await?;
        Ok(id)
    }

    pub async fn delete(&self, table: &str, id: RowId, policy: FailurePolicy) -> Result<()> {
        self.mutate(table, Mutation::Delete { id }, policy).await
    }

    /// Encode `record` with `codec` and upsert it.
    pub async fn upsert_record<C: RowCodec>(
        &self,
        codec: &C,
        table: &str,
        id: RowId,
        record: &C::Record,
        policy: FailurePolicy,
    ) -> Result<()> {
        let fields = codec.encode(record)?;
        self.upsert(table, id, fields, policy).await
    }

    /// Start `id` in a table where at most one row may have
    /// `active_field == true`.
    ///
    /// When the remote reports a conflict, every other active row is
    /// stopped and the start is retried once. If that fails too, the local
    /// start is undone and [`SyncError::CompensationFailed`] is returned.
    pub async fn start_exclusive(
        &self,
        table: &str,
        id: RowId,
        mut fields: Fields,
        active_field: &str,
    ) -> Result<()> {
        fields.insert(active_field.to_string(), Value::Bool(true));
        let mutation = Mutation::Upsert {
            id: id.clone(),
            fields,
        };

        let token = self.apply_optimistic(table, mutation.clone()).await?;
        let start = token.row().clone();

        match self.push_rows(table, vec![start.clone()]).await {
            Ok(()) => {
                self.confirm(token);
                return self.after_push().await;
            }
            Err(e) if e.is_conflict() => {
                tracing::info!(group = %self.group, %table, %id, "start conflicted, stopping other active rows");
            }
            Err(e) => {
                self.rollback(token).await?;
                return Err(e);
            }
        }

        let stopped = self.stop_other_active(table, &id, active_field).await;
        self.rollback(token).await?;

        let stopped = match stopped {
            Ok(stopped) => stopped,
            Err(e) => {
                tracing::warn!(group = %self.group, %table, error = %e, "compensation failed");
                return Err(SyncError::CompensationFailed {
                    reason: e.to_string(),
                });
            }
        };

        if let Err(e) = self.push_rows(table, vec![start]).await {
            tracing::warn!(group = %self.group, %table, error = %e, "start retry failed");
            return Err(SyncError::CompensationFailed {
                reason: e.to_string(),
            });
        }

        let token = self.apply_optimistic(table, mutation).await?;
        self.confirm(token);
        tracing::info!(group = %self.group, %table, %id, stopped, "start retried after compensation");
        self.after_push().await
    }

    /// Push a stop for every active row of `table` except `keep`.
    async fn stop_other_active(&self, table: &str, keep: &RowId, active_field: &str) -> Result<usize> {
        let mut response = self
            .ctx
            .remote
            .pull_batch(&self.ctx.user_id, 0, &[table.to_string()])
            .await?;

        let active = Value::Bool(true);
        let stops: Vec<SyncRow> = response
            .diffs
            .remove(table)
            .unwrap_or_default()
            .into_iter()
            .filter(|row| !row.is_tombstone() && row.id != *keep && row.field(active_field) == Some(&active))
            .map(|mut row| {
                row.fields.insert(active_field.to_string(), Value::Bool(false));
                row
            })
            .collect();

        let count = stops.len();
        if count > 0 {
            self.push_rows(table, stops).await?;
        }
        Ok(count)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Push
    // ─────────────────────────────────────────────────────────────────────────

    async fn push_rows(&self, table: &str, rows: Vec<SyncRow>) -> Result<()> {
        let rows: Vec<PushRow> = rows.iter().map(to_push_row).collect();
        self.send_generic(table, rows).await
    }

    async fn send_generic(&self, table: &str, rows: Vec<PushRow>) -> Result<()> {
        let _in_flight = InFlight::enter(&self.pushes_in_flight);
        for chunk in rows.chunks(self.config.batch_size()) {
            let request = PushGeneric {
                table: table.to_string(),
                user_id: self.ctx.user_id.clone(),
                device_id: self.ctx.device_id.clone(),
                rows: chunk.to_vec(),
            };
            self.ctx.remote.push_generic(request).await?;
        }
        Ok(())
    }

    /// Full pull after an accepted push. With a pull already in flight
    /// the full pull is handed to it instead of being skipped.
    async fn after_push(&self) -> Result<()> {
        if self.config.full_pull_after_push {
            self.request_pull(true).await?;
        }
        Ok(())
    }

    /// Push every optimistic edit still pending, then pull. Returns the
    /// number of rows pushed.
    pub async fn push_pending(&self) -> Result<usize> {
        let mut batches: BTreeMap<String, Vec<SyncRow>> = BTreeMap::new();
        {
            let states = lock(&self.states);
            let mut pending = lock(&self.pending);
            // Drop edits a newer pulled row has already replaced.
            pending.retain(|(table, id), row| {
                states.get(table).and_then(|state| state.entry(id)) == Some(row)
            });
            for ((table, _), row) in pending.iter() {
                batches.entry(table.clone()).or_default().push(row.clone());
            }
        }
        if batches.is_empty() {
            return Ok(0);
        }

        let _in_flight = InFlight::enter(&self.pushes_in_flight);
        let mut pushed = 0;
        for (table, rows) in &batches {
            for chunk in rows.chunks(self.config.batch_size()) {
                let mut payload = PushBatch::new();
                payload.insert(table.clone(), chunk.to_vec());
                self.ctx.remote.push_batch(payload).await.map_err(|e| {
                    tracing::warn!(group = %self.group, %table, error = %e, "pending push failed");
                    e
                })?;

                let epoch = self.pull_epoch.load(Ordering::SeqCst);
                let mut pending = lock(&self.pending);
                let mut awaiting = lock(&self.awaiting_server);
                for row in chunk {
                    let key = (table.clone(), row.id.clone());
                    if pending.get(&key) == Some(row) {
                        pending.remove(&key);
                    }
                    awaiting.insert(key, epoch);
                }
                pushed += chunk.len();
            }
        }

        tracing::info!(group = %self.group, pushed, "pending edits pushed");
        self.after_push().await?;
        Ok(pushed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reset
    // ─────────────────────────────────────────────────────────────────────────

    /// Forget the cursor and every local table, then pull everything.
    pub async fn reset(&self) -> Result<PullOutcome> {
        self.reset_local().await?;
        self.pull(true).await
    }

    /// Forget the cursor and every local table without pulling.
    pub async fn reset_local(&self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.cursors.reset(&ctx.user_id, &self.group).await?;
        for table in &self.tables {
            ctx.replicas.clear(&self.group, table).await?;
        }

        {
            let mut states = lock(&self.states);
            for state in states.values_mut() {
                *state = MaterializedState::new();
            }
            lock(&self.pending).clear();
            lock(&self.awaiting_server).clear();
        }
        self.bump();
        tracing::info!(group = %self.group, "local state reset");
        Ok(())
    }
}

impl Drop for BatchSyncCoordinator {
    fn drop(&mut self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.abort();
        }
    }
}

#[async_trait]
impl BusHandler for BatchSyncCoordinator {
    async fn on_pull(&self) {
        if let Err(e) = self.request_pull(false).await {
            tracing::warn!(group = %self.group, error = %e, "bus pull failed");
        }
    }

    async fn on_push(&self) {
        if let Err(e) = self.push_pending().await {
            tracing::warn!(group = %self.group, error = %e, "bus push failed");
        }
    }

    async fn on_reset(&self) {
        if let Err(e) = self.reset_local().await {
            tracing::warn!(group = %self.group, error = %e, "bus reset failed");
        }
    }
}
