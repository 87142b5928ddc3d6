//! # Notesync Sync
//!
//! Reconciles local replicas with the remote store and keeps the contexts
//! of one profile (tabs, windows, embedded widgets) in step.
//!
//! ## Overview
//!
//! - [`RemoteSyncClient`] - Diff pull and batched push against the remote
//! - [`BatchSyncCoordinator`] - Per module group pull/merge/persist loop and
//!   two-phase optimistic writes
//! - [`CrossContextBus`] - `Pull` / `Push` / `Reset` signals between contexts
//! - [`state_digest`] - Cheap convergence checks between replicas
//!
//! ## Key Properties
//!
//! - **Monotonic**: a group's cursor never moves backwards
//! - **Single flight**: overlapping pulls on one coordinator collapse into one
//! - **Optimistic**: local edits are visible before the network answers
//! - **Convergent**: replicas folding the same rows agree, in any order
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use notesync_core::SystemClock;
//! use notesync_store::MemoryStore;
//! use notesync_sync::{BatchSyncCoordinator, CoordinatorConfig, CoordinatorContext, MemoryRemote};
//!
//! async fn example() {
//!     let clock = Arc::new(SystemClock);
//!     let remote = MemoryRemote::new(clock.clone());
//!     let store = Arc::new(MemoryStore::new());
//!     let ctx = CoordinatorContext::new(store, remote, clock, "user-1".into(), "device-1".into());
//!
//!     let tasks = Arc::new(BatchSyncCoordinator::new(
//!         ctx,
//!         "tasks",
//!         ["task_lists", "task_items"],
//!         CoordinatorConfig::default(),
//!     ));
//!     tasks.mount().await.unwrap();
//!     tasks.spawn_polling();
//!     tasks.pull(false).await.unwrap();
//! }
//! ```
//!
//! ## Pull Flow
//!
//! ```text
//! Coordinator                          Remote
//!   |-- pull_batch(since, tables) ------>|
//!   |<------- diffs, server_time --------|
//!   |  merge -> persist -> advance cursor
//!   |-- push_generic(rows) ------------->|   (after a local edit)
//!   |-- pull_batch(0, tables) ---------->|   (full pull after push)
//! ```

pub mod bus;
pub mod convergence;
pub mod coordinator;
pub mod error;
pub mod messages;
pub mod remote;

pub use bus::{
    dispatch, BusConfig, BusHandler, ChannelHub, ContextId, CrossContextBus, Envelope, Listener,
    Subscription, SIGNAL_KEY,
};
pub use convergence::{state_digest, verify_convergence, verify_tables, ConvergenceResult, StateDigest};
pub use coordinator::{
    BatchSyncCoordinator, CoordinatorConfig, CoordinatorContext, FailurePolicy, Mutation,
    PullOutcome, PullReport, SeedRows, SyncPhase, UndoToken,
};
pub use error::{RemoteError, RemoteResult, Result, SyncError};
pub use messages::{BusMessage, PullResponse, PushBatch, PushGeneric, PushRow, TableRows, UserDocument};
pub use remote::{memory::MemoryRemote, RemoteDocuments, RemoteSyncClient};
