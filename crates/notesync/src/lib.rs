//! # Notesync
//!
//! Offline-first synchronization for a suite of note-taking modules (task
//! lists, logs, folders of notes, trackers). Every module keeps its data in
//! a local replica, edits it with no network round trip, and converges with
//! the remote store and with the other tabs of the profile using nothing but
//! per-row timestamps.
//!
//! ## Overview
//!
//! - **Rows**: tables of [`SyncRow`]s merged last-write-wins, tombstones kept
//! - **Coordinators**: one [`BatchSyncCoordinator`] per module group pulls,
//!   merges, persists and pushes
//! - **Documents**: [`DocumentSyncAdapter`] syncs whole JSON documents on
//!   explicit pull/push
//! - **Manual sync**: [`ManualSyncRegistry`] runs every module's pull and push
//!   for a "sync now" action
//! - **Contexts**: [`CrossContextBus`](sync::CrossContextBus) tells other tabs
//!   to pull, push or reset
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use notesync::{FailurePolicy, ShellConfig, SyncShell};
//! use notesync::store::SqliteStore;
//! use notesync::sync::MemoryRemote;
//! use notesync::core::{Fields, SystemClock};
//!
//! async fn example() {
//!     let store = Arc::new(SqliteStore::open("notesync.db").unwrap());
//!     let remote = MemoryRemote::new(Arc::new(SystemClock));
//!
//!     let shell = SyncShell::builder(store, remote.clone(), remote)
//!         .config(ShellConfig::default())
//!         .build("user-1")
//!         .await
//!         .unwrap();
//!
//!     let tasks = shell.coordinator("tasks", ["task_lists", "task_items"]).await.unwrap();
//!     let mut fields = Fields::new();
//!     fields.insert("title".into(), "Groceries".into());
//!     tasks.create("task_lists", fields, FailurePolicy::KeepOptimistic).await.unwrap();
//!
//!     let report = shell.sync_now().await;
//!     assert!(report.is_success());
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `notesync::core` - Rows, codecs and the merge
//! - `notesync::store` - Key-value storage, cursors, replicas
//! - `notesync::sync` - Remote client, coordinator, bus

pub mod config;
pub mod document;
pub mod error;
pub mod registry;
pub mod shell;

pub use notesync_core as core;
pub use notesync_store as store;
pub use notesync_sync as sync;

pub use config::ShellConfig;
pub use document::{doc_key, DocumentPull, DocumentSyncAdapter};
pub use error::{NotesyncError, Result};
pub use registry::{ManualSync, ManualSyncRegistry, Registration, SyncNowReport};
pub use shell::{SyncShell, SyncShellBuilder};

pub use notesync_core::{Fields, JsonCodec, MaterializedState, RowCodec, RowId, SyncRow};
pub use notesync_sync::{BatchSyncCoordinator, FailurePolicy, Mutation, PullOutcome};
