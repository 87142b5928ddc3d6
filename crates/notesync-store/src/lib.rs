//! # Notesync Store
//!
//! Durable client storage for Notesync. Everything the sync layer persists
//! (device identity, pull cursors, materialized tables, cross-context
//! signals) goes through the [`KvStore`] trait, one whole value per key.
//!
//! ## Key Types
//!
//! - [`KvStore`] - Async string key-value interface with a change feed
//! - [`SqliteStore`] - SQLite-backed persistent store
//! - [`MemoryStore`] - In-memory store for tests and ephemeral contexts
//! - [`CursorTracker`] - Per (user, module group) pull watermark
//! - [`LocalReplicaStore`] - Persists a module's materialized tables
//! - [`DeviceIdentity`] - Generate-once device id
//!
//! ## Usage
//!
//! ```rust,no_run
//! use notesync_store::{CursorTracker, PullMode, SqliteStore};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let store = Arc::new(SqliteStore::open("notesync.db").unwrap());
//!     let cursors = CursorTracker::new(store);
//!
//!     let since = cursors.read(&"user-1".into(), &"tasks".into()).await.unwrap();
//!     // ... pull rows updated after `since` ...
//!     cursors
//!         .advance(&"user-1".into(), &"tasks".into(), Some(since + 10), PullMode::Incremental)
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Whole-key writes**: every write replaces a key; nothing appends
//! - **Parse failures are not fatal**: corrupt values fall back to defaults
//! - **Monotonic cursors**: a cursor never moves backwards

pub mod cursor;
pub mod device;
pub mod error;
pub mod memory;
pub mod migration;
pub mod replica;
pub mod sqlite;
pub mod traits;

pub use cursor::{cursor_key, CursorTracker, PullMode};
pub use device::{DeviceIdentity, DEVICE_ID_KEY};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use replica::{replica_key, LocalReplicaStore};
pub use sqlite::SqliteStore;
pub use traits::{KvStore, StorageEvent, StoreExt};
