//! # Notesync Testkit
//!
//! Testing utilities for Notesync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a shared remote, server clock and channel hub, with
//!   helpers to open tabs (contexts sharing a store) and devices
//! - **Generators**: Proptest strategies for rows and batches
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use notesync::store::MemoryStore;
//! use notesync_testkit::fixtures::{title, TestFixture};
//! use notesync::FailurePolicy;
//!
//! # async fn example() {
//! let fixture = TestFixture::new();
//! let store = Arc::new(MemoryStore::new());
//! let tab_a = fixture.context(store.clone()).await;
//! let tab_b = fixture.context(store).await;
//!
//! let tasks = tab_b.coordinator("tasks", ["items"]).await.unwrap();
//! tasks.create("items", title("milk"), FailurePolicy::KeepOptimistic).await.unwrap();
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use notesync_core::MaterializedState;
//! use notesync_testkit::generators::shuffled_batch;
//!
//! proptest! {
//!     #[test]
//!     fn order_does_not_matter((rows, shuffled) in shuffled_batch(16)) {
//!         prop_assert_eq!(
//!             MaterializedState::from_rows(rows),
//!             MaterializedState::from_rows(shuffled),
//!         );
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{eventually, fields, title, TestFixture};
