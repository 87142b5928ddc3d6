//! # Notesync Core
//!
//! Pure primitives for Notesync: sync rows, row codecs, and the
//! last-write-wins merge that every replica folds its rows through.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`SyncRow`] - The wire/storage shape of one module record
//! - [`MaterializedState`] - Per-table view derived by merging rows
//! - [`RowCodec`] - Maps a module's domain record to and from row fields
//! - [`Clock`] - Millisecond time source, swappable in tests
//!
//! ## Merge Semantics
//!
//! Rows are compared only by `updated_at`. A newer or equal row fully
//! replaces the existing one; tombstones are kept so deletion propagates.
//! See [`merge`].

pub mod clock;
pub mod codec;
pub mod error;
pub mod merge;
pub mod row;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode_rows, encode_rows, JsonCodec, RowCodec};
pub use error::{CoreError, Result};
pub use merge::{merge, merged, wins, MaterializedState, MergeReport};
pub use row::{Fields, SyncRow, RESERVED_FIELDS};
pub use types::{DeviceId, ModuleGroup, RowId, UserId};
