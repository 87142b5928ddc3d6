//! Proptest generators for property-based testing.
//!
//! Row content is a function of `(id, updated_at)`: two generated rows with
//! the same id and timestamp are identical. Ties favor the incoming row, so
//! without this the merge would be order sensitive on equal timestamps.

use proptest::prelude::*;

use notesync_core::{RowId, SyncRow, UserId};

/// Row ids from a small space, so batches collide often.
pub fn row_id() -> impl Strategy<Value = RowId> {
    (0u8..8).prop_map(|n| RowId::new(format!("row-{n}")))
}

/// A timestamp in a narrow window, so equal timestamps happen.
pub fn timestamp() -> impl Strategy<Value = i64> {
    0i64..64
}

/// The row for `id` at `updated_at`. Every fifth timestamp is a tombstone.
pub fn row_at(id: RowId, updated_at: i64) -> SyncRow {
    let row = SyncRow::new(id.clone(), UserId::from("user-1"), updated_at, "dev-gen".into());
    if updated_at % 5 == 0 {
        row.into_tombstone(updated_at)
    } else {
        row.with_field("title", format!("{id}@{updated_at}"))
    }
}

/// Generate a row.
pub fn sync_row() -> impl Strategy<Value = SyncRow> {
    (row_id(), timestamp()).prop_map(|(id, at)| row_at(id, at))
}

/// Generate up to `max_len` rows.
pub fn row_batch(max_len: usize) -> impl Strategy<Value = Vec<SyncRow>> {
    prop::collection::vec(sync_row(), 0..=max_len)
}

/// A batch plus a permutation of it.
pub fn shuffled_batch(max_len: usize) -> impl Strategy<Value = (Vec<SyncRow>, Vec<SyncRow>)> {
    row_batch(max_len).prop_flat_map(|rows| {
        let original = rows.clone();
        Just(rows).prop_shuffle().prop_map(move |shuffled| (original.clone(), shuffled))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_core::{merge, MaterializedState};

    proptest! {
        #[test]
        fn merge_ignores_arrival_order((rows, shuffled) in shuffled_batch(24)) {
            let a = MaterializedState::from_rows(rows);
            let b = MaterializedState::from_rows(shuffled);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn merge_ignores_duplicates(rows in row_batch(24)) {
            let once = MaterializedState::from_rows(rows.clone());
            let twice = MaterializedState::from_rows(rows.iter().cloned().chain(rows.clone()));
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn split_batches_match_one_batch(rows in row_batch(24), split in 0usize..=24) {
            let split = split.min(rows.len());
            let whole = MaterializedState::from_rows(rows.clone());

            let mut parts = MaterializedState::from_rows(rows[split..].to_vec());
            merge(&mut parts, rows[..split].to_vec());
            prop_assert_eq!(whole, parts);
        }

        #[test]
        fn newest_row_survives(rows in row_batch(24)) {
            let state = MaterializedState::from_rows(rows.clone());
            for row in &rows {
                let kept = state.entry(&row.id).map(|kept| kept.updated_at);
                prop_assert!(kept >= Some(row.updated_at));
            }
        }
    }
}
