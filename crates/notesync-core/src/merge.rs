//! Last-write-wins reconciliation.
//!
//! For each incoming row `r`: if there is no local row with `r.id`, or the
//! local row's `updated_at <= r.updated_at`, `r` replaces it. Otherwise `r`
//! is stale and discarded. Ties favor the incoming row.
//!
//! Tombstones stay in the state (hidden from the live view) so that an
//! older copy of a deleted row arriving later cannot bring it back.

use std::collections::BTreeMap;

use crate::row::SyncRow;
use crate::types::RowId;

/// Per-table state derived by folding rows through [`merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializedState {
    entries: BTreeMap<RowId, SyncRow>,
}

impl MaterializedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold rows into an empty state.
    pub fn from_rows(rows: impl IntoIterator<Item = SyncRow>) -> Self {
        let mut state = Self::new();
        merge(&mut state, rows);
        state
    }

    /// Live row by id. Tombstoned ids return `None`.
    pub fn get(&self, id: &RowId) -> Option<&SyncRow> {
        self.entries.get(id).filter(|row| !row.is_tombstone())
    }

    /// Raw entry by id, tombstones included.
    pub fn entry(&self, id: &RowId) -> Option<&SyncRow> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &RowId) -> bool {
        self.get(id).is_some()
    }

    /// Live rows in id order.
    pub fn live_rows(&self) -> impl Iterator<Item = &SyncRow> {
        self.entries.values().filter(|row| !row.is_tombstone())
    }

    /// Live ids in order.
    pub fn ids(&self) -> Vec<RowId> {
        self.live_rows().map(|row| row.id.clone()).collect()
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &SyncRow> {
        self.entries.values().filter(|row| row.is_tombstone())
    }

    /// Every entry, tombstones included. This is what gets persisted.
    pub fn entries(&self) -> impl Iterator<Item = &SyncRow> {
        self.entries.values()
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.live_rows().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the state holds nothing at all, not even tombstones.
    pub fn is_blank(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest `updated_at` seen, tombstones included.
    pub fn max_updated_at(&self) -> Option<i64> {
        self.entries.values().map(|row| row.updated_at).max()
    }

    /// Put `row` in place without comparing timestamps, returning what was
    /// there. Only the optimistic write path uses this.
    pub fn replace(&mut self, row: SyncRow) -> Option<SyncRow> {
        self.entries.insert(row.id.clone(), row)
    }

    /// Restore an entry captured by [`replace`](Self::replace).
    pub fn restore(&mut self, id: &RowId, previous: Option<SyncRow>) {
        match previous {
            Some(row) => {
                self.entries.insert(id.clone(), row);
            }
            None => {
                self.entries.remove(id);
            }
        }
    }
}

/// Counts from one merge call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// Live rows inserted or replaced.
    pub applied: usize,
    /// Tombstones that won.
    pub removed: usize,
    /// Rows discarded because the local copy was newer.
    pub stale: usize,
}

impl MergeReport {
    /// Whether the merge changed anything.
    pub fn changed(&self) -> bool {
        self.applied + self.removed > 0
    }

    pub fn absorb(&mut self, other: MergeReport) {
        self.applied += other.applied;
        self.removed += other.removed;
        self.stale += other.stale;
    }
}

/// Whether `incoming` beats the local copy.
pub fn wins(local: Option<&SyncRow>, incoming: &SyncRow) -> bool {
    match local {
        None => true,
        Some(local) => local.updated_at <= incoming.updated_at,
    }
}

/// Merge `incoming` into `state` in place.
pub fn merge(
    state: &mut MaterializedState,
    incoming: impl IntoIterator<Item = SyncRow>,
) -> MergeReport {
    let mut report = MergeReport::default();

    for row in incoming {
        if !wins(state.entries.get(&row.id), &row) {
            report.stale += 1;
            continue;
        }

        if row.is_tombstone() {
            report.removed += 1;
        } else {
            report.applied += 1;
        }
        state.entries.insert(row.id.clone(), row);
    }

    report
}

/// Pure variant of [`merge`]: returns the merged state and leaves the
/// input untouched.
pub fn merged(state: &MaterializedState, incoming: &[SyncRow]) -> MaterializedState {
    let mut next = state.clone();
    merge(&mut next, incoming.iter().cloned());
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, updated_at: i64, title: &str) -> SyncRow {
        SyncRow::new(id.into(), "u".into(), updated_at, "dev".into()).with_field("title", title)
    }

    fn tombstone(id: &str, updated_at: i64) -> SyncRow {
        SyncRow::new(id.into(), "u".into(), updated_at, "dev".into()).into_tombstone(updated_at)
    }

    #[test]
    fn test_older_row_is_stale() {
        let mut state = MaterializedState::from_rows([row("a", 100, "x")]);

        let report = merge(&mut state, [row("a", 90, "y")]);
        assert_eq!(report.stale, 1);
        assert_eq!(state.get(&"a".into()).unwrap().field("title"), Some(&json!("x")));

        merge(&mut state, [row("a", 150, "z")]);
        assert_eq!(state.get(&"a".into()).unwrap().field("title"), Some(&json!("z")));
    }

    #[test]
    fn test_tie_favors_incoming() {
        let mut state = MaterializedState::from_rows([row("a", 100, "x")]);
        let report = merge(&mut state, [row("a", 100, "y")]);

        assert_eq!(report.applied, 1);
        assert_eq!(state.get(&"a".into()).unwrap().field("title"), Some(&json!("y")));
    }

    #[test]
    fn test_tombstone_before_creation_never_resurrects() {
        let mut state = MaterializedState::new();

        merge(&mut state, [tombstone("b", 500)]);
        assert!(!state.contains(&"b".into()));

        let report = merge(&mut state, [row("b", 300, "late")]);
        assert_eq!(report.stale, 1);
        assert!(!state.contains(&"b".into()));
        assert_eq!(state.len(), 0);
        assert_eq!(state.tombstones().count(), 1);
    }

    #[test]
    fn test_newer_tombstone_removes_live_row() {
        let mut state = MaterializedState::from_rows([row("b", 100, "x")]);
        let report = merge(&mut state, [tombstone("b", 101)]);

        assert_eq!(report.removed, 1);
        assert!(state.get(&"b".into()).is_none());
        assert!(state.entry(&"b".into()).is_some());
    }

    #[test]
    fn test_merge_is_idempotent_and_order_free() {
        let rows = vec![row("a", 1, "a1"), row("b", 5, "b5"), row("a", 3, "a3"), tombstone("b", 7)];

        let forward = MaterializedState::from_rows(rows.clone());
        let backward = MaterializedState::from_rows(rows.iter().rev().cloned());
        let doubled = merged(&forward, &rows);

        assert_eq!(forward, backward);
        assert_eq!(forward, doubled);
        assert_eq!(forward.ids(), vec![RowId::from("a")]);
    }

    #[test]
    fn test_merged_leaves_input_untouched() {
        let state = MaterializedState::from_rows([row("a", 1, "x")]);
        let next = merged(&state, &[row("a", 2, "y")]);

        assert_eq!(state.get(&"a".into()).unwrap().updated_at, 1);
        assert_eq!(next.get(&"a".into()).unwrap().updated_at, 2);
    }

    #[test]
    fn test_replace_and_restore() {
        let mut state = MaterializedState::from_rows([row("a", 10, "x")]);

        let previous = state.replace(row("a", 5, "optimistic"));
        assert_eq!(state.get(&"a".into()).unwrap().updated_at, 5);

        state.restore(&"a".into(), previous);
        assert_eq!(state.get(&"a".into()).unwrap().updated_at, 10);

        let previous = state.replace(row("new", 1, "n"));
        state.restore(&"new".into(), previous);
        assert!(state.entry(&"new".into()).is_none());
    }
}
