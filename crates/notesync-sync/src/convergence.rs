//! Convergence verification between replicas.
//!
//! Two contexts that have pulled the same rows must hold identical live
//! tables. A state digest lets them compare without exchanging the rows.

use std::fmt;

use notesync_core::{MaterializedState, RowId};

use crate::coordinator::BatchSyncCoordinator;
use crate::error::Result;

/// Blake3 digest of a table's live rows.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateDigest(pub [u8; 32]);

impl StateDigest {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Digest the live view of a table.
///
/// Rows are visited in id order and hashed as JSON (object keys sorted),
/// so the digest depends only on the rows, not on the order they were
/// merged in. Tombstones are left out.
pub fn state_digest(state: &MaterializedState) -> Result<StateDigest> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"notesync-state-v0:");

    for row in state.live_rows() {
        let encoded = serde_json::to_vec(row)?;
        hasher.update(&(encoded.len() as u64).to_le_bytes());
        hasher.update(&encoded);
    }

    Ok(StateDigest(*hasher.finalize().as_bytes()))
}

/// Result of comparing two replicas of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Identical live rows.
    Converged,
    /// The replicas disagree (more sync rounds may fix it).
    Diverged {
        /// Live only on the first replica.
        only_local: Vec<RowId>,
        /// Live only on the second replica.
        only_remote: Vec<RowId>,
        /// Live on both with different content.
        differing: Vec<RowId>,
    },
}

impl ConvergenceResult {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}

/// Compare two replicas of one table.
pub fn verify_convergence(local: &MaterializedState, remote: &MaterializedState) -> Result<ConvergenceResult> {
    if state_digest(local)? == state_digest(remote)? {
        return Ok(ConvergenceResult::Converged);
    }

    let mut only_local = Vec::new();
    let mut differing = Vec::new();
    for row in local.live_rows() {
        match remote.get(&row.id) {
            None => only_local.push(row.id.clone()),
            Some(other) if other != row => differing.push(row.id.clone()),
            Some(_) => {}
        }
    }
    let only_remote = remote
        .live_rows()
        .filter(|row| !local.contains(&row.id))
        .map(|row| row.id.clone())
        .collect();

    Ok(ConvergenceResult::Diverged {
        only_local,
        only_remote,
        differing,
    })
}

/// Compare every table two coordinators of the same module group hold.
pub fn verify_tables(
    local: &BatchSyncCoordinator,
    remote: &BatchSyncCoordinator,
) -> Result<Vec<(String, ConvergenceResult)>> {
    let mut results = Vec::with_capacity(local.tables().len());
    for table in local.tables() {
        let result = verify_convergence(&local.state(table)?, &remote.state(table)?)?;
        results.push((table.clone(), result));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_core::SyncRow;

    fn row(id: &str, at: i64, title: &str) -> SyncRow {
        SyncRow::new(id.into(), "u".into(), at, "dev".into()).with_field("title", title)
    }

    #[test]
    fn test_digest_ignores_merge_order() {
        let a = MaterializedState::from_rows([row("a", 1, "x"), row("b", 2, "y"), row("a", 3, "z")]);
        let b = MaterializedState::from_rows([row("a", 3, "z"), row("b", 2, "y"), row("a", 1, "x")]);

        assert_eq!(state_digest(&a).unwrap(), state_digest(&b).unwrap());
        assert!(verify_convergence(&a, &b).unwrap().is_converged());
    }

    #[test]
    fn test_digest_ignores_tombstones() {
        let a = MaterializedState::from_rows([row("a", 1, "x")]);
        let b = MaterializedState::from_rows([row("a", 1, "x"), row("gone", 5, "g").into_tombstone(5)]);

        assert_eq!(state_digest(&a).unwrap(), state_digest(&b).unwrap());
    }

    #[test]
    fn test_divergence_is_itemized() {
        let a = MaterializedState::from_rows([row("a", 1, "x"), row("b", 1, "y")]);
        let b = MaterializedState::from_rows([row("a", 2, "x2"), row("c", 1, "z")]);

        assert_eq!(
            verify_convergence(&a, &b).unwrap(),
            ConvergenceResult::Diverged {
                only_local: vec!["b".into()],
                only_remote: vec!["c".into()],
                differing: vec!["a".into()],
            }
        );
    }
}
