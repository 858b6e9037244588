//! Owned key-hash ranges and their lifecycle state.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::key::{KeyHash, TableId};

/// Lifecycle state of a tablet on this master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletState {
    /// Serving reads and writes.
    Normal,
    /// Being rebuilt by recovery or filled by an inbound migration; not
    /// serving clients yet.
    Recovering,
    /// Outbound migration is draining in-flight writes; new writes bounce
    /// with RETRY.
    LockedForMigration,
    /// Placeholder installed before any data movement has begun.
    NotReady,
}

/// One owned (table, [first, last]) hash range. Both bounds are inclusive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tablet {
    pub table_id: TableId,
    pub start_hash: KeyHash,
    pub end_hash: KeyHash,
    pub state: TabletState,
    pub read_ops: u64,
    pub write_ops: u64,
}

impl Tablet {
    fn covers(&self, hash: KeyHash) -> bool {
        self.start_hash <= hash && hash <= self.end_hash
    }

    fn overlaps(&self, start: KeyHash, end: KeyHash) -> bool {
        self.start_hash <= end && start <= self.end_hash
    }
}

/// The set of tablets this master owns. Ranges of the same table are kept
/// pairwise disjoint; `add_tablet` rejects any overlap.
pub struct TabletManager {
    tablets: Mutex<Vec<Tablet>>,
}

impl Default for TabletManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TabletManager {
    pub fn new() -> Self {
        Self {
            tablets: Mutex::new(Vec::new()),
        }
    }

    /// Register a new tablet. Fails (returns false) when the range overlaps
    /// any existing tablet of the same table.
    pub fn add_tablet(
        &self,
        table_id: TableId,
        start_hash: KeyHash,
        end_hash: KeyHash,
        state: TabletState,
    ) -> bool {
        let mut tablets = self.tablets.lock().expect("tablet lock");
        if tablets
            .iter()
            .any(|t| t.table_id == table_id && t.overlaps(start_hash, end_hash))
        {
            return false;
        }
        tablets.push(Tablet {
            table_id,
            start_hash,
            end_hash,
            state,
            read_ops: 0,
            write_ops: 0,
        });
        true
    }

    /// Remove an exact (table, range) tablet. Returns false if this master
    /// does not hold that exact range.
    pub fn delete_tablet(&self, table_id: TableId, start_hash: KeyHash, end_hash: KeyHash) -> bool {
        let mut tablets = self.tablets.lock().expect("tablet lock");
        let before = tablets.len();
        tablets.retain(|t| {
            !(t.table_id == table_id && t.start_hash == start_hash && t.end_hash == end_hash)
        });
        tablets.len() != before
    }

    /// The tablet covering `hash` in `table_id`, if any.
    pub fn get_tablet(&self, table_id: TableId, hash: KeyHash) -> Option<Tablet> {
        let tablets = self.tablets.lock().expect("tablet lock");
        tablets
            .iter()
            .find(|t| t.table_id == table_id && t.covers(hash))
            .cloned()
    }

    /// The single tablet containing the whole [start, end] range, if any.
    pub fn get_tablet_covering_range(
        &self,
        table_id: TableId,
        start_hash: KeyHash,
        end_hash: KeyHash,
    ) -> Option<Tablet> {
        let tablets = self.tablets.lock().expect("tablet lock");
        tablets
            .iter()
            .find(|t| t.table_id == table_id && t.covers(start_hash) && t.covers(end_hash))
            .cloned()
    }

    /// Atomic compare-and-swap on a tablet's state. Legal transitions:
    /// NORMAL <-> LOCKED_FOR_MIGRATION, RECOVERING -> NORMAL, and
    /// NORMAL -> RECOVERING (a freshly created backing table being prepared
    /// to receive indexlet data).
    pub fn change_state(
        &self,
        table_id: TableId,
        start_hash: KeyHash,
        end_hash: KeyHash,
        from: TabletState,
        to: TabletState,
    ) -> bool {
        let allowed = matches!(
            (from, to),
            (TabletState::Normal, TabletState::LockedForMigration)
                | (TabletState::LockedForMigration, TabletState::Normal)
                | (TabletState::Recovering, TabletState::Normal)
                | (TabletState::Normal, TabletState::Recovering)
        );
        if !allowed {
            return false;
        }
        let mut tablets = self.tablets.lock().expect("tablet lock");
        for tablet in tablets.iter_mut() {
            if tablet.table_id == table_id
                && tablet.start_hash == start_hash
                && tablet.end_hash == end_hash
                && tablet.state == from
            {
                tablet.state = to;
                return true;
            }
        }
        false
    }

    /// Split the tablet containing `split_hash` into [start, split-1] and
    /// [split, end]. Statistics stay with the lower half.
    pub fn split_tablet(&self, table_id: TableId, split_hash: KeyHash) -> bool {
        let mut tablets = self.tablets.lock().expect("tablet lock");
        let idx = match tablets.iter().position(|t| {
            t.table_id == table_id && t.covers(split_hash) && t.start_hash < split_hash
        }) {
            Some(idx) => idx,
            None => return false,
        };
        let upper_end = tablets[idx].end_hash;
        let state = tablets[idx].state;
        tablets[idx].end_hash = split_hash - 1;
        tablets.push(Tablet {
            table_id,
            start_hash: split_hash,
            end_hash: upper_end,
            state,
            read_ops: 0,
            write_ops: 0,
        });
        true
    }

    pub fn get_tablets(&self) -> Vec<Tablet> {
        self.tablets.lock().expect("tablet lock").clone()
    }

    pub fn record_read(&self, table_id: TableId, hash: KeyHash) {
        let mut tablets = self.tablets.lock().expect("tablet lock");
        if let Some(t) = tablets
            .iter_mut()
            .find(|t| t.table_id == table_id && t.covers(hash))
        {
            t.read_ops += 1;
        }
    }

    pub fn record_write(&self, table_id: TableId, hash: KeyHash) {
        let mut tablets = self.tablets.lock().expect("tablet lock");
        if let Some(t) = tablets
            .iter_mut()
            .find(|t| t.table_id == table_id && t.covers(hash))
        {
            t.write_ops += 1;
        }
    }

    /// True when some tablet (in any state) covers (table, hash). The hash
    /// index orphan purge keeps entries that pass this filter.
    pub fn covers(&self, table_id: TableId, hash: KeyHash) -> bool {
        self.get_tablet(table_id, hash).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_overlap_within_table_only() {
        let manager = TabletManager::new();
        assert!(manager.add_tablet(1, 0, 999, TabletState::Normal));
        assert!(!manager.add_tablet(1, 500, 1500, TabletState::Normal));
        assert!(!manager.add_tablet(1, 999, 999, TabletState::Normal));
        // Same range in a different table is fine.
        assert!(manager.add_tablet(2, 0, 999, TabletState::Normal));
        assert!(manager.add_tablet(1, 1000, 2000, TabletState::Normal));
    }

    #[test]
    fn get_tablet_honors_inclusive_bounds() {
        let manager = TabletManager::new();
        manager.add_tablet(1, 100, 200, TabletState::Normal);
        assert!(manager.get_tablet(1, 100).is_some());
        assert!(manager.get_tablet(1, 200).is_some());
        assert!(manager.get_tablet(1, 99).is_none());
        assert!(manager.get_tablet(1, 201).is_none());
        assert!(manager.get_tablet_covering_range(1, 120, 180).is_some());
        assert!(manager.get_tablet_covering_range(1, 120, 201).is_none());
    }

    #[test]
    fn state_cas_restricts_transitions() {
        let manager = TabletManager::new();
        manager.add_tablet(1, 0, 100, TabletState::Normal);
        assert!(manager.change_state(1, 0, 100, TabletState::Normal, TabletState::LockedForMigration));
        assert!(manager.change_state(1, 0, 100, TabletState::LockedForMigration, TabletState::Normal));
        // Wrong expected state fails.
        assert!(!manager.change_state(1, 0, 100, TabletState::Recovering, TabletState::Normal));
        // Illegal transition fails regardless of the current state.
        assert!(!manager.change_state(1, 0, 100, TabletState::LockedForMigration, TabletState::Recovering));
    }

    #[test]
    fn split_produces_adjacent_halves() {
        let manager = TabletManager::new();
        manager.add_tablet(5, 0, 1000, TabletState::Normal);
        assert!(manager.split_tablet(5, 400));
        let low = manager.get_tablet(5, 399).expect("low half");
        let high = manager.get_tablet(5, 400).expect("high half");
        assert_eq!((low.start_hash, low.end_hash), (0, 399));
        assert_eq!((high.start_hash, high.end_hash), (400, 1000));
        // Split point outside any tablet fails.
        assert!(!manager.split_tablet(5, 5000));
        // Splitting at a tablet's own start is rejected.
        assert!(!manager.split_tablet(5, 400));
    }

    #[test]
    fn delete_requires_exact_range() {
        let manager = TabletManager::new();
        manager.add_tablet(1, 0, 100, TabletState::Normal);
        assert!(!manager.delete_tablet(1, 0, 50));
        assert!(manager.delete_tablet(1, 0, 100));
        assert!(manager.get_tablet(1, 10).is_none());
    }
}
