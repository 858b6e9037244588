//! In-memory table of staged transactional operations and the per-key
//! transaction lock table.
//!
//! A prepared op holds its primary key locked from the COMMIT vote until the
//! decision finalizes it. The locks are in-memory only, so after a crash they
//! are reinstalled from the replayed PreparedOp entries
//! (`regrab_locks_after_recovery`).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::key::{KeyHash, TableId};
use crate::log::{Log, Reference};
use crate::records::{LogEntryType, PreparedOp};

struct PreparedInner {
    ops: HashMap<(u64, u64), Reference>,
    /// (lease, rpc) pairs whose PreparedOpTombstone was seen during replay;
    /// suppresses late re-registration from out-of-order segments.
    deleted: HashSet<(u64, u64)>,
    locks: HashMap<(TableId, KeyHash), (u64, u64)>,
}

pub struct PreparedWrites {
    inner: Mutex<PreparedInner>,
}

impl Default for PreparedWrites {
    fn default() -> Self {
        Self::new()
    }
}

impl PreparedWrites {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PreparedInner {
                ops: HashMap::new(),
                deleted: HashSet::new(),
                locks: HashMap::new(),
            }),
        }
    }

    /// Remember where a prepared op lives in the log. Ignored if the op's
    /// tombstone was already replayed.
    pub fn buffer_write(&self, lease_id: u64, rpc_id: u64, op_ref: Reference) {
        let mut inner = self.inner.lock().expect("prepared lock");
        if inner.deleted.contains(&(lease_id, rpc_id)) {
            return;
        }
        inner.ops.insert((lease_id, rpc_id), op_ref);
    }

    pub fn peek_op(&self, lease_id: u64, rpc_id: u64) -> Option<Reference> {
        let inner = self.inner.lock().expect("prepared lock");
        inner.ops.get(&(lease_id, rpc_id)).copied()
    }

    pub fn pop_op(&self, lease_id: u64, rpc_id: u64) -> Option<Reference> {
        let mut inner = self.inner.lock().expect("prepared lock");
        inner.ops.remove(&(lease_id, rpc_id))
    }

    /// Record a finalized (tombstoned) op during replay and drop any
    /// already-buffered registration.
    pub fn mark_deleted(&self, lease_id: u64, rpc_id: u64) {
        let mut inner = self.inner.lock().expect("prepared lock");
        inner.deleted.insert((lease_id, rpc_id));
        inner.ops.remove(&(lease_id, rpc_id));
    }

    pub fn is_deleted(&self, lease_id: u64, rpc_id: u64) -> bool {
        let inner = self.inner.lock().expect("prepared lock");
        inner.deleted.contains(&(lease_id, rpc_id))
    }

    /// Acquire the transaction lock on (table, key hash). Succeeds if free
    /// or already held by the same (lease, rpc).
    pub fn try_lock_key(
        &self,
        table_id: TableId,
        key_hash: KeyHash,
        lease_id: u64,
        rpc_id: u64,
    ) -> bool {
        let mut inner = self.inner.lock().expect("prepared lock");
        match inner.locks.get(&(table_id, key_hash)) {
            Some(holder) => *holder == (lease_id, rpc_id),
            None => {
                inner.locks.insert((table_id, key_hash), (lease_id, rpc_id));
                true
            }
        }
    }

    pub fn unlock_key(&self, table_id: TableId, key_hash: KeyHash) {
        let mut inner = self.inner.lock().expect("prepared lock");
        inner.locks.remove(&(table_id, key_hash));
    }

    pub fn is_key_locked(&self, table_id: TableId, key_hash: KeyHash) -> bool {
        let inner = self.inner.lock().expect("prepared lock");
        inner.locks.contains_key(&(table_id, key_hash))
    }

    /// Reinstall the per-key locks for every buffered op after replay. The
    /// ops themselves were rebuilt from the recovered log; the locks exist
    /// only in memory and would otherwise be lost with the crashed master.
    pub fn regrab_locks_after_recovery(&self, log: &Log) {
        let ops: Vec<((u64, u64), Reference)> = {
            let inner = self.inner.lock().expect("prepared lock");
            inner.ops.iter().map(|(k, v)| (*k, *v)).collect()
        };
        for ((lease_id, rpc_id), op_ref) in ops {
            let Some((entry_type, payload)) = log.get_entry(op_ref) else {
                tracing::warn!(lease_id, rpc_id, "prepared op reference unresolvable after recovery");
                continue;
            };
            if entry_type != LogEntryType::PreparedOp {
                tracing::warn!(lease_id, rpc_id, "prepared op reference points at wrong entry type");
                continue;
            }
            match PreparedOp::decode(&payload) {
                Ok(op) => {
                    let mut inner = self.inner.lock().expect("prepared lock");
                    inner
                        .locks
                        .insert((op.object.table_id, op.object.key_hash()), (lease_id, rpc_id));
                }
                Err(err) => {
                    tracing::warn!(error = ?err, lease_id, rpc_id, "undecodable prepared op during lock regrab");
                }
            }
        }
    }
}
