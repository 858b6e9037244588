//! Per-lease RPC-id deduplication for linearizable operations.
//!
//! Each client lease tracks which rpc ids have completed and where their
//! canonical results live in the log. `check_duplicate` is consulted before
//! executing any linearizable op; `record_completion` after. Acknowledged
//! entries (rpc_id < first_unacked) are pruned eagerly, expired leases by a
//! background cleaner.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::log::Reference;
use crate::status::Status;

#[derive(Clone, Copy, Debug)]
enum RpcState {
    InProgress,
    Completed(Reference),
}

struct LeaseRecord {
    first_unacked: u64,
    lease_term: u64,
    rpcs: HashMap<u64, RpcState>,
}

/// Outcome of a duplicate check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateCheck {
    /// First sighting; the caller must execute and then record completion.
    New,
    /// A completed duplicate; the stored result is the canonical response.
    Duplicate(Reference),
}

pub struct UnackedRpcResults {
    leases: Mutex<HashMap<u64, LeaseRecord>>,
}

impl Default for UnackedRpcResults {
    fn default() -> Self {
        Self::new()
    }
}

impl UnackedRpcResults {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Record the client's ack watermark, prune acknowledged results, and
    /// classify (lease, rpc). A retry racing the original attempt gets
    /// `Status::Retry`; an rpc id the client already acknowledged gets
    /// `Status::RequestFormatError` (a correct client never resends those).
    pub fn check_duplicate(
        &self,
        lease_id: u64,
        rpc_id: u64,
        ack_id: u64,
        lease_term: u64,
    ) -> Result<DuplicateCheck, Status> {
        let mut leases = self.leases.lock().expect("rpc results lock");
        let record = leases.entry(lease_id).or_insert_with(|| LeaseRecord {
            first_unacked: 1,
            lease_term,
            rpcs: HashMap::new(),
        });
        record.lease_term = record.lease_term.max(lease_term);

        if ack_id + 1 > record.first_unacked {
            record.first_unacked = ack_id + 1;
            let watermark = record.first_unacked;
            record.rpcs.retain(|id, _| *id >= watermark);
        }

        if rpc_id < record.first_unacked {
            return Err(Status::RequestFormatError);
        }

        match record.rpcs.get(&rpc_id) {
            Some(RpcState::Completed(reference)) => Ok(DuplicateCheck::Duplicate(*reference)),
            Some(RpcState::InProgress) => Err(Status::Retry),
            None => {
                record.rpcs.insert(rpc_id, RpcState::InProgress);
                Ok(DuplicateCheck::New)
            }
        }
    }

    pub fn record_completion(&self, lease_id: u64, rpc_id: u64, result: Reference) {
        let mut leases = self.leases.lock().expect("rpc results lock");
        if let Some(record) = leases.get_mut(&lease_id) {
            record.rpcs.insert(rpc_id, RpcState::Completed(result));
        }
    }

    /// Drop an in-progress marker after a failed attempt so the client's
    /// retry can execute.
    pub fn abandon(&self, lease_id: u64, rpc_id: u64) {
        let mut leases = self.leases.lock().expect("rpc results lock");
        if let Some(record) = leases.get_mut(&lease_id) {
            if matches!(record.rpcs.get(&rpc_id), Some(RpcState::InProgress)) {
                record.rpcs.remove(&rpc_id);
            }
        }
    }

    /// Seed a completion from a replayed RpcRecord during recovery.
    pub fn recover_record(&self, lease_id: u64, rpc_id: u64, ack_id: u64, result: Reference) {
        let mut leases = self.leases.lock().expect("rpc results lock");
        let record = leases.entry(lease_id).or_insert_with(|| LeaseRecord {
            first_unacked: 1,
            lease_term: 0,
            rpcs: HashMap::new(),
        });
        if ack_id + 1 > record.first_unacked {
            record.first_unacked = ack_id + 1;
            let watermark = record.first_unacked;
            record.rpcs.retain(|id, _| *id >= watermark);
        }
        if rpc_id >= record.first_unacked {
            record.rpcs.insert(rpc_id, RpcState::Completed(result));
        }
    }

    /// Stored result for (lease, rpc), if completed.
    pub fn completed_result(&self, lease_id: u64, rpc_id: u64) -> Option<Reference> {
        let leases = self.leases.lock().expect("rpc results lock");
        match leases.get(&lease_id)?.rpcs.get(&rpc_id)? {
            RpcState::Completed(reference) => Some(*reference),
            RpcState::InProgress => None,
        }
    }

    /// Drop every lease whose term expired against the given cluster time.
    /// Returns how many leases were removed.
    pub fn clean_expired(&self, cluster_time: u64) -> usize {
        let mut leases = self.leases.lock().expect("rpc results lock");
        let before = leases.len();
        leases.retain(|_, record| record.lease_term >= cluster_time);
        before - leases.len()
    }
}
