//! Cluster-facing types and the interfaces to remote collaborators.
//!
//! The coordinator, peer masters, and backups live behind async traits so the
//! core stays independent of the transport. The in-process implementations
//! used by the test harness route calls directly between masters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::key::{KeyHash, TableId};
use crate::log::{Certificate, Position};
use crate::records::{Participant, TxDecision};
use crate::status::Status;

/// Identity of a server (master or backup) in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Client lease as issued by the coordinator. `timestamp` is the cluster
/// time at issue; every lease-carrying RPC advances the local clock to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLease {
    pub lease_id: u64,
    pub lease_term: u64,
    pub timestamp: u64,
}

/// Tablet descriptor exchanged with the coordinator during recovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletDescriptor {
    pub table_id: TableId,
    pub start_hash: KeyHash,
    pub end_hash: KeyHash,
    /// Log position at which this master's ownership begins; set before
    /// reporting recovery completion.
    pub ctime: Option<Position>,
}

/// Indexlet descriptor exchanged with the coordinator during recovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexletDescriptor {
    pub table_id: TableId,
    pub index_id: u8,
    pub backing_table_id: TableId,
    pub first_key: Vec<u8>,
    pub first_not_owned_key: Vec<u8>,
}

/// The slice of a crashed master this recovery master must rebuild.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecoveryPartition {
    pub tablets: Vec<TabletDescriptor>,
    pub indexlets: Vec<IndexletDescriptor>,
}

/// One shipped migration or transfer segment.
#[derive(Clone, Debug)]
pub struct MigrationData {
    pub table_id: TableId,
    pub first_key_hash: KeyHash,
    /// First owned index key of the receiving indexlet; empty for tablet
    /// data. Carried separately from the segment so the receiver can address
    /// `set_next_node_id_if_higher` without decoding entries twice.
    pub tablet_first_key: Vec<u8>,
    pub segment: Vec<u8>,
    /// Declared number of segment bytes; the receiver rejects the payload if
    /// the buffer length does not match exactly.
    pub segment_length: u32,
    pub certificate: Certificate,
    pub is_indexlet_data: bool,
    /// For indexlet data: the data table and index the entries belong to.
    pub data_table_id: TableId,
    pub index_id: u8,
}

/// Filtered recovery segment fetched from one backup.
#[derive(Clone, Debug)]
pub struct SegmentImage {
    pub data: Vec<u8>,
    pub certificate: Certificate,
}

/// Failure modes of a recovery fetch, distinguished so the replica
/// scoreboard can decide between retrying siblings and giving up.
#[derive(Debug)]
pub enum BackupReadError {
    /// The backup is no longer part of the cluster.
    NotUp,
    /// Transport-level or backup-side failure.
    Failed(String),
}

impl fmt::Display for BackupReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupReadError::NotUp => write!(f, "backup not up"),
            BackupReadError::Failed(msg) => write!(f, "backup read failed: {msg}"),
        }
    }
}

impl std::error::Error for BackupReadError {}

/// Coordinator-side operations this master invokes.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Current lease state; lease id 0 asks for the cluster time only.
    async fn get_lease_info(&self, lease_id: u64) -> anyhow::Result<ClientLease>;

    /// Hand a migrated tablet to its new owner. `ctime` is the new owner's
    /// log head recorded before any data was shipped.
    async fn reassign_tablet_ownership(
        &self,
        table_id: TableId,
        start_hash: KeyHash,
        end_hash: KeyHash,
        new_owner: ServerId,
        ctime: Position,
    ) -> anyhow::Result<()>;

    /// Report the outcome of a recovery. Returns true when the coordinator
    /// cancelled this master's claim (recovered elsewhere).
    async fn recovery_master_finished(
        &self,
        recovery_id: u64,
        server_id: ServerId,
        partition: &RecoveryPartition,
        successful: bool,
    ) -> anyhow::Result<bool>;
}

/// Master-to-master operations. Implementations route on the target id (or,
/// for index and transaction traffic, on the owning key) the same way the
/// client library would.
#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn prep_for_migration(
        &self,
        target: ServerId,
        table_id: TableId,
        start_hash: KeyHash,
        end_hash: KeyHash,
    ) -> anyhow::Result<Status>;

    async fn prep_for_indexlet_migration(
        &self,
        target: ServerId,
        table_id: TableId,
        index_id: u8,
        backing_table_id: TableId,
        first_key: Vec<u8>,
        first_not_owned_key: Vec<u8>,
    ) -> anyhow::Result<Status>;

    async fn get_head_of_log(&self, target: ServerId) -> anyhow::Result<Position>;

    async fn receive_migration_data(
        &self,
        target: ServerId,
        data: MigrationData,
    ) -> anyhow::Result<Status>;

    /// Insert a secondary-index entry on whichever master owns the indexlet
    /// covering `index_key`.
    async fn insert_index_entry(
        &self,
        table_id: TableId,
        index_id: u8,
        index_key: Vec<u8>,
        primary_key_hash: KeyHash,
    ) -> anyhow::Result<Status>;

    async fn remove_index_entry(
        &self,
        table_id: TableId,
        index_id: u8,
        index_key: Vec<u8>,
        primary_key_hash: KeyHash,
    ) -> anyhow::Result<Status>;

    /// Ask the participant owning (table, key_hash) how it voted for
    /// (lease, rpc); a participant that never prepared records an abort
    /// fence and answers ABORT.
    async fn tx_request_abort(
        &self,
        table_id: TableId,
        key_hash: KeyHash,
        lease_id: u64,
        rpc_id: u64,
    ) -> anyhow::Result<TxVote>;

    /// Deliver a transaction decision to the participant owning
    /// (table, key_hash).
    async fn tx_decision(
        &self,
        table_id: TableId,
        key_hash: KeyHash,
        lease_id: u64,
        decision: TxDecision,
        participants: Vec<Participant>,
    ) -> anyhow::Result<Status>;
}

/// Vote returned by prepare and request-abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxVote {
    Commit,
    Abort,
}

impl TxVote {
    pub fn code(self) -> u8 {
        match self {
            TxVote::Commit => 1,
            TxVote::Abort => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => TxVote::Commit,
            2 => TxVote::Abort,
            _ => return None,
        })
    }
}

/// Monotone non-decreasing logical clock, advanced by client leases and
/// coordinator responses. Never moves backwards.
pub struct ClusterClock(AtomicU64);

impl Default for ClusterClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn advance(&self, timestamp: u64) {
        self.0.fetch_max(timestamp, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Backup-side fetch of one filtered recovery segment.
#[async_trait]
pub trait BackupClient: Send + Sync {
    async fn get_recovery_data(
        &self,
        backup: ServerId,
        recovery_id: u64,
        crashed_master: ServerId,
        partition_id: u64,
        segment_id: u64,
    ) -> Result<SegmentImage, BackupReadError>;
}
