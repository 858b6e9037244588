//! Typed request and response structs for every opcode the master serves,
//! plus the encodings of linearizable result blobs stored in rpc records.
//!
//! Transport framing is out of scope; these types are the boundary the
//! (external) wire layer serializes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cluster::{ClientLease, MigrationData, RecoveryPartition, ServerId, TxVote};
use crate::key::{KeyHash, TableId};
use crate::log::Position;
use crate::records::{Participant, TxDecision, TxOpType};
use crate::status::{RejectRules, Status};
use crate::tablet::Tablet;

#[derive(Clone, Debug)]
pub struct ReadRequest {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub reject_rules: RejectRules,
}

#[derive(Clone, Debug)]
pub struct ReadResponse {
    pub status: Status,
    pub version: u64,
    /// The value alone for `read`; the full keys-and-value image for
    /// `read_keys_and_value`.
    pub payload: Bytes,
}

#[derive(Clone, Debug)]
pub struct WriteRequest {
    pub table_id: TableId,
    /// Key 0 is the primary key; the rest feed secondary indexes.
    pub keys: Vec<Vec<u8>>,
    pub value: Vec<u8>,
    pub reject_rules: RejectRules,
    pub lease: ClientLease,
    /// 0 for a plain (non-linearizable) write.
    pub rpc_id: u64,
    pub ack_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteResponse {
    pub status: Status,
    pub version: u64,
}

#[derive(Clone, Debug)]
pub struct RemoveRequest {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub reject_rules: RejectRules,
    pub lease: ClientLease,
    pub rpc_id: u64,
    pub ack_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoveResponse {
    pub status: Status,
    pub version: u64,
}

#[derive(Clone, Debug)]
pub struct IncrementRequest {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub increment_int64: i64,
    pub increment_double: f64,
    pub reject_rules: RejectRules,
    pub lease: ClientLease,
    pub rpc_id: u64,
    pub ack_id: u64,
}

/// The new value is one 8-byte cell readable through both lenses; both views
/// are returned so the client does not have to know which delta was applied.
#[derive(Clone, Copy, Debug)]
pub struct IncrementResponse {
    pub status: Status,
    pub version: u64,
    pub new_value_int64: i64,
    pub new_value_double: f64,
}

#[derive(Clone, Debug)]
pub struct MultiReadPart {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub reject_rules: RejectRules,
}

#[derive(Clone, Debug)]
pub struct MultiWritePart {
    pub table_id: TableId,
    pub keys: Vec<Vec<u8>>,
    pub value: Vec<u8>,
    pub reject_rules: RejectRules,
}

#[derive(Clone, Debug)]
pub struct MultiRemovePart {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub reject_rules: RejectRules,
}

#[derive(Clone, Debug)]
pub struct MultiIncrementPart {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub increment_int64: i64,
    pub increment_double: f64,
    pub reject_rules: RejectRules,
}

#[derive(Clone, Debug)]
pub enum MultiOpRequest {
    Read(Vec<MultiReadPart>),
    Write(Vec<MultiWritePart>),
    Remove(Vec<MultiRemovePart>),
    Increment(Vec<MultiIncrementPart>),
}

#[derive(Clone, Debug)]
pub struct MultiReadResult {
    pub status: Status,
    pub version: u64,
    pub value: Bytes,
}

#[derive(Clone, Debug)]
pub enum MultiOpResponse {
    Read(Vec<MultiReadResult>),
    Write(Vec<WriteResponse>),
    Remove(Vec<RemoveResponse>),
    Increment(Vec<IncrementResponse>),
}

#[derive(Clone, Debug)]
pub struct EnumerateRequest {
    pub table_id: TableId,
    pub keys_only: bool,
    /// First hash of the tablet being enumerated, as the client knows it.
    pub tablet_first_hash: KeyHash,
    /// Resume point within the tablet; equals `tablet_first_hash` on the
    /// first call.
    pub continuation_hash: KeyHash,
}

#[derive(Clone, Debug)]
pub struct EnumeratedObject {
    pub key: Bytes,
    pub value: Bytes,
    pub version: u64,
}

#[derive(Clone, Debug)]
pub struct EnumerateResponse {
    pub status: Status,
    pub objects: Vec<EnumeratedObject>,
    /// Hash to resume from; meaningless when `done`.
    pub next_hash: KeyHash,
    pub done: bool,
}

#[derive(Clone, Debug)]
pub struct ReadHashesRequest {
    pub table_id: TableId,
    pub hashes: Vec<KeyHash>,
}

#[derive(Clone, Debug)]
pub struct ReadHashesResponse {
    pub status: Status,
    /// Input hashes fully processed; the client resumes from this offset.
    pub num_hashes: u32,
    pub num_objects: u32,
    pub objects: Vec<EnumeratedObject>,
}

#[derive(Clone, Copy, Debug)]
pub struct TakeTabletOwnershipRequest {
    pub table_id: TableId,
    pub start_hash: KeyHash,
    pub end_hash: KeyHash,
}

#[derive(Clone, Copy, Debug)]
pub struct DropTabletOwnershipRequest {
    pub table_id: TableId,
    pub start_hash: KeyHash,
    pub end_hash: KeyHash,
}

#[derive(Clone, Copy, Debug)]
pub struct SplitMasterTabletRequest {
    pub table_id: TableId,
    pub split_hash: KeyHash,
}

#[derive(Clone, Debug)]
pub struct TakeIndexletOwnershipRequest {
    pub table_id: TableId,
    pub index_id: u8,
    pub backing_table_id: TableId,
    pub first_key: Vec<u8>,
    pub first_not_owned_key: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct DropIndexletOwnershipRequest {
    pub table_id: TableId,
    pub index_id: u8,
    pub first_key: Vec<u8>,
    pub first_not_owned_key: Vec<u8>,
}

/// Response carrying nothing but an outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: Status,
}

#[derive(Clone, Debug)]
pub struct IndexEntryRequest {
    pub table_id: TableId,
    pub index_id: u8,
    pub index_key: Vec<u8>,
    pub primary_key_hash: KeyHash,
}

#[derive(Clone, Debug)]
pub struct LookupIndexKeysRequest {
    pub table_id: TableId,
    pub index_id: u8,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
    pub max_keys: u32,
}

#[derive(Clone, Debug)]
pub struct LookupIndexKeysResponse {
    pub status: Status,
    pub primary_key_hashes: Vec<KeyHash>,
    pub next_key: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug)]
pub struct PrepForMigrationRequest {
    pub table_id: TableId,
    pub start_hash: KeyHash,
    pub end_hash: KeyHash,
}

#[derive(Clone, Debug)]
pub struct PrepForIndexletMigrationRequest {
    pub table_id: TableId,
    pub index_id: u8,
    pub backing_table_id: TableId,
    pub first_key: Vec<u8>,
    pub first_not_owned_key: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
pub struct MigrateTabletRequest {
    pub table_id: TableId,
    pub start_hash: KeyHash,
    pub end_hash: KeyHash,
    pub new_owner: ServerId,
}

#[derive(Clone, Debug)]
pub struct SplitAndMigrateIndexletRequest {
    pub table_id: TableId,
    pub index_id: u8,
    pub current_backing_table_id: TableId,
    pub new_backing_table_id: TableId,
    pub split_key: Vec<u8>,
    pub new_owner: ServerId,
}

#[derive(Clone, Copy, Debug)]
pub struct GetHeadOfLogResponse {
    pub status: Status,
    pub head: Position,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerStatisticsResponse {
    pub status: Status,
    pub tablets: Vec<Tablet>,
}

#[derive(Clone, Debug)]
pub struct TxPrepareOp {
    pub op: TxOpType,
    pub table_id: TableId,
    pub rpc_id: u64,
    /// Key 0 is the primary key; writes may carry secondary keys.
    pub keys: Vec<Vec<u8>>,
    /// Empty for reads and removes.
    pub value: Vec<u8>,
    pub reject_rules: RejectRules,
}

#[derive(Clone, Debug)]
pub struct TxPrepareRequest {
    pub lease: ClientLease,
    pub ack_id: u64,
    pub participants: Vec<Participant>,
    pub ops: Vec<TxPrepareOp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxPrepareResponse {
    pub status: Status,
    pub vote: TxVote,
}

#[derive(Clone, Debug)]
pub struct TxDecisionRequest {
    pub lease_id: u64,
    pub decision: TxDecision,
    pub participants: Vec<Participant>,
}

#[derive(Clone, Copy, Debug)]
pub struct TxRequestAbortRequest {
    pub table_id: TableId,
    pub key_hash: KeyHash,
    pub lease_id: u64,
    pub rpc_id: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct TxRequestAbortResponse {
    pub status: Status,
    pub vote: TxVote,
}

#[derive(Clone, Debug)]
pub struct TxHintFailedRequest {
    pub lease_id: u64,
    pub participants: Vec<Participant>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReplicaLocator {
    pub backup_id: ServerId,
    pub segment_id: u64,
}

#[derive(Clone, Debug)]
pub struct RecoverRequest {
    pub recovery_id: u64,
    pub crashed_master: ServerId,
    pub partition_id: u64,
    pub partition: RecoveryPartition,
    pub replicas: Vec<ReplicaLocator>,
}

/// Every opcode the dispatcher recognizes.
#[derive(Clone, Debug)]
pub enum Request {
    Read(ReadRequest),
    ReadKeysAndValue(ReadRequest),
    Write(WriteRequest),
    Remove(RemoveRequest),
    Increment(IncrementRequest),
    MultiOp(MultiOpRequest),
    Enumerate(EnumerateRequest),
    ReadHashes(ReadHashesRequest),
    TakeTabletOwnership(TakeTabletOwnershipRequest),
    DropTabletOwnership(DropTabletOwnershipRequest),
    SplitMasterTablet(SplitMasterTabletRequest),
    TakeIndexletOwnership(TakeIndexletOwnershipRequest),
    DropIndexletOwnership(DropIndexletOwnershipRequest),
    InsertIndexEntry(IndexEntryRequest),
    RemoveIndexEntry(IndexEntryRequest),
    LookupIndexKeys(LookupIndexKeysRequest),
    PrepForMigration(PrepForMigrationRequest),
    PrepForIndexletMigration(PrepForIndexletMigrationRequest),
    ReceiveMigrationData(MigrationData),
    MigrateTablet(MigrateTabletRequest),
    SplitAndMigrateIndexlet(SplitAndMigrateIndexletRequest),
    GetHeadOfLog,
    GetServerStatistics,
    TxPrepare(TxPrepareRequest),
    TxDecision(TxDecisionRequest),
    TxRequestAbort(TxRequestAbortRequest),
    TxHintFailed(TxHintFailedRequest),
    Recover(RecoverRequest),
}

#[derive(Clone, Debug)]
pub enum Response {
    Read(ReadResponse),
    Write(WriteResponse),
    Remove(RemoveResponse),
    Increment(IncrementResponse),
    MultiOp(MultiOpResponse),
    Enumerate(EnumerateResponse),
    ReadHashes(ReadHashesResponse),
    Status(StatusResponse),
    LookupIndexKeys(LookupIndexKeysResponse),
    GetHeadOfLog(GetHeadOfLogResponse),
    ServerStatistics(ServerStatisticsResponse),
    TxPrepare(TxPrepareResponse),
    TxRequestAbort(TxRequestAbortResponse),
}

// Result blobs stored in rpc records. Layouts are fixed-width so retries can
// reconstruct byte-identical responses.

pub fn encode_write_result(status: Status, version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(status.code());
    out.extend_from_slice(&version.to_be_bytes());
    out
}

pub fn decode_write_result(data: &[u8]) -> Option<(Status, u64)> {
    if data.len() != 9 {
        return None;
    }
    let status = Status::from_code(data[0])?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[1..9]);
    Some((status, u64::from_be_bytes(buf)))
}

pub fn encode_increment_result(status: Status, version: u64, value_bits: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(17);
    out.push(status.code());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&value_bits.to_be_bytes());
    out
}

pub fn decode_increment_result(data: &[u8]) -> Option<(Status, u64, u64)> {
    if data.len() != 17 {
        return None;
    }
    let status = Status::from_code(data[0])?;
    let mut version = [0u8; 8];
    version.copy_from_slice(&data[1..9]);
    let mut bits = [0u8; 8];
    bits.copy_from_slice(&data[9..17]);
    Some((status, u64::from_be_bytes(version), u64::from_be_bytes(bits)))
}
