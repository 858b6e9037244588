//! Mediates every object access between clients and the (log, hash index)
//! pair: reads, conditional writes, removes, bulk reads, transactional
//! prepare/commit, and deterministic segment replay for recovery and
//! migration.
//!
//! Per-key atomicity: the read-version / append / update-index sequence runs
//! under a striped lock selected by key hash, so concurrent writers of one
//! key serialize while unrelated keys proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::hash_index::HashIndex;
use crate::key::{Key, KeyHash, TableId};
use crate::log::{Log, Reference, SegmentIterator, SideLog};
use crate::prepared::PreparedWrites;
use crate::records::{
    wall_seconds, LogEntryType, Object, PreparedOp, PreparedOpTombstone, RpcRecord, Tombstone,
    TxDecisionRecord, TxOpType,
};
use crate::rpc_results::UnackedRpcResults;
use crate::status::{RejectRules, Status};
use crate::tablet::{TabletManager, TabletState};
use crate::tx_recovery::TxRecoveryManager;

/// Result of a successful write.
#[derive(Debug)]
pub struct WriteOutcome {
    pub version: u64,
    /// The object this write displaced, for secondary-index cleanup.
    pub old_object: Option<Object>,
    pub rpc_record_ref: Option<Reference>,
}

/// Blob layout for the rpc record bundled with a linearizable write; the
/// final version is only known once the write assigns it, so the record is
/// materialized inside `write_object`.
#[derive(Clone, Copy, Debug)]
pub enum RpcResultKind {
    Write,
    Increment { value_bits: u64 },
}

/// Identity of the linearizable RPC an object write belongs to.
#[derive(Clone, Copy, Debug)]
pub struct RpcRecordRequest {
    pub lease_id: u64,
    pub rpc_id: u64,
    pub ack_id: u64,
    pub kind: RpcResultKind,
}

/// Result of a successful remove.
#[derive(Debug)]
pub struct RemoveOutcome {
    pub version: u64,
    pub old_object: Option<Object>,
}

/// Result of staging one transactional op.
pub struct PrepareOutcome {
    pub vote: crate::cluster::TxVote,
    pub op_ref: Option<Reference>,
    pub rpc_record_ref: Reference,
}

/// Result of a bulk read by pre-hashed keys.
pub struct ReadHashesOutcome {
    /// How many input hashes were fully processed (continuation point).
    pub num_hashes: u32,
    pub objects: Vec<Object>,
}

/// Replay ran the log out of segments. Unlike a corrupt segment (retriable
/// from a sibling replica), this aborts the whole recovery cleanly.
#[derive(Debug)]
pub struct ReplayOutOfSpace;

impl std::fmt::Display for ReplayOutOfSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "log out of space during replay")
    }
}

impl std::error::Error for ReplayOutOfSpace {}

pub struct ObjectManager {
    log: Arc<Log>,
    hash_index: Arc<HashIndex>,
    tablets: Arc<TabletManager>,
    prepared: Arc<PreparedWrites>,
    rpc_results: Arc<UnackedRpcResults>,
    tx_recovery: Arc<TxRecoveryManager>,
    key_locks: Vec<Mutex<()>>,
    /// Latest tombstone version per (table, key hash); the resurrection
    /// floor. Pruned when the key is written again.
    tombstone_versions: Mutex<HashMap<(TableId, KeyHash), u64>>,
}

impl ObjectManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: Arc<Log>,
        hash_index: Arc<HashIndex>,
        tablets: Arc<TabletManager>,
        prepared: Arc<PreparedWrites>,
        rpc_results: Arc<UnackedRpcResults>,
        tx_recovery: Arc<TxRecoveryManager>,
        key_lock_stripes: usize,
    ) -> Self {
        Self {
            log,
            hash_index,
            tablets,
            prepared,
            rpc_results,
            tx_recovery,
            key_locks: (0..key_lock_stripes.max(1)).map(|_| Mutex::new(())).collect(),
            tombstone_versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn hash_index(&self) -> &Arc<HashIndex> {
        &self.hash_index
    }

    fn key_lock(&self, key_hash: KeyHash) -> &Mutex<()> {
        &self.key_locks[(key_hash as usize) % self.key_locks.len()]
    }

    /// Tablet admission for reads: the range must be owned; tablets being
    /// recovered or prepared bounce with RETRY so the client backs off and
    /// re-resolves ownership.
    fn check_readable(&self, table_id: TableId, key_hash: KeyHash) -> Result<(), Status> {
        match self.tablets.get_tablet(table_id, key_hash) {
            None => Err(Status::UnknownTablet),
            Some(tablet) => match tablet.state {
                TabletState::Normal | TabletState::LockedForMigration => Ok(()),
                TabletState::Recovering | TabletState::NotReady => Err(Status::Retry),
            },
        }
    }

    /// Tablet admission for mutations: only NORMAL tablets accept writes.
    fn check_writable(&self, table_id: TableId, key_hash: KeyHash) -> Result<(), Status> {
        match self.tablets.get_tablet(table_id, key_hash) {
            None => Err(Status::UnknownTablet),
            Some(tablet) if tablet.state == TabletState::Normal => Ok(()),
            Some(_) => Err(Status::Retry),
        }
    }

    fn live_object(&self, table_id: TableId, key_hash: KeyHash, key: &[u8]) -> Option<(Reference, Object)> {
        let reference = self.hash_index.lookup(table_id, key_hash, key)?;
        let (entry_type, payload) = self.log.get_entry(reference)?;
        if entry_type != LogEntryType::Object {
            tracing::error!(table_id, key_hash, "hash index points at non-object entry");
            return None;
        }
        match Object::decode(&payload) {
            Ok(object) => Some((reference, object)),
            Err(err) => {
                tracing::error!(error = ?err, table_id, key_hash, "undecodable live object");
                None
            }
        }
    }

    fn tombstone_floor(&self, table_id: TableId, key_hash: KeyHash) -> u64 {
        self.tombstone_versions
            .lock()
            .expect("tombstone map lock")
            .get(&(table_id, key_hash))
            .copied()
            .unwrap_or(0)
    }

    fn raise_tombstone_floor(&self, table_id: TableId, key_hash: KeyHash, version: u64) {
        let mut map = self.tombstone_versions.lock().expect("tombstone map lock");
        let slot = map.entry((table_id, key_hash)).or_insert(0);
        *slot = (*slot).max(version);
    }

    fn clear_tombstone_floor(&self, table_id: TableId, key_hash: KeyHash) {
        self.tombstone_versions
            .lock()
            .expect("tombstone map lock")
            .remove(&(table_id, key_hash));
    }

    /// Read the live object for a key. Returns the payload (value only, or
    /// the full keys-and-value image) and the version. Never blocks on
    /// durability.
    pub fn read_object(
        &self,
        key: &Key,
        rules: &RejectRules,
        value_only: bool,
    ) -> Result<(Vec<u8>, u64), Status> {
        let key_hash = key.hash();
        self.check_readable(key.table_id(), key_hash)?;
        self.tablets.record_read(key.table_id(), key_hash);

        let Some((_, object)) = self.live_object(key.table_id(), key_hash, key.bytes()) else {
            let status = rules.check(false, 0);
            return Err(if status.is_ok() { Status::ObjectDoesntExist } else { status });
        };
        let status = rules.check(true, object.version);
        if !status.is_ok() {
            return Err(status);
        }
        let version = object.version;
        let payload = if value_only { object.value } else { object.encode() };
        Ok((payload, version))
    }

    /// Write an object. Assigns version = max(live, tombstone floor) + 1,
    /// appends the object plus (when overwriting) a tombstone for the old
    /// version plus an optionally bundled rpc record, all in one atomic log
    /// group, then repoints the hash index. Does not sync.
    pub fn write_object(
        &self,
        mut object: Object,
        rules: &RejectRules,
        rpc_record: Option<RpcRecordRequest>,
    ) -> Result<WriteOutcome, Status> {
        let key_hash = object.key_hash();
        let table_id = object.table_id;
        self.check_writable(table_id, key_hash)?;

        let _guard = self.key_lock(key_hash).lock().expect("key lock");
        if self.prepared.is_key_locked(table_id, key_hash) {
            return Err(Status::Retry);
        }

        let existing = self.live_object(table_id, key_hash, object.primary_key());
        let live_version = existing.as_ref().map(|(_, o)| o.version).unwrap_or(0);
        let status = rules.check(existing.is_some(), live_version);
        if !status.is_ok() {
            return Err(status);
        }

        let floor = self.tombstone_floor(table_id, key_hash);
        object.version = live_version.max(floor) + 1;
        object.timestamp = wall_seconds();

        let object_bytes = object.encode();
        let tombstone_bytes = existing.as_ref().map(|(old_ref, old)| {
            Tombstone {
                table_id,
                key: old.primary_key().to_vec(),
                version: old.version,
                segment_id: old_ref.segment_id,
            }
            .encode()
        });
        let rpc_record_bytes = rpc_record.map(|request| {
            let result = match request.kind {
                RpcResultKind::Write => {
                    crate::protocol::encode_write_result(Status::Ok, object.version)
                }
                RpcResultKind::Increment { value_bits } => {
                    crate::protocol::encode_increment_result(Status::Ok, object.version, value_bits)
                }
            };
            RpcRecord {
                table_id,
                key_hash,
                lease_id: request.lease_id,
                rpc_id: request.rpc_id,
                ack_id: request.ack_id,
                result,
            }
            .encode()
        });

        let mut entries: Vec<(LogEntryType, &[u8])> = vec![(LogEntryType::Object, &object_bytes)];
        if let Some(bytes) = &tombstone_bytes {
            entries.push((LogEntryType::Tombstone, bytes));
        }
        if let Some(bytes) = &rpc_record_bytes {
            entries.push((LogEntryType::RpcRecord, bytes));
        }
        let Some(refs) = self.log.append_group(&entries) else {
            return Err(Status::Retry);
        };

        self.hash_index
            .insert_or_replace(table_id, key_hash, object.primary_key(), refs[0]);
        self.clear_tombstone_floor(table_id, key_hash);
        self.tablets.record_write(table_id, key_hash);

        Ok(WriteOutcome {
            version: object.version,
            old_object: existing.map(|(_, old)| old),
            rpc_record_ref: rpc_record_bytes.map(|_| refs[refs.len() - 1]),
        })
    }

    /// Remove the live object for a key. Appends a tombstone and drops the
    /// hash-index entry; removing an absent key is a no-op unless the reject
    /// rules say otherwise.
    pub fn remove_object(&self, key: &Key, rules: &RejectRules) -> Result<RemoveOutcome, Status> {
        let key_hash = key.hash();
        let table_id = key.table_id();
        self.check_writable(table_id, key_hash)?;

        let _guard = self.key_lock(key_hash).lock().expect("key lock");
        if self.prepared.is_key_locked(table_id, key_hash) {
            return Err(Status::Retry);
        }

        let Some((old_ref, old)) = self.live_object(table_id, key_hash, key.bytes()) else {
            let status = rules.check(false, 0);
            if !status.is_ok() {
                return Err(status);
            }
            return Ok(RemoveOutcome {
                version: 0,
                old_object: None,
            });
        };
        let status = rules.check(true, old.version);
        if !status.is_ok() {
            return Err(status);
        }

        let tombstone = Tombstone {
            table_id,
            key: key.bytes().to_vec(),
            version: old.version,
            segment_id: old_ref.segment_id,
        };
        if self.log.append(LogEntryType::Tombstone, &tombstone.encode()).is_none() {
            return Err(Status::Retry);
        }
        self.hash_index.remove(table_id, key_hash, key.bytes());
        self.raise_tombstone_floor(table_id, key_hash, old.version);
        self.tablets.record_write(table_id, key_hash);

        Ok(RemoveOutcome {
            version: old.version,
            old_object: Some(old),
        })
    }

    /// Bulk read by pre-hashed keys, preserving input order and skipping
    /// hashes with no live object. Stops early when `max_bytes` of object
    /// payload has been gathered.
    pub fn read_hashes(&self, table_id: TableId, hashes: &[KeyHash], max_bytes: usize) -> ReadHashesOutcome {
        let mut objects = Vec::new();
        let mut total = 0usize;
        let mut num_hashes = 0u32;
        'outer: for hash in hashes {
            for (_, reference) in self.hash_index.entries_for(table_id, *hash) {
                let Some((entry_type, payload)) = self.log.get_entry(reference) else {
                    continue;
                };
                if entry_type != LogEntryType::Object {
                    continue;
                }
                let Ok(object) = Object::decode(&payload) else {
                    continue;
                };
                total += payload.len();
                if !objects.is_empty() && total > max_bytes {
                    break 'outer;
                }
                objects.push(object);
            }
            num_hashes += 1;
        }
        ReadHashesOutcome { num_hashes, objects }
    }

    /// True when the hash index still maps the key to exactly this log
    /// reference. Migration uses this as its liveness filter.
    pub fn key_points_at_reference(&self, key: &Key, reference: Reference) -> bool {
        self.hash_index.lookup(key.table_id(), key.hash(), key.bytes()) == Some(reference)
    }

    /// Purge hash-index entries for ranges this master no longer owns.
    pub fn remove_orphaned_objects(&self) {
        let tablets = Arc::clone(&self.tablets);
        let removed = self
            .hash_index
            .remove_orphans(move |table_id, key_hash| tablets.covers(table_id, key_hash));
        let tablets = &self.tablets;
        self.tombstone_versions
            .lock()
            .expect("tombstone map lock")
            .retain(|(table_id, key_hash), _| tablets.covers(*table_id, *key_hash));
        if removed > 0 {
            tracing::info!(removed, "purged orphaned hash index entries");
        }
    }

    /// Forward to the log's durability barrier.
    pub fn sync_changes(&self) -> anyhow::Result<()> {
        self.log.sync_changes()
    }

    /// Stage a transactional op: evaluate the reject rules, try to take the
    /// per-key transaction lock, and append the PreparedOp bundled with an
    /// rpc record carrying the vote. An abort vote appends only the fence
    /// record and holds no lock.
    pub fn prepare_op(
        &self,
        op: &PreparedOp,
        rules: &RejectRules,
        ack_id: u64,
    ) -> Result<PrepareOutcome, Status> {
        use crate::cluster::TxVote;

        let table_id = op.object.table_id;
        let key_hash = op.object.key_hash();
        self.check_writable(table_id, key_hash)?;

        let _guard = self.key_lock(key_hash).lock().expect("key lock");

        let existing = self.live_object(table_id, key_hash, op.object.primary_key());
        let live_version = existing.as_ref().map(|(_, o)| o.version).unwrap_or(0);
        let rules_status = rules.check(existing.is_some(), live_version);
        let lock_acquired = rules_status.is_ok()
            && self
                .prepared
                .try_lock_key(table_id, key_hash, op.lease_id, op.rpc_id);

        let vote = if rules_status.is_ok() && lock_acquired {
            TxVote::Commit
        } else {
            TxVote::Abort
        };

        let rpc_record = RpcRecord {
            table_id,
            key_hash,
            lease_id: op.lease_id,
            rpc_id: op.rpc_id,
            ack_id,
            result: vec![vote.code()],
        };
        let record_bytes = rpc_record.encode();

        let refs = if vote == TxVote::Commit {
            let op_bytes = op.encode();
            self.log.append_group(&[
                (LogEntryType::PreparedOp, &op_bytes),
                (LogEntryType::RpcRecord, &record_bytes),
            ])
        } else {
            self.log
                .append_group(&[(LogEntryType::RpcRecord, &record_bytes)])
        };
        let Some(refs) = refs else {
            if lock_acquired {
                self.prepared.unlock_key(table_id, key_hash);
            }
            return Err(Status::Retry);
        };

        if vote == TxVote::Commit {
            self.prepared.buffer_write(op.lease_id, op.rpc_id, refs[0]);
            Ok(PrepareOutcome {
                vote,
                op_ref: Some(refs[0]),
                rpc_record_ref: refs[1],
            })
        } else {
            Ok(PrepareOutcome {
                vote,
                op_ref: None,
                rpc_record_ref: refs[0],
            })
        }
    }

    /// Finalize a prepared read: release the lock and tombstone the staged
    /// op so replay cannot resurrect it.
    pub fn commit_read(&self, op: &PreparedOp, op_ref: Reference) -> Result<(), Status> {
        let tombstone = PreparedOpTombstone {
            lease_id: op.lease_id,
            rpc_id: op.rpc_id,
            key_hash: op.object.key_hash(),
            segment_id: op_ref.segment_id,
        };
        if self
            .log
            .append(LogEntryType::PreparedOpTombstone, &tombstone.encode())
            .is_none()
        {
            return Err(Status::Retry);
        }
        self.prepared.unlock_key(op.object.table_id, op.object.key_hash());
        Ok(())
    }

    /// Finalize a prepared remove: tombstone the live object (if any) along
    /// with the staged op, and release the lock.
    pub fn commit_remove(&self, op: &PreparedOp, op_ref: Reference) -> Result<(), Status> {
        let table_id = op.object.table_id;
        let key_hash = op.object.key_hash();
        let _guard = self.key_lock(key_hash).lock().expect("key lock");

        let op_tombstone = PreparedOpTombstone {
            lease_id: op.lease_id,
            rpc_id: op.rpc_id,
            key_hash,
            segment_id: op_ref.segment_id,
        }
        .encode();

        let existing = self.live_object(table_id, key_hash, op.object.primary_key());
        let appended = match &existing {
            Some((old_ref, old)) => {
                let tombstone = Tombstone {
                    table_id,
                    key: old.primary_key().to_vec(),
                    version: old.version,
                    segment_id: old_ref.segment_id,
                }
                .encode();
                self.log.append_group(&[
                    (LogEntryType::Tombstone, &tombstone),
                    (LogEntryType::PreparedOpTombstone, &op_tombstone),
                ])
            }
            None => self
                .log
                .append_group(&[(LogEntryType::PreparedOpTombstone, &op_tombstone)]),
        };
        if appended.is_none() {
            return Err(Status::Retry);
        }
        if let Some((_, old)) = existing {
            self.hash_index.remove(table_id, key_hash, old.primary_key());
            self.raise_tombstone_floor(table_id, key_hash, old.version);
        }
        self.prepared.unlock_key(table_id, key_hash);
        Ok(())
    }

    /// Finalize a prepared write: make the staged object live with a fresh
    /// version, tombstone the displaced object, and release the lock.
    pub fn commit_write(&self, op: &PreparedOp, op_ref: Reference) -> Result<(), Status> {
        let table_id = op.object.table_id;
        let key_hash = op.object.key_hash();
        let _guard = self.key_lock(key_hash).lock().expect("key lock");

        let existing = self.live_object(table_id, key_hash, op.object.primary_key());
        let live_version = existing.as_ref().map(|(_, o)| o.version).unwrap_or(0);
        let floor = self.tombstone_floor(table_id, key_hash);

        let mut object = op.object.clone();
        object.version = live_version.max(floor) + 1;
        object.timestamp = wall_seconds();
        let object_bytes = object.encode();

        let op_tombstone = PreparedOpTombstone {
            lease_id: op.lease_id,
            rpc_id: op.rpc_id,
            key_hash,
            segment_id: op_ref.segment_id,
        }
        .encode();

        let tombstone_bytes = existing.as_ref().map(|(old_ref, old)| {
            Tombstone {
                table_id,
                key: old.primary_key().to_vec(),
                version: old.version,
                segment_id: old_ref.segment_id,
            }
            .encode()
        });

        let mut entries: Vec<(LogEntryType, &[u8])> = vec![(LogEntryType::Object, &object_bytes)];
        if let Some(bytes) = &tombstone_bytes {
            entries.push((LogEntryType::Tombstone, bytes));
        }
        entries.push((LogEntryType::PreparedOpTombstone, &op_tombstone));

        let Some(refs) = self.log.append_group(&entries) else {
            return Err(Status::Retry);
        };
        self.hash_index
            .insert_or_replace(table_id, key_hash, object.primary_key(), refs[0]);
        self.clear_tombstone_floor(table_id, key_hash);
        self.prepared.unlock_key(table_id, key_hash);
        self.tablets.record_write(table_id, key_hash);
        Ok(())
    }

    /// Deterministically replay one segment image into a side log.
    ///
    /// Object and tombstone entries fight version duels against whatever is
    /// already live; prepared ops, rpc records, and tx decisions re-seed
    /// their in-memory tables. When `next_node_ids` is supplied, the highest
    /// index-node id seen per backing table is tracked there.
    pub fn replay_segment(
        &self,
        side_log: &mut SideLog,
        mut iter: SegmentIterator<'_>,
        mut next_node_ids: Option<&mut HashMap<TableId, u64>>,
    ) -> anyhow::Result<()> {
        while let Some((entry_type, payload)) = iter.next_entry()? {
            match entry_type {
                LogEntryType::Object => {
                    let object = Object::decode(payload)?;
                    let table_id = object.table_id;
                    let key_hash = object.key_hash();
                    if self.tablets.get_tablet(table_id, key_hash).is_none() {
                        continue;
                    }
                    if let Some(map) = next_node_ids.as_deref_mut() {
                        if let Some(slot) = map.get_mut(&table_id) {
                            if let Some(node_id) = decode_node_id(object.primary_key()) {
                                *slot = (*slot).max(node_id);
                            }
                        }
                    }
                    let live_version = self
                        .live_object(table_id, key_hash, object.primary_key())
                        .map(|(_, o)| o.version)
                        .unwrap_or(0);
                    let floor = self.tombstone_floor(table_id, key_hash);
                    if object.version <= live_version || object.version <= floor {
                        continue;
                    }
                    let reference = side_log
                        .append(LogEntryType::Object, payload)
                        .ok_or(ReplayOutOfSpace)?;
                    self.hash_index
                        .insert_or_replace(table_id, key_hash, object.primary_key(), reference);
                }
                LogEntryType::Tombstone => {
                    let tombstone = Tombstone::decode(payload)?;
                    let table_id = tombstone.table_id;
                    let key_hash = tombstone.key_hash();
                    if self.tablets.get_tablet(table_id, key_hash).is_none() {
                        continue;
                    }
                    let live = self.live_object(table_id, key_hash, &tombstone.key);
                    let live_version = live.as_ref().map(|(_, o)| o.version).unwrap_or(0);
                    if live_version != 0 && live_version <= tombstone.version {
                        self.hash_index.remove(table_id, key_hash, &tombstone.key);
                    }
                    self.raise_tombstone_floor(table_id, key_hash, tombstone.version);
                    if live_version <= tombstone.version {
                        side_log
                            .append(LogEntryType::Tombstone, payload)
                            .ok_or(ReplayOutOfSpace)?;
                    }
                }
                LogEntryType::PreparedOp => {
                    let op = PreparedOp::decode(payload)?;
                    if self.prepared.is_deleted(op.lease_id, op.rpc_id) {
                        continue;
                    }
                    let reference = side_log
                        .append(LogEntryType::PreparedOp, payload)
                        .ok_or(ReplayOutOfSpace)?;
                    self.prepared.buffer_write(op.lease_id, op.rpc_id, reference);
                }
                LogEntryType::PreparedOpTombstone => {
                    let tombstone = PreparedOpTombstone::decode(payload)?;
                    self.prepared.mark_deleted(tombstone.lease_id, tombstone.rpc_id);
                    side_log
                        .append(LogEntryType::PreparedOpTombstone, payload)
                        .ok_or(ReplayOutOfSpace)?;
                }
                LogEntryType::RpcRecord => {
                    let record = RpcRecord::decode(payload)?;
                    let reference = side_log
                        .append(LogEntryType::RpcRecord, payload)
                        .ok_or(ReplayOutOfSpace)?;
                    self.rpc_results
                        .recover_record(record.lease_id, record.rpc_id, record.ack_id, reference);
                }
                LogEntryType::TxDecision => {
                    let record = TxDecisionRecord::decode(payload)?;
                    side_log
                        .append(LogEntryType::TxDecision, payload)
                        .ok_or(ReplayOutOfSpace)?;
                    self.tx_recovery.recover_decision(record);
                }
            }
        }
        Ok(())
    }

    /// Fetch and decode a prepared op by reference.
    pub fn prepared_op_at(&self, reference: Reference) -> Option<PreparedOp> {
        let (entry_type, payload) = self.log.get_entry(reference)?;
        if entry_type != LogEntryType::PreparedOp {
            return None;
        }
        PreparedOp::decode(&payload).ok()
    }

    /// Apply a decided op. Dispatches on the staged op type.
    pub fn commit_prepared(&self, op: &PreparedOp, op_ref: Reference) -> Result<(), Status> {
        match op.op {
            TxOpType::Read => self.commit_read(op, op_ref),
            TxOpType::Remove => self.commit_remove(op, op_ref),
            TxOpType::Write => self.commit_write(op, op_ref),
        }
    }
}

/// Index node ids are 8-byte big-endian primary keys in the backing table.
fn decode_node_id(primary_key: &[u8]) -> Option<u64> {
    if primary_key.len() != 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(primary_key);
    Some(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TxVote;
    use crate::log::NullReplicator;
    use crate::records::Participant;

    struct Fixture {
        manager: ObjectManager,
    }

    /// No-op peer client for constructing a TxRecoveryManager in tests.
    struct NoPeers;

    #[async_trait::async_trait]
    impl crate::cluster::MasterClient for NoPeers {
        async fn prep_for_migration(
            &self,
            _: crate::cluster::ServerId,
            _: TableId,
            _: KeyHash,
            _: KeyHash,
        ) -> anyhow::Result<Status> {
            anyhow::bail!("unused")
        }
        async fn prep_for_indexlet_migration(
            &self,
            _: crate::cluster::ServerId,
            _: TableId,
            _: u8,
            _: TableId,
            _: Vec<u8>,
            _: Vec<u8>,
        ) -> anyhow::Result<Status> {
            anyhow::bail!("unused")
        }
        async fn get_head_of_log(
            &self,
            _: crate::cluster::ServerId,
        ) -> anyhow::Result<crate::log::Position> {
            anyhow::bail!("unused")
        }
        async fn receive_migration_data(
            &self,
            _: crate::cluster::ServerId,
            _: crate::cluster::MigrationData,
        ) -> anyhow::Result<Status> {
            anyhow::bail!("unused")
        }
        async fn insert_index_entry(&self, _: TableId, _: u8, _: Vec<u8>, _: KeyHash) -> anyhow::Result<Status> {
            Ok(Status::Ok)
        }
        async fn remove_index_entry(&self, _: TableId, _: u8, _: Vec<u8>, _: KeyHash) -> anyhow::Result<Status> {
            Ok(Status::Ok)
        }
        async fn tx_request_abort(&self, _: TableId, _: KeyHash, _: u64, _: u64) -> anyhow::Result<TxVote> {
            anyhow::bail!("unused")
        }
        async fn tx_decision(
            &self,
            _: TableId,
            _: KeyHash,
            _: u64,
            _: crate::records::TxDecision,
            _: Vec<Participant>,
        ) -> anyhow::Result<Status> {
            anyhow::bail!("unused")
        }
    }

    fn fixture() -> Fixture {
        let log = Arc::new(Log::new(1 << 16, 64, Arc::new(NullReplicator)));
        let hash_index = Arc::new(HashIndex::new(8));
        let tablets = Arc::new(TabletManager::new());
        tablets.add_tablet(1, 0, u64::MAX, TabletState::Normal);
        let prepared = Arc::new(PreparedWrites::new());
        let rpc_results = Arc::new(UnackedRpcResults::new());
        let tx_recovery = Arc::new(TxRecoveryManager::new(
            crate::cluster::ServerId(1),
            Arc::clone(&log),
            Arc::clone(&tablets),
            Arc::new(NoPeers),
        ));
        Fixture {
            manager: ObjectManager::new(
                log,
                hash_index,
                tablets,
                prepared,
                rpc_results,
                tx_recovery,
                16,
            ),
        }
    }

    fn key(bytes: &[u8]) -> Key {
        Key::new(1, bytes.to_vec())
    }

    #[test]
    fn write_then_read_round_trips_value_and_version() {
        let f = fixture();
        let outcome = f
            .manager
            .write_object(
                Object::with_single_key(1, b"k".to_vec(), b"v1".to_vec()),
                &RejectRules::default(),
                None,
            )
            .expect("write");
        assert_eq!(outcome.version, 1);

        let (value, version) = f
            .manager
            .read_object(&key(b"k"), &RejectRules::default(), true)
            .expect("read");
        assert_eq!(value, b"v1");
        assert_eq!(version, 1);

        let outcome = f
            .manager
            .write_object(
                Object::with_single_key(1, b"k".to_vec(), b"v2".to_vec()),
                &RejectRules::default(),
                None,
            )
            .expect("overwrite");
        assert_eq!(outcome.version, 2);
        assert_eq!(outcome.old_object.expect("old").value, b"v1");
    }

    #[test]
    fn conditional_write_enforces_exact_version() {
        let f = fixture();
        f.manager
            .write_object(
                Object::with_single_key(1, b"k".to_vec(), b"v1".to_vec()),
                &RejectRules::default(),
                None,
            )
            .expect("write");

        let err = f
            .manager
            .write_object(
                Object::with_single_key(1, b"k".to_vec(), b"v2".to_vec()),
                &RejectRules::exactly_version(9),
                None,
            )
            .expect_err("stale cas");
        assert_eq!(err, Status::WrongVersion);
        // State unchanged.
        let (value, version) = f
            .manager
            .read_object(&key(b"k"), &RejectRules::default(), true)
            .expect("read");
        assert_eq!(value, b"v1");
        assert_eq!(version, 1);
    }

    #[test]
    fn resurrection_exceeds_tombstone_version() {
        let f = fixture();
        for value in [b"v1".as_slice(), b"v2", b"v3"] {
            f.manager
                .write_object(
                    Object::with_single_key(1, b"k".to_vec(), value.to_vec()),
                    &RejectRules::default(),
                    None,
                )
                .expect("write");
        }
        let removed = f
            .manager
            .remove_object(&key(b"k"), &RejectRules::default())
            .expect("remove");
        assert_eq!(removed.version, 3);
        assert_eq!(
            f.manager
                .read_object(&key(b"k"), &RejectRules::default(), true)
                .expect_err("gone"),
            Status::ObjectDoesntExist
        );

        let outcome = f
            .manager
            .write_object(
                Object::with_single_key(1, b"k".to_vec(), b"back".to_vec()),
                &RejectRules::default(),
                None,
            )
            .expect("resurrect");
        assert_eq!(outcome.version, 4);
    }

    #[test]
    fn remove_of_missing_key_is_noop_unless_rejected() {
        let f = fixture();
        let outcome = f
            .manager
            .remove_object(&key(b"ghost"), &RejectRules::default())
            .expect("noop remove");
        assert_eq!(outcome.version, 0);

        let rules = RejectRules {
            doesnt_exist: true,
            ..Default::default()
        };
        assert_eq!(
            f.manager.remove_object(&key(b"ghost"), &rules).expect_err("rejected"),
            Status::ObjectDoesntExist
        );
    }

    #[test]
    fn unowned_table_reports_unknown_tablet() {
        let f = fixture();
        let foreign = Key::new(99, b"x".to_vec());
        assert_eq!(
            f.manager
                .read_object(&foreign, &RejectRules::default(), true)
                .expect_err("unknown"),
            Status::UnknownTablet
        );
        assert_eq!(
            f.manager
                .write_object(
                    Object::with_single_key(99, b"x".to_vec(), b"v".to_vec()),
                    &RejectRules::default(),
                    None,
                )
                .expect_err("unknown"),
            Status::UnknownTablet
        );
    }

    #[test]
    fn prepare_conflicting_key_votes_abort() {
        let f = fixture();
        let op_a = PreparedOp {
            op: TxOpType::Write,
            lease_id: 1,
            rpc_id: 1,
            participants: Vec::new(),
            object: Object::with_single_key(1, b"k".to_vec(), b"a".to_vec()),
        };
        let op_b = PreparedOp {
            op: TxOpType::Write,
            lease_id: 2,
            rpc_id: 1,
            participants: Vec::new(),
            object: Object::with_single_key(1, b"k".to_vec(), b"b".to_vec()),
        };

        let first = f
            .manager
            .prepare_op(&op_a, &RejectRules::default(), 0)
            .expect("prepare");
        assert_eq!(first.vote, TxVote::Commit);
        assert!(first.op_ref.is_some());

        let second = f
            .manager
            .prepare_op(&op_b, &RejectRules::default(), 0)
            .expect("prepare");
        assert_eq!(second.vote, TxVote::Abort);
        assert!(second.op_ref.is_none());

        // Plain writes also bounce off the transaction lock.
        assert_eq!(
            f.manager
                .write_object(
                    Object::with_single_key(1, b"k".to_vec(), b"w".to_vec()),
                    &RejectRules::default(),
                    None,
                )
                .expect_err("locked"),
            Status::Retry
        );

        // Committing the winner releases the lock for later writers.
        let op_ref = first.op_ref.expect("op ref");
        f.manager.commit_write(&op_a, op_ref).expect("commit");
        let (value, _) = f
            .manager
            .read_object(&key(b"k"), &RejectRules::default(), true)
            .expect("read");
        assert_eq!(value, b"a");
        f.manager
            .write_object(
                Object::with_single_key(1, b"k".to_vec(), b"w".to_vec()),
                &RejectRules::default(),
                None,
            )
            .expect("unlocked write");
    }

    #[test]
    fn read_hashes_preserves_order_and_skips_missing() {
        let f = fixture();
        for name in [b"a".as_slice(), b"b", b"c"] {
            f.manager
                .write_object(
                    Object::with_single_key(1, name.to_vec(), name.to_vec()),
                    &RejectRules::default(),
                    None,
                )
                .expect("write");
        }
        let hashes = vec![
            crate::key::key_hash(1, b"a"),
            crate::key::key_hash(1, b"missing"),
            crate::key::key_hash(1, b"c"),
        ];
        let outcome = f.manager.read_hashes(1, &hashes, 1 << 20);
        assert_eq!(outcome.num_hashes, 3);
        let names: Vec<&[u8]> = outcome.objects.iter().map(|o| o.primary_key()).collect();
        assert_eq!(names, vec![b"a".as_slice(), b"c".as_slice()]);
        assert!(outcome.objects.len() as u32 <= outcome.num_hashes);
    }
}
