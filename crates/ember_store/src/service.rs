//! The master service: opcode routing, init/disable interlocks, the
//! linearizable RPC envelope, and every per-opcode handler.
//!
//! Handlers mutate state through the ObjectManager and friends; this layer
//! owns admission (init / disable / epoch registration), cluster-time
//! advancement, duplicate detection, and secondary-index maintenance
//! ordering (insert before the write, remove after the response is
//! determined).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;

use crate::cluster::{
    BackupClient, ClusterClock, CoordinatorClient, MasterClient, MigrationData, ServerId, TxVote,
};
use crate::config::MasterConfig;
use crate::epoch::EpochTracker;
use crate::hash_index::HashIndex;
use crate::indexlet::{IndexletManager, IndexletState};
use crate::key::{key_hash, Key};
use crate::log::{Log, SegmentReplicator};
use crate::migration::MigrationEngine;
use crate::object_manager::{ObjectManager, RpcRecordRequest, RpcResultKind};
use crate::prepared::PreparedWrites;
use crate::protocol::*;
use crate::records::{LogEntryType, Object, Participant, PreparedOp, RpcRecord, TxDecision};
use crate::recovery::RecoveryEngine;
use crate::rpc_results::{DuplicateCheck, UnackedRpcResults};
use crate::status::{RejectRules, Status};
use crate::tablet::{TabletManager, TabletState};
use crate::tx_recovery::TxRecoveryManager;

pub struct MasterService {
    server_id: ServerId,
    config: MasterConfig,
    log: Arc<Log>,
    tablets: Arc<TabletManager>,
    indexlets: Arc<IndexletManager>,
    objects: Arc<ObjectManager>,
    rpc_results: Arc<UnackedRpcResults>,
    prepared: Arc<PreparedWrites>,
    tx_recovery: Arc<TxRecoveryManager>,
    epochs: Arc<EpochTracker>,
    clock: Arc<ClusterClock>,
    migration: MigrationEngine,
    recovery: RecoveryEngine,
    peers: Arc<dyn MasterClient>,
    init_called: AtomicBool,
    disable_count: AtomicI64,
    log_ever_synced: AtomicBool,
}

/// RAII guard that takes the master out of service; every RPC arriving
/// while at least one Disabler is alive gets RETRY.
pub struct Disabler<'a> {
    service: Option<&'a MasterService>,
}

impl<'a> Disabler<'a> {
    pub fn new(service: &'a MasterService) -> Self {
        service.disable_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!(server_id = %service.server_id, "master service disabled");
        Self {
            service: Some(service),
        }
    }

    pub fn reenable(&mut self) {
        if let Some(service) = self.service.take() {
            service.disable_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Disabler<'_> {
    fn drop(&mut self) {
        self.reenable();
    }
}

impl MasterService {
    pub fn new(
        server_id: ServerId,
        config: MasterConfig,
        coordinator: Arc<dyn CoordinatorClient>,
        peers: Arc<dyn MasterClient>,
        backups: Arc<dyn BackupClient>,
        replicator: Arc<dyn SegmentReplicator>,
    ) -> Arc<Self> {
        let log = Arc::new(Log::new(config.segment_size, config.max_segments, replicator));
        let hash_index = Arc::new(HashIndex::new(config.hash_index_stripes));
        let tablets = Arc::new(TabletManager::new());
        let rpc_results = Arc::new(UnackedRpcResults::new());
        let prepared = Arc::new(PreparedWrites::new());
        let clock = Arc::new(ClusterClock::new());
        let epochs = Arc::new(EpochTracker::new());
        let tx_recovery = Arc::new(TxRecoveryManager::new(
            server_id,
            Arc::clone(&log),
            Arc::clone(&tablets),
            Arc::clone(&peers),
        ));
        let objects = Arc::new(ObjectManager::new(
            Arc::clone(&log),
            Arc::clone(&hash_index),
            Arc::clone(&tablets),
            Arc::clone(&prepared),
            Arc::clone(&rpc_results),
            Arc::clone(&tx_recovery),
            config.key_lock_stripes,
        ));
        let indexlets = Arc::new(IndexletManager::new(Arc::clone(&objects)));
        let migration = MigrationEngine::new(
            server_id,
            Arc::clone(&log),
            Arc::clone(&objects),
            Arc::clone(&tablets),
            Arc::clone(&indexlets),
            Arc::clone(&epochs),
            Arc::clone(&peers),
            Arc::clone(&coordinator),
            config.migration_drain_deadline,
        );
        let recovery = RecoveryEngine::new(
            server_id,
            Arc::clone(&log),
            Arc::clone(&objects),
            Arc::clone(&tablets),
            Arc::clone(&indexlets),
            Arc::clone(&prepared),
            Arc::clone(&tx_recovery),
            Arc::clone(&coordinator),
            backups,
            Arc::clone(&clock),
            config.recovery_fetch_fanout,
        );

        Arc::new(Self {
            server_id,
            config,
            log,
            tablets,
            indexlets,
            objects,
            rpc_results,
            prepared,
            tx_recovery,
            epochs,
            clock,
            migration,
            recovery,
            peers,
            init_called: AtomicBool::new(false),
            disable_count: AtomicI64::new(0),
            log_ever_synced: AtomicBool::new(false),
        })
    }

    /// Once-only initialization after enlisting with the coordinator. Also
    /// starts the expired-lease cleaner when a runtime is available.
    pub fn init_once_enlisted(self: &Arc<Self>) {
        if self.init_called.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let service = Arc::clone(self);
            let interval = service.config.lease_cleaner_interval;
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let removed = service.rpc_results.clean_expired(service.clock.now());
                    if removed > 0 {
                        tracing::debug!(removed, "cleaned expired client leases");
                    }
                }
            });
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn cluster_time(&self) -> u64 {
        self.clock.now()
    }

    pub fn tablets(&self) -> &Arc<TabletManager> {
        &self.tablets
    }

    pub fn indexlets(&self) -> &Arc<IndexletManager> {
        &self.indexlets
    }

    pub fn objects(&self) -> &Arc<ObjectManager> {
        &self.objects
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn tx_recovery(&self) -> &Arc<TxRecoveryManager> {
        &self.tx_recovery
    }

    pub fn disable(&self) -> Disabler<'_> {
        Disabler::new(self)
    }

    /// Route one request to its handler. RETRY until initialization, and
    /// while any Disabler holds the service out of rotation.
    pub async fn dispatch(&self, request: Request) -> Result<Response, Status> {
        if !self.init_called.load(Ordering::SeqCst) {
            tracing::warn!(server_id = %self.server_id,
                "request before initialization complete; returning RETRY");
            return Err(Status::Retry);
        }
        if self.disable_count.load(Ordering::SeqCst) > 0 {
            tracing::info!(server_id = %self.server_id,
                "requesting retry (master disabled)");
            return Err(Status::Retry);
        }

        let guard = self.epochs.register();
        match request {
            Request::Read(req) => Ok(Response::Read(self.read(req, true))),
            Request::ReadKeysAndValue(req) => Ok(Response::Read(self.read(req, false))),
            Request::Write(req) => Ok(Response::Write(self.write(req).await)),
            Request::Remove(req) => Ok(Response::Remove(self.remove(req).await)),
            Request::Increment(req) => Ok(Response::Increment(self.increment(req))),
            Request::MultiOp(req) => Ok(Response::MultiOp(self.multi_op(req).await)),
            Request::Enumerate(req) => Ok(Response::Enumerate(self.enumerate(req))),
            Request::ReadHashes(req) => Ok(Response::ReadHashes(self.read_hashes(req))),
            Request::TakeTabletOwnership(req) => {
                Ok(Response::Status(self.take_tablet_ownership(req)))
            }
            Request::DropTabletOwnership(req) => {
                Ok(Response::Status(self.drop_tablet_ownership(req)))
            }
            Request::SplitMasterTablet(req) => Ok(Response::Status(self.split_master_tablet(req))),
            Request::TakeIndexletOwnership(req) => {
                Ok(Response::Status(self.take_indexlet_ownership(req)))
            }
            Request::DropIndexletOwnership(req) => {
                Ok(Response::Status(self.drop_indexlet_ownership(req)))
            }
            Request::InsertIndexEntry(req) => Ok(Response::Status(self.insert_index_entry(req))),
            Request::RemoveIndexEntry(req) => Ok(Response::Status(self.remove_index_entry(req))),
            Request::LookupIndexKeys(req) => {
                Ok(Response::LookupIndexKeys(self.lookup_index_keys(req)))
            }
            Request::PrepForMigration(req) => Ok(Response::Status(self.prep_for_migration(req))),
            Request::PrepForIndexletMigration(req) => {
                Ok(Response::Status(self.prep_for_indexlet_migration(req)))
            }
            Request::ReceiveMigrationData(data) => {
                Ok(Response::Status(self.receive_migration_data(data)))
            }
            Request::MigrateTablet(req) => Ok(Response::Status(StatusResponse {
                status: self.migration.migrate_tablet(req, &guard).await,
            })),
            Request::SplitAndMigrateIndexlet(req) => Ok(Response::Status(StatusResponse {
                status: self.migration.split_and_migrate_indexlet(req, &guard).await,
            })),
            Request::GetHeadOfLog => Ok(Response::GetHeadOfLog(self.get_head_of_log())),
            Request::GetServerStatistics => {
                Ok(Response::ServerStatistics(self.get_server_statistics()))
            }
            Request::TxPrepare(req) => Ok(Response::TxPrepare(self.tx_prepare(req))),
            Request::TxDecision(req) => Ok(Response::Status(self.tx_decision(req))),
            Request::TxRequestAbort(req) => {
                Ok(Response::TxRequestAbort(self.tx_request_abort(req)))
            }
            Request::TxHintFailed(req) => Ok(Response::Status(self.tx_hint_failed(req).await)),
            Request::Recover(req) => Ok(Response::Status(StatusResponse {
                status: self.recovery.recover(req).await,
            })),
        }
    }

    fn read(&self, request: ReadRequest, value_only: bool) -> ReadResponse {
        let key = Key::new(request.table_id, request.key);
        match self.objects.read_object(&key, &request.reject_rules, value_only) {
            Ok((payload, version)) => ReadResponse {
                status: Status::Ok,
                version,
                payload: Bytes::from(payload),
            },
            Err(status) => ReadResponse {
                status,
                version: 0,
                payload: Bytes::new(),
            },
        }
    }

    /// Send InsertIndexEntry RPCs for every secondary key, in parallel, and
    /// wait for all of them. Runs before the object write for strong
    /// consistency: an index entry may briefly point at nothing, but a live
    /// object is never missing its entries.
    async fn request_insert_index_entries(&self, object: &Object) {
        if object.keys.len() <= 1 {
            return;
        }
        let primary_hash = object.key_hash();
        let calls = object.keys[1..].iter().enumerate().filter_map(|(i, key)| {
            if key.is_empty() {
                return None;
            }
            Some(self.peers.insert_index_entry(
                object.table_id,
                (i + 1) as u8,
                key.clone(),
                primary_hash,
            ))
        });
        for result in join_all(calls).await {
            if let Err(err) = result {
                tracing::warn!(error = ?err, "index entry insertion failed");
            }
        }
    }

    /// Remove the index entries of a displaced or deleted object.
    async fn request_remove_index_entries(&self, object: &Object) {
        if object.keys.len() <= 1 {
            return;
        }
        let primary_hash = object.key_hash();
        let calls = object.keys[1..].iter().enumerate().filter_map(|(i, key)| {
            if key.is_empty() {
                return None;
            }
            Some(self.peers.remove_index_entry(
                object.table_id,
                (i + 1) as u8,
                key.clone(),
                primary_hash,
            ))
        });
        for result in join_all(calls).await {
            if let Err(err) = result {
                tracing::warn!(error = ?err, "index entry removal failed");
            }
        }
    }

    /// Reconstruct the canonical response of a completed linearizable write
    /// or remove from its rpc record.
    fn replay_write_result(&self, reference: crate::log::Reference) -> WriteResponse {
        let decoded = self
            .log
            .get_entry(reference)
            .filter(|(entry_type, _)| *entry_type == LogEntryType::RpcRecord)
            .and_then(|(_, payload)| RpcRecord::decode(&payload).ok())
            .and_then(|record| decode_write_result(&record.result));
        match decoded {
            Some((status, version)) => WriteResponse { status, version },
            None => {
                tracing::error!("stored rpc result unreadable");
                WriteResponse {
                    status: Status::InternalError,
                    version: 0,
                }
            }
        }
    }

    async fn write(&self, request: WriteRequest) -> WriteResponse {
        if request.keys.is_empty() || request.keys[0].is_empty() {
            return WriteResponse {
                status: Status::RequestFormatError,
                version: 0,
            };
        }
        let linearizable = request.rpc_id > 0;
        if linearizable {
            self.clock.advance(request.lease.timestamp);
            match self.rpc_results.check_duplicate(
                request.lease.lease_id,
                request.rpc_id,
                request.ack_id,
                request.lease.lease_term,
            ) {
                Ok(DuplicateCheck::New) => {}
                Ok(DuplicateCheck::Duplicate(reference)) => {
                    return self.replay_write_result(reference);
                }
                Err(status) => {
                    return WriteResponse { status, version: 0 };
                }
            }
        }

        let object = Object::new(request.table_id, request.keys, request.value);

        // Insert new index entries, if any, before writing the object.
        self.request_insert_index_entries(&object).await;

        let rpc_record = linearizable.then_some(RpcRecordRequest {
            lease_id: request.lease.lease_id,
            rpc_id: request.rpc_id,
            ack_id: request.ack_id,
            kind: RpcResultKind::Write,
        });
        match self
            .objects
            .write_object(object, &request.reject_rules, rpc_record)
        {
            Ok(outcome) => {
                if let Err(err) = self.objects.sync_changes() {
                    tracing::error!(error = ?err, "sync after write failed");
                    if linearizable {
                        self.rpc_results.abandon(request.lease.lease_id, request.rpc_id);
                    }
                    return WriteResponse {
                        status: Status::InternalError,
                        version: 0,
                    };
                }
                if linearizable {
                    self.rpc_results.record_completion(
                        request.lease.lease_id,
                        request.rpc_id,
                        outcome.rpc_record_ref.expect("bundled rpc record"),
                    );
                }
                // Index entries of the displaced object can be removed after
                // the response is determined.
                if let Some(old) = &outcome.old_object {
                    self.request_remove_index_entries(old).await;
                }
                WriteResponse {
                    status: Status::Ok,
                    version: outcome.version,
                }
            }
            Err(status) => {
                if linearizable {
                    self.rpc_results.abandon(request.lease.lease_id, request.rpc_id);
                }
                WriteResponse { status, version: 0 }
            }
        }
    }

    async fn remove(&self, request: RemoveRequest) -> RemoveResponse {
        let linearizable = request.rpc_id > 0;
        if linearizable {
            self.clock.advance(request.lease.timestamp);
            match self.rpc_results.check_duplicate(
                request.lease.lease_id,
                request.rpc_id,
                request.ack_id,
                request.lease.lease_term,
            ) {
                Ok(DuplicateCheck::New) => {}
                Ok(DuplicateCheck::Duplicate(reference)) => {
                    let replayed = self.replay_write_result(reference);
                    return RemoveResponse {
                        status: replayed.status,
                        version: replayed.version,
                    };
                }
                Err(status) => {
                    return RemoveResponse { status, version: 0 };
                }
            }
        }

        let key = Key::new(request.table_id, request.key);
        match self.objects.remove_object(&key, &request.reject_rules) {
            Ok(outcome) => {
                let mut status = Status::Ok;
                if let Err(err) = self.objects.sync_changes() {
                    tracing::error!(error = ?err, "sync after remove failed");
                    status = Status::InternalError;
                }
                if linearizable {
                    if status.is_ok() {
                        self.record_plain_completion(
                            &request.lease,
                            request.rpc_id,
                            request.ack_id,
                            request.table_id,
                            &key,
                            outcome.version,
                        );
                    } else {
                        self.rpc_results.abandon(request.lease.lease_id, request.rpc_id);
                    }
                }
                if let Some(old) = &outcome.old_object {
                    self.request_remove_index_entries(old).await;
                }
                RemoveResponse {
                    status,
                    version: outcome.version,
                }
            }
            Err(status) => {
                if linearizable {
                    self.rpc_results.abandon(request.lease.lease_id, request.rpc_id);
                }
                RemoveResponse { status, version: 0 }
            }
        }
    }

    /// Removes have no object write to bundle a record with, so the record
    /// is appended on its own after the tombstone synced.
    fn record_plain_completion(
        &self,
        lease: &crate::cluster::ClientLease,
        rpc_id: u64,
        ack_id: u64,
        table_id: u64,
        key: &Key,
        version: u64,
    ) {
        let record = RpcRecord {
            table_id,
            key_hash: key.hash(),
            lease_id: lease.lease_id,
            rpc_id,
            ack_id,
            result: encode_write_result(Status::Ok, version),
        };
        match self.log.append(LogEntryType::RpcRecord, &record.encode()) {
            Some(reference) => {
                if let Err(err) = self.log.sync_changes() {
                    tracing::error!(error = ?err, "sync of rpc record failed");
                }
                self.rpc_results.record_completion(lease.lease_id, rpc_id, reference);
            }
            None => {
                self.rpc_results.abandon(lease.lease_id, rpc_id);
            }
        }
    }

    /// Atomic read-increment-write cycle shared by increment and
    /// multi-increment. Does not sync, allowing batched synchronization.
    fn increment_object(
        &self,
        table_id: u64,
        key_bytes: &[u8],
        increment_int64: i64,
        increment_double: f64,
        rules: &RejectRules,
        rpc_record: Option<(u64, u64, u64)>,
    ) -> Result<(u64, u64, Option<crate::log::Reference>), Status> {
        let key = Key::new(table_id, key_bytes.to_vec());
        let must_exist = rules.doesnt_exist;
        loop {
            let (old_bits, version) = match self.objects.read_object(&key, rules, true) {
                Ok((value, version)) => {
                    if value.len() != 8 {
                        return Err(Status::InvalidObject);
                    }
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&value);
                    (u64::from_le_bytes(buf), version)
                }
                // A missing object starts from zero; both encodings of zero
                // share the same bit pattern.
                Err(Status::ObjectDoesntExist) if !must_exist => (0, 0),
                Err(status) => return Err(status),
            };

            let mut bits = old_bits;
            if increment_int64 != 0 {
                bits = ((bits as i64).wrapping_add(increment_int64)) as u64;
            }
            if increment_double != 0.0 {
                bits = (f64::from_bits(bits) + increment_double).to_bits();
            }

            let object = Object::with_single_key(table_id, key_bytes.to_vec(), bits.to_le_bytes().to_vec());
            let update_rules = RejectRules::exactly_version(version);
            let rpc_request = rpc_record.map(|(lease_id, rpc_id, ack_id)| RpcRecordRequest {
                lease_id,
                rpc_id,
                ack_id,
                kind: RpcResultKind::Increment { value_bits: bits },
            });
            match self.objects.write_object(object, &update_rules, rpc_request) {
                Ok(outcome) => {
                    return Ok((bits, outcome.version, outcome.rpc_record_ref));
                }
                Err(Status::WrongVersion) => {
                    tracing::debug!(table_id, "increment retry after version mismatch");
                    continue;
                }
                Err(status) => return Err(status),
            }
        }
    }

    fn increment(&self, request: IncrementRequest) -> IncrementResponse {
        let linearizable = request.rpc_id > 0;
        if linearizable {
            self.clock.advance(request.lease.timestamp);
            match self.rpc_results.check_duplicate(
                request.lease.lease_id,
                request.rpc_id,
                request.ack_id,
                request.lease.lease_term,
            ) {
                Ok(DuplicateCheck::New) => {}
                Ok(DuplicateCheck::Duplicate(reference)) => {
                    let decoded = self
                        .log
                        .get_entry(reference)
                        .and_then(|(_, payload)| RpcRecord::decode(&payload).ok())
                        .and_then(|record| decode_increment_result(&record.result));
                    return match decoded {
                        Some((status, version, bits)) => IncrementResponse {
                            status,
                            version,
                            new_value_int64: bits as i64,
                            new_value_double: f64::from_bits(bits),
                        },
                        None => IncrementResponse {
                            status: Status::InternalError,
                            version: 0,
                            new_value_int64: 0,
                            new_value_double: 0.0,
                        },
                    };
                }
                Err(status) => {
                    return IncrementResponse {
                        status,
                        version: 0,
                        new_value_int64: 0,
                        new_value_double: 0.0,
                    };
                }
            }
        }

        let rpc_record = linearizable.then_some((
            request.lease.lease_id,
            request.rpc_id,
            request.ack_id,
        ));
        match self.increment_object(
            request.table_id,
            &request.key,
            request.increment_int64,
            request.increment_double,
            &request.reject_rules,
            rpc_record,
        ) {
            Ok((bits, version, record_ref)) => {
                if let Err(err) = self.objects.sync_changes() {
                    tracing::error!(error = ?err, "sync after increment failed");
                }
                if linearizable {
                    self.rpc_results.record_completion(
                        request.lease.lease_id,
                        request.rpc_id,
                        record_ref.expect("bundled rpc record"),
                    );
                }
                IncrementResponse {
                    status: Status::Ok,
                    version,
                    new_value_int64: bits as i64,
                    new_value_double: f64::from_bits(bits),
                }
            }
            Err(status) => {
                if linearizable {
                    self.rpc_results.abandon(request.lease.lease_id, request.rpc_id);
                }
                IncrementResponse {
                    status,
                    version: 0,
                    new_value_int64: 0,
                    new_value_double: 0.0,
                }
            }
        }
    }

    async fn multi_op(&self, request: MultiOpRequest) -> MultiOpResponse {
        match request {
            MultiOpRequest::Read(parts) => {
                let mut results = Vec::with_capacity(parts.len());
                for part in parts {
                    let key = Key::new(part.table_id, part.key);
                    match self.objects.read_object(&key, &part.reject_rules, true) {
                        Ok((value, version)) => results.push(MultiReadResult {
                            status: Status::Ok,
                            version,
                            value: Bytes::from(value),
                        }),
                        Err(status) => results.push(MultiReadResult {
                            status,
                            version: 0,
                            value: Bytes::new(),
                        }),
                    }
                }
                MultiOpResponse::Read(results)
            }
            MultiOpRequest::Write(parts) => {
                let mut results = Vec::with_capacity(parts.len());
                let mut displaced = Vec::new();
                for part in parts {
                    if part.keys.is_empty() || part.keys[0].is_empty() {
                        results.push(WriteResponse {
                            status: Status::RequestFormatError,
                            version: 0,
                        });
                        continue;
                    }
                    let object = Object::new(part.table_id, part.keys, part.value);
                    self.request_insert_index_entries(&object).await;
                    match self.objects.write_object(object, &part.reject_rules, None) {
                        Ok(outcome) => {
                            if let Some(old) = outcome.old_object {
                                displaced.push(old);
                            }
                            results.push(WriteResponse {
                                status: Status::Ok,
                                version: outcome.version,
                            });
                        }
                        Err(status) => results.push(WriteResponse { status, version: 0 }),
                    }
                }
                if let Err(err) = self.objects.sync_changes() {
                    tracing::error!(error = ?err, "sync after multi-write failed");
                }
                for old in &displaced {
                    self.request_remove_index_entries(old).await;
                }
                MultiOpResponse::Write(results)
            }
            MultiOpRequest::Remove(parts) => {
                let mut results = Vec::with_capacity(parts.len());
                let mut removed = Vec::new();
                for part in parts {
                    let key = Key::new(part.table_id, part.key);
                    match self.objects.remove_object(&key, &part.reject_rules) {
                        Ok(outcome) => {
                            if let Some(old) = outcome.old_object {
                                removed.push(old);
                            }
                            results.push(RemoveResponse {
                                status: Status::Ok,
                                version: outcome.version,
                            });
                        }
                        Err(status) => results.push(RemoveResponse { status, version: 0 }),
                    }
                }
                if let Err(err) = self.objects.sync_changes() {
                    tracing::error!(error = ?err, "sync after multi-remove failed");
                }
                for old in &removed {
                    self.request_remove_index_entries(old).await;
                }
                MultiOpResponse::Remove(results)
            }
            MultiOpRequest::Increment(parts) => {
                let mut results = Vec::with_capacity(parts.len());
                for part in parts {
                    match self.increment_object(
                        part.table_id,
                        &part.key,
                        part.increment_int64,
                        part.increment_double,
                        &part.reject_rules,
                        None,
                    ) {
                        Ok((bits, version, _)) => results.push(IncrementResponse {
                            status: Status::Ok,
                            version,
                            new_value_int64: bits as i64,
                            new_value_double: f64::from_bits(bits),
                        }),
                        Err(status) => results.push(IncrementResponse {
                            status,
                            version: 0,
                            new_value_int64: 0,
                            new_value_double: 0.0,
                        }),
                    }
                }
                if let Err(err) = self.objects.sync_changes() {
                    tracing::error!(error = ?err, "sync after multi-increment failed");
                }
                MultiOpResponse::Increment(results)
            }
        }
    }

    fn enumerate(&self, request: EnumerateRequest) -> EnumerateResponse {
        let Some(tablet) = self
            .tablets
            .get_tablet(request.table_id, request.tablet_first_hash)
        else {
            return EnumerateResponse {
                status: Status::UnknownTablet,
                objects: Vec::new(),
                next_hash: 0,
                done: true,
            };
        };

        // The tablet may have been merged or re-split since the client's
        // last call; always filter by the hash the client asked for.
        let start = request.continuation_hash.max(request.tablet_first_hash);
        let raw = self
            .objects
            .hash_index()
            .collect_table_range(request.table_id, start, tablet.end_hash);

        let mut objects = Vec::new();
        let mut total_bytes = 0usize;
        let mut next_hash = tablet.end_hash;
        let mut done = true;
        let mut idx = 0;
        while idx < raw.len() {
            // Consume whole hash groups so a continuation never re-returns
            // part of a group.
            let hash = raw[idx].0;
            let group_end = raw[idx..]
                .iter()
                .position(|(h, _, _)| *h != hash)
                .map(|offset| idx + offset)
                .unwrap_or(raw.len());
            let group_bytes: usize = raw[idx..group_end]
                .iter()
                .map(|(_, key, _)| key.len())
                .sum::<usize>();
            if !objects.is_empty() && total_bytes + group_bytes > self.config.max_response_bytes {
                next_hash = hash;
                done = false;
                break;
            }
            for (_, _, reference) in &raw[idx..group_end] {
                let Some((entry_type, payload)) = self.log.get_entry(*reference) else {
                    continue;
                };
                if entry_type != LogEntryType::Object {
                    continue;
                }
                let Ok(object) = Object::decode(&payload) else {
                    continue;
                };
                total_bytes += payload.len();
                objects.push(EnumeratedObject {
                    key: Bytes::from(object.primary_key().to_vec()),
                    value: if request.keys_only {
                        Bytes::new()
                    } else {
                        Bytes::from(object.value)
                    },
                    version: object.version,
                });
            }
            idx = group_end;
        }

        EnumerateResponse {
            status: Status::Ok,
            objects,
            next_hash,
            done,
        }
    }

    fn read_hashes(&self, request: ReadHashesRequest) -> ReadHashesResponse {
        let outcome = self.objects.read_hashes(
            request.table_id,
            &request.hashes,
            self.config.max_response_bytes,
        );
        let objects: Vec<EnumeratedObject> = outcome
            .objects
            .into_iter()
            .map(|object| EnumeratedObject {
                key: Bytes::from(object.primary_key().to_vec()),
                value: Bytes::from(object.value),
                version: object.version,
            })
            .collect();
        ReadHashesResponse {
            status: Status::Ok,
            num_hashes: outcome.num_hashes,
            num_objects: objects.len() as u32,
            objects,
        }
    }

    fn take_tablet_ownership(&self, request: TakeTabletOwnershipRequest) -> StatusResponse {
        // The log must have at least one synced segment before the first
        // tablet lands, otherwise losing the whole log is indistinguishable
        // from never having written to it.
        if !self.log_ever_synced.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.objects.sync_changes() {
                tracing::error!(error = ?err, "initial log sync failed");
                self.log_ever_synced.store(false, Ordering::SeqCst);
                return StatusResponse {
                    status: Status::Retry,
                };
            }
        }

        if self.tablets.add_tablet(
            request.table_id,
            request.start_hash,
            request.end_hash,
            TabletState::Normal,
        ) {
            tracing::info!(table_id = request.table_id, start = request.start_hash,
                end = request.end_hash, "took ownership of new tablet");
            return StatusResponse { status: Status::Ok };
        }

        if let Some(existing) = self
            .tablets
            .get_tablet_covering_range(request.table_id, request.start_hash, request.end_hash)
        {
            if existing.state == TabletState::Normal {
                tracing::info!(table_id = request.table_id,
                    "already own requested tablet; returning success");
                return StatusResponse { status: Status::Ok };
            }
        }

        // Possibly held in RECOVERING after migration or recovery; promote.
        if self.tablets.change_state(
            request.table_id,
            request.start_hash,
            request.end_hash,
            TabletState::Recovering,
            TabletState::Normal,
        ) {
            tracing::info!(table_id = request.table_id,
                "took ownership of tablet previously in RECOVERING state");
            return StatusResponse { status: Status::Ok };
        }

        tracing::warn!(table_id = request.table_id, start = request.start_hash,
            end = request.end_hash, "cannot take tablet ownership; overlapping ranges");
        StatusResponse {
            status: Status::InternalError,
        }
    }

    fn drop_tablet_ownership(&self, request: DropTabletOwnershipRequest) -> StatusResponse {
        self.tablets
            .delete_tablet(request.table_id, request.start_hash, request.end_hash);
        self.objects.remove_orphaned_objects();
        tracing::info!(table_id = request.table_id, start = request.start_hash,
            end = request.end_hash, "dropped tablet ownership (or did not own)");
        StatusResponse { status: Status::Ok }
    }

    fn split_master_tablet(&self, request: SplitMasterTabletRequest) -> StatusResponse {
        if self.tablets.split_tablet(request.table_id, request.split_hash) {
            tracing::info!(table_id = request.table_id, split_hash = request.split_hash,
                "split tablet");
            StatusResponse { status: Status::Ok }
        } else {
            StatusResponse {
                status: Status::UnknownTablet,
            }
        }
    }

    fn take_indexlet_ownership(&self, request: TakeIndexletOwnershipRequest) -> StatusResponse {
        if self.indexlets.add_indexlet(
            request.table_id,
            request.index_id,
            request.backing_table_id,
            request.first_key.clone(),
            request.first_not_owned_key.clone(),
            IndexletState::Normal,
            1,
        ) {
            // Adopt whatever node objects already live in the backing table
            // (populated when this take completes a migration).
            self.indexlets
                .load_entries_from_backing(request.table_id, request.index_id, &request.first_key);
            tracing::info!(table_id = request.table_id, index_id = request.index_id,
                "took ownership of indexlet");
            return StatusResponse { status: Status::Ok };
        }
        if self.indexlets.change_state(
            request.table_id,
            request.index_id,
            &request.first_key,
            &request.first_not_owned_key,
            IndexletState::Recovering,
            IndexletState::Normal,
        ) {
            tracing::info!(table_id = request.table_id, index_id = request.index_id,
                "promoted recovering indexlet on ownership take");
            return StatusResponse { status: Status::Ok };
        }
        if self
            .indexlets
            .has_indexlet(request.table_id, request.index_id, &request.first_key)
        {
            return StatusResponse { status: Status::Ok };
        }
        StatusResponse {
            status: Status::InternalError,
        }
    }

    fn drop_indexlet_ownership(&self, request: DropIndexletOwnershipRequest) -> StatusResponse {
        self.indexlets.delete_indexlet(
            request.table_id,
            request.index_id,
            &request.first_key,
            &request.first_not_owned_key,
        );
        tracing::info!(table_id = request.table_id, index_id = request.index_id,
            "dropped indexlet ownership (or did not own)");
        StatusResponse { status: Status::Ok }
    }

    fn insert_index_entry(&self, request: IndexEntryRequest) -> StatusResponse {
        let status = self.indexlets.insert_entry(
            request.table_id,
            request.index_id,
            &request.index_key,
            request.primary_key_hash,
        );
        if status.is_ok() {
            if let Err(err) = self.objects.sync_changes() {
                tracing::error!(error = ?err, "sync after index insert failed");
                return StatusResponse {
                    status: Status::InternalError,
                };
            }
        }
        StatusResponse { status }
    }

    fn remove_index_entry(&self, request: IndexEntryRequest) -> StatusResponse {
        let status = self.indexlets.remove_entry(
            request.table_id,
            request.index_id,
            &request.index_key,
            request.primary_key_hash,
        );
        if status.is_ok() {
            if let Err(err) = self.objects.sync_changes() {
                tracing::error!(error = ?err, "sync after index remove failed");
                return StatusResponse {
                    status: Status::InternalError,
                };
            }
        }
        StatusResponse { status }
    }

    fn lookup_index_keys(&self, request: LookupIndexKeysRequest) -> LookupIndexKeysResponse {
        match self.indexlets.lookup_index_keys(
            request.table_id,
            request.index_id,
            &request.first_key,
            &request.last_key,
            request.max_keys as usize,
        ) {
            Ok(lookup) => LookupIndexKeysResponse {
                status: Status::Ok,
                primary_key_hashes: lookup.primary_key_hashes,
                next_key: lookup.next_key,
            },
            Err(status) => LookupIndexKeysResponse {
                status,
                primary_key_hashes: Vec::new(),
                next_key: None,
            },
        }
    }

    fn prep_for_migration(&self, request: PrepForMigrationRequest) -> StatusResponse {
        if self.tablets.add_tablet(
            request.table_id,
            request.start_hash,
            request.end_hash,
            TabletState::Recovering,
        ) {
            tracing::info!(table_id = request.table_id, start = request.start_hash,
                end = request.end_hash, "ready to receive tablet migration");
            return StatusResponse { status: Status::Ok };
        }
        let overlap = self.tablets.get_tablet(request.table_id, request.start_hash).is_some()
            || self.tablets.get_tablet(request.table_id, request.end_hash).is_some();
        if overlap {
            tracing::warn!(table_id = request.table_id,
                "already have an overlapping tablet; cannot prep for migration");
            StatusResponse {
                status: Status::ObjectExists,
            }
        } else {
            // No overlap found even though the add failed; assume an
            // innocuous race and let the source retry.
            StatusResponse {
                status: Status::Retry,
            }
        }
    }

    fn prep_for_indexlet_migration(
        &self,
        request: PrepForIndexletMigrationRequest,
    ) -> StatusResponse {
        if !self.indexlets.add_indexlet(
            request.table_id,
            request.index_id,
            request.backing_table_id,
            request.first_key.clone(),
            request.first_not_owned_key.clone(),
            IndexletState::Recovering,
            1,
        ) {
            tracing::warn!(table_id = request.table_id, index_id = request.index_id,
                "already have the indexlet; cannot prep for migration");
            return StatusResponse {
                status: Status::ObjectExists,
            };
        }
        // The backing table was created NORMAL by the coordinator; flip it
        // to RECOVERING so the receive path accepts data for it.
        self.tablets.change_state(
            request.backing_table_id,
            0,
            u64::MAX,
            TabletState::Normal,
            TabletState::Recovering,
        );
        tracing::info!(table_id = request.table_id, index_id = request.index_id,
            "ready to receive indexlet migration");
        StatusResponse { status: Status::Ok }
    }

    fn receive_migration_data(&self, data: MigrationData) -> StatusResponse {
        StatusResponse {
            status: self.migration.receive_migration_data(&data),
        }
    }

    fn get_head_of_log(&self) -> GetHeadOfLogResponse {
        GetHeadOfLogResponse {
            status: Status::Ok,
            head: self.log.roll_head_over(),
        }
    }

    fn get_server_statistics(&self) -> ServerStatisticsResponse {
        ServerStatisticsResponse {
            status: Status::Ok,
            tablets: self.tablets.get_tablets(),
        }
    }

    fn tx_prepare(&self, request: TxPrepareRequest) -> TxPrepareResponse {
        self.clock.advance(request.lease.timestamp);

        let mut status = Status::Ok;
        let mut vote = TxVote::Commit;
        for op in &request.ops {
            match self.rpc_results.check_duplicate(
                request.lease.lease_id,
                op.rpc_id,
                request.ack_id,
                request.lease.lease_term,
            ) {
                Ok(DuplicateCheck::New) => {}
                Ok(DuplicateCheck::Duplicate(reference)) => {
                    // Reuse the durable vote; an earlier abort decides the
                    // whole list.
                    match self.stored_vote(reference) {
                        Some(TxVote::Commit) => continue,
                        Some(TxVote::Abort) => {
                            vote = TxVote::Abort;
                            break;
                        }
                        None => {
                            status = Status::InternalError;
                            vote = TxVote::Abort;
                            break;
                        }
                    }
                }
                Err(retry_status) => {
                    status = retry_status;
                    vote = TxVote::Abort;
                    break;
                }
            }

            if op.keys.is_empty() || op.keys[0].is_empty() {
                self.rpc_results.abandon(request.lease.lease_id, op.rpc_id);
                status = Status::RequestFormatError;
                vote = TxVote::Abort;
                break;
            }
            let prepared_op = PreparedOp {
                op: op.op,
                lease_id: request.lease.lease_id,
                rpc_id: op.rpc_id,
                participants: request.participants.clone(),
                object: Object::new(op.table_id, op.keys.clone(), op.value.clone()),
            };
            match self
                .objects
                .prepare_op(&prepared_op, &op.reject_rules, request.ack_id)
            {
                Ok(outcome) => {
                    self.rpc_results.record_completion(
                        request.lease.lease_id,
                        op.rpc_id,
                        outcome.rpc_record_ref,
                    );
                    if outcome.vote == TxVote::Abort {
                        vote = TxVote::Abort;
                        break;
                    }
                }
                Err(op_status) => {
                    self.rpc_results.abandon(request.lease.lease_id, op.rpc_id);
                    status = op_status;
                    vote = TxVote::Abort;
                    break;
                }
            }
        }

        if let Err(err) = self.objects.sync_changes() {
            tracing::error!(error = ?err, "sync after tx prepare failed");
            status = Status::InternalError;
            vote = TxVote::Abort;
        }
        TxPrepareResponse { status, vote }
    }

    fn stored_vote(&self, reference: crate::log::Reference) -> Option<TxVote> {
        let (entry_type, payload) = self.log.get_entry(reference)?;
        if entry_type != LogEntryType::RpcRecord {
            return None;
        }
        let record = RpcRecord::decode(&payload).ok()?;
        record.result.first().copied().and_then(TxVote::from_code)
    }

    fn tx_decision(&self, request: TxDecisionRequest) -> StatusResponse {
        for participant in &request.participants {
            match self
                .tablets
                .get_tablet(participant.table_id, participant.key_hash)
            {
                Some(tablet) if tablet.state == TabletState::Normal => {}
                _ => {
                    return StatusResponse {
                        status: Status::UnknownTablet,
                    };
                }
            }

            // Nothing staged means the op already committed (or never
            // prepared here because of an abort vote).
            let Some(op_ref) = self.prepared.peek_op(request.lease_id, participant.rpc_id) else {
                continue;
            };
            let Some(op) = self.objects.prepared_op_at(op_ref) else {
                tracing::error!(lease_id = request.lease_id, rpc_id = participant.rpc_id,
                    "staged op reference unresolvable");
                return StatusResponse {
                    status: Status::InternalError,
                };
            };

            let applied = match request.decision {
                TxDecision::Commit => self.objects.commit_prepared(&op, op_ref),
                // Abort only releases the lock and retires the staged op.
                TxDecision::Abort => self.objects.commit_read(&op, op_ref),
            };
            if let Err(status) = applied {
                return StatusResponse { status };
            }
            self.prepared.pop_op(request.lease_id, participant.rpc_id);
        }

        if let Err(err) = self.objects.sync_changes() {
            tracing::error!(error = ?err, "sync after tx decision failed");
            return StatusResponse {
                status: Status::InternalError,
            };
        }
        StatusResponse { status: Status::Ok }
    }

    fn tx_request_abort(&self, request: TxRequestAbortRequest) -> TxRequestAbortResponse {
        // A durable vote (from prepare or an earlier fence) is canonical.
        if let Some(reference) = self
            .rpc_results
            .completed_result(request.lease_id, request.rpc_id)
        {
            if let Some(vote) = self.stored_vote(reference) {
                return TxRequestAbortResponse {
                    status: Status::Ok,
                    vote,
                };
            }
        }

        match self.tablets.get_tablet(request.table_id, request.key_hash) {
            Some(tablet) if tablet.state == TabletState::Normal => {}
            _ => {
                return TxRequestAbortResponse {
                    status: Status::UnknownTablet,
                    vote: TxVote::Abort,
                };
            }
        }

        // Never prepared: record an abort fence so a late-arriving prepare
        // for this rpc id deduplicates to ABORT.
        let record = RpcRecord {
            table_id: request.table_id,
            key_hash: request.key_hash,
            lease_id: request.lease_id,
            rpc_id: request.rpc_id,
            ack_id: 0,
            result: vec![TxVote::Abort.code()],
        };
        let Some(reference) = self.log.append(LogEntryType::RpcRecord, &record.encode()) else {
            return TxRequestAbortResponse {
                status: Status::Retry,
                vote: TxVote::Abort,
            };
        };
        if let Err(err) = self.log.sync_changes() {
            tracing::error!(error = ?err, "sync of abort fence failed");
            return TxRequestAbortResponse {
                status: Status::InternalError,
                vote: TxVote::Abort,
            };
        }
        self.rpc_results
            .recover_record(request.lease_id, request.rpc_id, 0, reference);
        TxRequestAbortResponse {
            status: Status::Ok,
            vote: TxVote::Abort,
        }
    }

    async fn tx_hint_failed(&self, request: TxHintFailedRequest) -> StatusResponse {
        let status = self
            .tx_recovery
            .handle_tx_hint_failed(request.lease_id, request.participants);
        if status.is_ok() {
            self.tx_recovery.process_pending().await;
        }
        StatusResponse { status }
    }
}

/// Build a participant entry for a primary key.
pub fn participant(table_id: u64, key: &[u8], rpc_id: u64) -> Participant {
    Participant {
        table_id,
        key_hash: key_hash(table_id, key),
        rpc_id,
    }
}
