//! Shared in-process cluster harness for integration tests.
//!
//! A `TestCluster` plays the roles of the coordinator, the peer-master
//! transport, and the backup fleet: master-to-master calls dispatch straight
//! into the target service, index and transaction traffic routes by
//! ownership, and recovery fetches read from a scripted backup store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ember_store::cluster::{
    BackupClient, BackupReadError, ClientLease, CoordinatorClient, MasterClient, MigrationData,
    RecoveryPartition, SegmentImage, ServerId, TxVote,
};
use ember_store::log::{NullReplicator, Position, Segment};
use ember_store::protocol::*;
use ember_store::records::{LogEntryType, Participant, TxDecision};
use ember_store::service::MasterService;
use ember_store::status::{RejectRules, Status};
use ember_store::{key_hash, MasterConfig, TableId, TabletState};

/// How one scripted backup responds to a recovery fetch.
pub enum BackupSegment {
    Image(SegmentImage),
    /// Image whose certificate no longer matches its bytes.
    Corrupt(SegmentImage),
    NotUp,
    Unreachable,
}

#[derive(Default)]
struct CoordinatorState {
    /// (recovery_id, server, successful) reports, in arrival order.
    recovery_reports: Vec<(u64, ServerId, bool)>,
    /// Recorded reassign_tablet_ownership calls.
    reassignments: Vec<(TableId, u64, u64, ServerId, Position)>,
}

pub struct TestCluster {
    masters: Mutex<HashMap<ServerId, Arc<MasterService>>>,
    backups: Mutex<HashMap<(ServerId, u64), BackupSegment>>,
    cluster_time: AtomicU64,
    cancel_next_recovery: AtomicBool,
    coordinator: Mutex<CoordinatorState>,
}

impl TestCluster {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            masters: Mutex::new(HashMap::new()),
            backups: Mutex::new(HashMap::new()),
            cluster_time: AtomicU64::new(1_000),
            cancel_next_recovery: AtomicBool::new(false),
            coordinator: Mutex::new(CoordinatorState::default()),
        })
    }

    /// Build a master wired to this cluster and register it.
    pub fn add_master(self: &Arc<Self>, id: u64) -> Arc<MasterService> {
        let server_id = ServerId(id);
        let service = MasterService::new(
            server_id,
            MasterConfig {
                segment_size: 16 * 1024,
                max_segments: 256,
                ..MasterConfig::default()
            },
            Arc::clone(self) as Arc<dyn CoordinatorClient>,
            Arc::clone(self) as Arc<dyn MasterClient>,
            Arc::clone(self) as Arc<dyn BackupClient>,
            Arc::new(NullReplicator),
        );
        service.init_once_enlisted();
        self.masters
            .lock()
            .expect("masters lock")
            .insert(server_id, Arc::clone(&service));
        service
    }

    pub fn master(&self, id: u64) -> Arc<MasterService> {
        self.masters
            .lock()
            .expect("masters lock")
            .get(&ServerId(id))
            .cloned()
            .expect("unknown master")
    }

    pub fn set_cluster_time(&self, timestamp: u64) {
        self.cluster_time.store(timestamp, Ordering::SeqCst);
    }

    pub fn cancel_next_recovery(&self) {
        self.cancel_next_recovery.store(true, Ordering::SeqCst);
    }

    pub fn install_backup_segment(&self, backup: u64, segment_id: u64, segment: BackupSegment) {
        self.backups
            .lock()
            .expect("backups lock")
            .insert((ServerId(backup), segment_id), segment);
    }

    pub fn recovery_reports(&self) -> Vec<(u64, ServerId, bool)> {
        self.coordinator
            .lock()
            .expect("coordinator lock")
            .recovery_reports
            .clone()
    }

    pub fn reassignments(&self) -> Vec<(TableId, u64, u64, ServerId, Position)> {
        self.coordinator
            .lock()
            .expect("coordinator lock")
            .reassignments
            .clone()
    }

    /// Master currently owning (table, key hash) in NORMAL state.
    fn owner_of(&self, table_id: TableId, hash: u64) -> Option<Arc<MasterService>> {
        let masters = self.masters.lock().expect("masters lock");
        masters
            .values()
            .find(|master| {
                master
                    .tablets()
                    .get_tablet(table_id, hash)
                    .map(|tablet| tablet.state == TabletState::Normal)
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn indexlet_owner(&self, table_id: TableId, index_id: u8, key: &[u8]) -> Option<Arc<MasterService>> {
        let masters = self.masters.lock().expect("masters lock");
        masters
            .values()
            .find(|master| master.indexlets().has_indexlet(table_id, index_id, key))
            .cloned()
    }
}

#[async_trait]
impl CoordinatorClient for TestCluster {
    async fn get_lease_info(&self, lease_id: u64) -> anyhow::Result<ClientLease> {
        Ok(ClientLease {
            lease_id,
            lease_term: u64::MAX / 2,
            timestamp: self.cluster_time.load(Ordering::SeqCst),
        })
    }

    async fn reassign_tablet_ownership(
        &self,
        table_id: TableId,
        start_hash: u64,
        end_hash: u64,
        new_owner: ServerId,
        ctime: Position,
    ) -> anyhow::Result<()> {
        self.coordinator
            .lock()
            .expect("coordinator lock")
            .reassignments
            .push((table_id, start_hash, end_hash, new_owner, ctime));
        // The real coordinator follows up by telling the new owner to take
        // the tablet; do the same so it starts serving.
        let master = self.master(new_owner.0);
        let response = master
            .dispatch(Request::TakeTabletOwnership(TakeTabletOwnershipRequest {
                table_id,
                start_hash,
                end_hash,
            }))
            .await;
        let took = matches!(
            &response,
            Ok(Response::Status(StatusResponse { status: Status::Ok }))
        );
        anyhow::ensure!(took, "take after reassignment failed: {response:?}");
        Ok(())
    }

    async fn recovery_master_finished(
        &self,
        recovery_id: u64,
        server_id: ServerId,
        _partition: &RecoveryPartition,
        successful: bool,
    ) -> anyhow::Result<bool> {
        self.coordinator
            .lock()
            .expect("coordinator lock")
            .recovery_reports
            .push((recovery_id, server_id, successful));
        Ok(self.cancel_next_recovery.swap(false, Ordering::SeqCst))
    }
}

#[async_trait]
impl MasterClient for TestCluster {
    async fn prep_for_migration(
        &self,
        target: ServerId,
        table_id: TableId,
        start_hash: u64,
        end_hash: u64,
    ) -> anyhow::Result<Status> {
        let response = self
            .master(target.0)
            .dispatch(Request::PrepForMigration(PrepForMigrationRequest {
                table_id,
                start_hash,
                end_hash,
            }))
            .await;
        Ok(status_of(response))
    }

    async fn prep_for_indexlet_migration(
        &self,
        target: ServerId,
        table_id: TableId,
        index_id: u8,
        backing_table_id: TableId,
        first_key: Vec<u8>,
        first_not_owned_key: Vec<u8>,
    ) -> anyhow::Result<Status> {
        let response = self
            .master(target.0)
            .dispatch(Request::PrepForIndexletMigration(
                PrepForIndexletMigrationRequest {
                    table_id,
                    index_id,
                    backing_table_id,
                    first_key,
                    first_not_owned_key,
                },
            ))
            .await;
        Ok(status_of(response))
    }

    async fn get_head_of_log(&self, target: ServerId) -> anyhow::Result<Position> {
        match self.master(target.0).dispatch(Request::GetHeadOfLog).await {
            Ok(Response::GetHeadOfLog(response)) => Ok(response.head),
            other => anyhow::bail!("unexpected get_head_of_log response: {other:?}"),
        }
    }

    async fn receive_migration_data(
        &self,
        target: ServerId,
        data: MigrationData,
    ) -> anyhow::Result<Status> {
        let response = self
            .master(target.0)
            .dispatch(Request::ReceiveMigrationData(data))
            .await;
        Ok(status_of(response))
    }

    async fn insert_index_entry(
        &self,
        table_id: TableId,
        index_id: u8,
        index_key: Vec<u8>,
        primary_key_hash: u64,
    ) -> anyhow::Result<Status> {
        let Some(master) = self.indexlet_owner(table_id, index_id, &index_key) else {
            return Ok(Status::UnknownIndexlet);
        };
        let response = master
            .dispatch(Request::InsertIndexEntry(IndexEntryRequest {
                table_id,
                index_id,
                index_key,
                primary_key_hash,
            }))
            .await;
        Ok(status_of(response))
    }

    async fn remove_index_entry(
        &self,
        table_id: TableId,
        index_id: u8,
        index_key: Vec<u8>,
        primary_key_hash: u64,
    ) -> anyhow::Result<Status> {
        let Some(master) = self.indexlet_owner(table_id, index_id, &index_key) else {
            return Ok(Status::UnknownIndexlet);
        };
        let response = master
            .dispatch(Request::RemoveIndexEntry(IndexEntryRequest {
                table_id,
                index_id,
                index_key,
                primary_key_hash,
            }))
            .await;
        Ok(status_of(response))
    }

    async fn tx_request_abort(
        &self,
        table_id: TableId,
        key_hash: u64,
        lease_id: u64,
        rpc_id: u64,
    ) -> anyhow::Result<TxVote> {
        let Some(master) = self.owner_of(table_id, key_hash) else {
            anyhow::bail!("no master owns participant tablet");
        };
        match master
            .dispatch(Request::TxRequestAbort(TxRequestAbortRequest {
                table_id,
                key_hash,
                lease_id,
                rpc_id,
            }))
            .await
        {
            Ok(Response::TxRequestAbort(response)) => Ok(response.vote),
            other => anyhow::bail!("unexpected tx_request_abort response: {other:?}"),
        }
    }

    async fn tx_decision(
        &self,
        table_id: TableId,
        key_hash: u64,
        lease_id: u64,
        decision: TxDecision,
        participants: Vec<Participant>,
    ) -> anyhow::Result<Status> {
        let Some(master) = self.owner_of(table_id, key_hash) else {
            anyhow::bail!("no master owns participant tablet");
        };
        let response = master
            .dispatch(Request::TxDecision(TxDecisionRequest {
                lease_id,
                decision,
                participants,
            }))
            .await;
        Ok(status_of(response))
    }
}

#[async_trait]
impl BackupClient for TestCluster {
    async fn get_recovery_data(
        &self,
        backup: ServerId,
        _recovery_id: u64,
        _crashed_master: ServerId,
        _partition_id: u64,
        segment_id: u64,
    ) -> Result<SegmentImage, BackupReadError> {
        let backups = self.backups.lock().expect("backups lock");
        match backups.get(&(backup, segment_id)) {
            Some(BackupSegment::Image(image)) => Ok(image.clone()),
            Some(BackupSegment::Corrupt(image)) => Ok(image.clone()),
            Some(BackupSegment::NotUp) => Err(BackupReadError::NotUp),
            Some(BackupSegment::Unreachable) => {
                Err(BackupReadError::Failed("connection refused".into()))
            }
            None => Err(BackupReadError::Failed(format!(
                "backup {backup} has no replica of segment {segment_id}"
            ))),
        }
    }
}

/// Extract the status from any response shape.
pub fn status_of(response: Result<Response, Status>) -> Status {
    match response {
        Err(status) => status,
        Ok(Response::Status(inner)) => inner.status,
        Ok(Response::Read(inner)) => inner.status,
        Ok(Response::Write(inner)) => inner.status,
        Ok(Response::Remove(inner)) => inner.status,
        Ok(Response::Increment(inner)) => inner.status,
        Ok(Response::Enumerate(inner)) => inner.status,
        Ok(Response::ReadHashes(inner)) => inner.status,
        Ok(Response::LookupIndexKeys(inner)) => inner.status,
        Ok(Response::GetHeadOfLog(inner)) => inner.status,
        Ok(Response::ServerStatistics(inner)) => inner.status,
        Ok(Response::TxPrepare(inner)) => inner.status,
        Ok(Response::TxRequestAbort(inner)) => inner.status,
        Ok(Response::MultiOp(_)) => Status::Ok,
    }
}

/// Build a segment image the way a backup would serve it.
pub fn build_segment_image(entries: &[(LogEntryType, Vec<u8>)]) -> SegmentImage {
    let mut segment = Segment::transfer(1 << 20);
    for (entry_type, payload) in entries {
        segment
            .append(*entry_type, payload)
            .expect("entry fits in test segment");
    }
    segment.close();
    SegmentImage {
        data: segment.data().to_vec(),
        certificate: segment.certificate(),
    }
}

/// Corrupt an image so its certificate check fails.
pub fn corrupt_image(mut image: SegmentImage) -> SegmentImage {
    if let Some(byte) = image.data.first_mut() {
        *byte ^= 0xff;
    }
    image
}

// Client-side request helpers.

pub async fn take_tablet(master: &MasterService, table_id: TableId, start: u64, end: u64) {
    let response = master
        .dispatch(Request::TakeTabletOwnership(TakeTabletOwnershipRequest {
            table_id,
            start_hash: start,
            end_hash: end,
        }))
        .await;
    assert_eq!(status_of(response), Status::Ok, "take_tablet failed");
}

pub async fn write(
    master: &MasterService,
    table_id: TableId,
    key: &[u8],
    value: &[u8],
) -> WriteResponse {
    write_full(master, table_id, vec![key.to_vec()], value, RejectRules::default(), 0, 0, 0).await
}

#[allow(clippy::too_many_arguments)]
pub async fn write_full(
    master: &MasterService,
    table_id: TableId,
    keys: Vec<Vec<u8>>,
    value: &[u8],
    reject_rules: RejectRules,
    lease_id: u64,
    rpc_id: u64,
    ack_id: u64,
) -> WriteResponse {
    let request = WriteRequest {
        table_id,
        keys,
        value: value.to_vec(),
        reject_rules,
        lease: ClientLease {
            lease_id,
            lease_term: u64::MAX / 2,
            timestamp: 2_000,
        },
        rpc_id,
        ack_id,
    };
    match master.dispatch(Request::Write(request)).await {
        Ok(Response::Write(response)) => response,
        Err(status) => WriteResponse { status, version: 0 },
        other => panic!("unexpected write response: {other:?}"),
    }
}

pub async fn read(master: &MasterService, table_id: TableId, key: &[u8]) -> ReadResponse {
    let request = ReadRequest {
        table_id,
        key: key.to_vec(),
        reject_rules: RejectRules::default(),
    };
    match master.dispatch(Request::Read(request)).await {
        Ok(Response::Read(response)) => response,
        Err(status) => ReadResponse {
            status,
            version: 0,
            payload: Default::default(),
        },
        other => panic!("unexpected read response: {other:?}"),
    }
}

pub async fn remove(master: &MasterService, table_id: TableId, key: &[u8]) -> RemoveResponse {
    let request = RemoveRequest {
        table_id,
        key: key.to_vec(),
        reject_rules: RejectRules::default(),
        lease: ClientLease::default(),
        rpc_id: 0,
        ack_id: 0,
    };
    match master.dispatch(Request::Remove(request)).await {
        Ok(Response::Remove(response)) => response,
        Err(status) => RemoveResponse { status, version: 0 },
        other => panic!("unexpected remove response: {other:?}"),
    }
}

pub async fn increment(
    master: &MasterService,
    table_id: TableId,
    key: &[u8],
    delta_int: i64,
    delta_double: f64,
    lease_id: u64,
    rpc_id: u64,
) -> IncrementResponse {
    let request = IncrementRequest {
        table_id,
        key: key.to_vec(),
        increment_int64: delta_int,
        increment_double: delta_double,
        reject_rules: RejectRules::default(),
        lease: ClientLease {
            lease_id,
            lease_term: u64::MAX / 2,
            timestamp: 2_000,
        },
        rpc_id,
        ack_id: 0,
    };
    match master.dispatch(Request::Increment(request)).await {
        Ok(Response::Increment(response)) => response,
        Err(status) => IncrementResponse {
            status,
            version: 0,
            new_value_int64: 0,
            new_value_double: 0.0,
        },
        other => panic!("unexpected increment response: {other:?}"),
    }
}

pub fn hash(table_id: TableId, key: &[u8]) -> u64 {
    key_hash(table_id, key)
}

/// Install a subscriber once so `EMBER_LOG=debug cargo test` shows events.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_env("EMBER_LOG")
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
