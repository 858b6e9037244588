//! Crash recovery: rebuild a partition of a crashed master from filtered
//! segment replicas fetched from backups.
//!
//! The replica list is a scoreboard. Up to `fetch_fanout` fetches run at
//! once; a successful replay marks every replica of that segment OK, a
//! failure marks just the fetched replica FAILED so a sibling becomes
//! eligible. The `not_started` cursor only moves forward and every replica
//! state is monotone, so the loop terminates in O(#replicas) completions.
//! Replayed entries accumulate in a SideLog whose commit is the atomic
//! durability point for the whole recovery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::cluster::{
    BackupClient, BackupReadError, ClusterClock, CoordinatorClient, RecoveryPartition,
    SegmentImage, ServerId,
};
use crate::indexlet::{IndexletManager, IndexletState};
use crate::key::TableId;
use crate::log::{Log, SegmentIterator, SideLog};
use crate::object_manager::{ObjectManager, ReplayOutOfSpace};
use crate::prepared::PreparedWrites;
use crate::protocol::{RecoverRequest, ReplicaLocator};
use crate::status::Status;
use crate::tablet::{TabletManager, TabletState};
use crate::tx_recovery::TxRecoveryManager;

/// Fetch/replay state of one replica in the scoreboard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaState {
    NotStarted,
    Waiting,
    Ok,
    Failed,
}

struct Replica {
    locator: ReplicaLocator,
    state: ReplicaState,
}

pub struct RecoveryEngine {
    server_id: ServerId,
    log: Arc<Log>,
    objects: Arc<ObjectManager>,
    tablets: Arc<TabletManager>,
    indexlets: Arc<IndexletManager>,
    prepared: Arc<PreparedWrites>,
    tx_recovery: Arc<TxRecoveryManager>,
    coordinator: Arc<dyn CoordinatorClient>,
    backups: Arc<dyn BackupClient>,
    clock: Arc<ClusterClock>,
    fetch_fanout: usize,
}

fn make_fetch(
    backups: Arc<dyn BackupClient>,
    idx: usize,
    locator: ReplicaLocator,
    recovery_id: u64,
    crashed_master: ServerId,
    partition_id: u64,
) -> BoxFuture<'static, (usize, Result<SegmentImage, BackupReadError>)> {
    Box::pin(async move {
        let result = backups
            .get_recovery_data(
                locator.backup_id,
                recovery_id,
                crashed_master,
                partition_id,
                locator.segment_id,
            )
            .await;
        (idx, result)
    })
}

impl RecoveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: ServerId,
        log: Arc<Log>,
        objects: Arc<ObjectManager>,
        tablets: Arc<TabletManager>,
        indexlets: Arc<IndexletManager>,
        prepared: Arc<PreparedWrites>,
        tx_recovery: Arc<TxRecoveryManager>,
        coordinator: Arc<dyn CoordinatorClient>,
        backups: Arc<dyn BackupClient>,
        clock: Arc<ClusterClock>,
        fetch_fanout: usize,
    ) -> Self {
        Self {
            server_id,
            log,
            objects,
            tablets,
            indexlets,
            prepared,
            tx_recovery,
            coordinator,
            backups,
            clock,
            fetch_fanout: fetch_fanout.max(1),
        }
    }

    /// Top-level recovery: install the partition, replay replicas, report to
    /// the coordinator, and either start serving or clean up.
    pub async fn recover(&self, request: RecoverRequest) -> Status {
        // A reserved partition id is a malformed request, not a kill switch.
        if request.partition_id == u64::MAX {
            return Status::RequestFormatError;
        }

        tracing::info!(recovery_id = request.recovery_id,
            crashed_master = %request.crashed_master, partition_id = request.partition_id,
            replicas = request.replicas.len(), "starting recovery");

        // Install the tablets being recovered; we do not own them yet.
        let mut installed = Vec::new();
        for tablet in &request.partition.tablets {
            if !self.tablets.add_tablet(
                tablet.table_id,
                tablet.start_hash,
                tablet.end_hash,
                TabletState::Recovering,
            ) {
                tracing::error!(table_id = tablet.table_id, start = tablet.start_hash,
                    end = tablet.end_hash, "recovery tablet overlaps an existing one");
                for t in &installed {
                    let &(table_id, start, end) = t;
                    self.tablets.delete_tablet(table_id, start, end);
                }
                return Status::InternalError;
            }
            installed.push((tablet.table_id, tablet.start_hash, tablet.end_hash));
        }

        // Raise the cluster clock to at least the coordinator's view before
        // any recovered data can be served, so linearizable retries never
        // observe a clock below what their client already saw.
        match self.coordinator.get_lease_info(0).await {
            Ok(lease) => self.clock.advance(lease.timestamp),
            Err(err) => {
                tracing::error!(error = ?err, "could not fetch cluster time from coordinator");
                for (table_id, start, end) in &installed {
                    self.tablets.delete_tablet(*table_id, *start, *end);
                }
                return Status::InternalError;
            }
        }

        // Record the head position before replay so tablet creation-time
        // metadata is stable.
        let head_of_log = self.log.roll_head_over();

        let mut next_node_ids: HashMap<TableId, u64> = request
            .partition
            .indexlets
            .iter()
            .map(|indexlet| (indexlet.backing_table_id, 0))
            .collect();
        let mut replicas: Vec<Replica> = request
            .replicas
            .iter()
            .map(|locator| Replica {
                locator: *locator,
                state: ReplicaState::NotStarted,
            })
            .collect();

        let successful = match self
            .replay_replicas(
                request.recovery_id,
                request.crashed_master,
                request.partition_id,
                &mut replicas,
                &mut next_node_ids,
            )
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(error = ?err, recovery_id = request.recovery_id,
                    "recovery replay failed");
                false
            }
        };

        if successful {
            // Install the recovered indexlets (still RECOVERING) with the
            // node-id floors observed during replay.
            for indexlet in &request.partition.indexlets {
                let next_node_id = next_node_ids
                    .get(&indexlet.backing_table_id)
                    .map(|highest| highest + 1)
                    .unwrap_or(1);
                self.indexlets.add_indexlet(
                    indexlet.table_id,
                    indexlet.index_id,
                    indexlet.backing_table_id,
                    indexlet.first_key.clone(),
                    indexlet.first_not_owned_key.clone(),
                    IndexletState::Recovering,
                    next_node_id,
                );
            }
        }

        // Report to the coordinator with ownership metadata filled in; it
        // decides whether we become the owner.
        let mut partition = request.partition.clone();
        for tablet in &mut partition.tablets {
            tablet.ctime = Some(head_of_log);
        }
        let cancelled = match self
            .coordinator
            .recovery_master_finished(request.recovery_id, self.server_id, &partition, successful)
            .await
        {
            Ok(cancelled) => cancelled,
            Err(err) => {
                tracing::error!(error = ?err, "recovery_master_finished failed");
                true
            }
        };

        if !cancelled && successful {
            // Re-grab all transaction locks before serving.
            self.prepared.regrab_locks_after_recovery(&self.log);

            for (table_id, start, end) in &installed {
                if !self.tablets.change_state(
                    *table_id,
                    *start,
                    *end,
                    TabletState::Recovering,
                    TabletState::Normal,
                ) {
                    tracing::error!(table_id = *table_id,
                        "could not promote recovered tablet to NORMAL");
                    return Status::InternalError;
                }
            }
            for indexlet in &request.partition.indexlets {
                if !self.indexlets.change_state(
                    indexlet.table_id,
                    indexlet.index_id,
                    &indexlet.first_key,
                    &indexlet.first_not_owned_key,
                    IndexletState::Recovering,
                    IndexletState::Normal,
                ) {
                    tracing::error!(table_id = indexlet.table_id, index_id = indexlet.index_id,
                        "could not promote recovered indexlet to NORMAL");
                    return Status::InternalError;
                }
            }

            // Replayed transaction decisions can be delivered now that the
            // tablets serve again.
            self.tx_recovery.process_pending().await;

            tracing::info!(recovery_id = request.recovery_id, "recovery complete");
            Status::Ok
        } else {
            tracing::warn!(recovery_id = request.recovery_id, successful, cancelled,
                "abandoning recovery; cleaning up partition");
            for (table_id, start, end) in &installed {
                self.tablets.delete_tablet(*table_id, *start, *end);
            }
            for indexlet in &request.partition.indexlets {
                self.indexlets.delete_indexlet(
                    indexlet.table_id,
                    indexlet.index_id,
                    &indexlet.first_key,
                    &indexlet.first_not_owned_key,
                );
            }
            self.objects.remove_orphaned_objects();
            if successful {
                Status::Ok
            } else {
                Status::InternalError
            }
        }
    }

    /// Fetch and replay every needed segment with bounded fan-out.
    async fn replay_replicas(
        &self,
        recovery_id: u64,
        crashed_master: ServerId,
        partition_id: u64,
        replicas: &mut [Replica],
        next_node_ids: &mut HashMap<TableId, u64>,
    ) -> anyhow::Result<()> {
        let mut side_log = SideLog::new(Arc::clone(&self.log))
            .ok_or_else(|| anyhow::anyhow!("log cannot host a recovery side log"))?;

        let mut running: HashSet<u64> = HashSet::new();
        let mut in_flight: FuturesUnordered<
            BoxFuture<'static, (usize, Result<SegmentImage, BackupReadError>)>,
        > = FuturesUnordered::new();
        let mut not_started = 0usize;

        // Fast sibling lookup for checking off a whole segment at once.
        let mut segment_to_indices: HashMap<u64, Vec<usize>> = HashMap::new();
        for (idx, replica) in replicas.iter().enumerate() {
            segment_to_indices
                .entry(replica.locator.segment_id)
                .or_default()
                .push(idx);
        }

        let launch_next = |replicas: &mut [Replica],
                           running: &mut HashSet<u64>,
                           in_flight: &mut FuturesUnordered<
            BoxFuture<'static, (usize, Result<SegmentImage, BackupReadError>)>,
        >,
                           not_started: usize|
         -> bool {
            for idx in not_started..replicas.len() {
                if replicas[idx].state != ReplicaState::NotStarted {
                    continue;
                }
                let segment_id = replicas[idx].locator.segment_id;
                if running.contains(&segment_id) {
                    continue;
                }
                tracing::debug!(segment_id, backup = %replicas[idx].locator.backup_id,
                    "starting recovery data fetch");
                replicas[idx].state = ReplicaState::Waiting;
                running.insert(segment_id);
                in_flight.push(make_fetch(
                    Arc::clone(&self.backups),
                    idx,
                    replicas[idx].locator,
                    recovery_id,
                    crashed_master,
                    partition_id,
                ));
                return true;
            }
            false
        };

        while in_flight.len() < self.fetch_fanout {
            if !launch_next(replicas, &mut running, &mut in_flight, not_started) {
                break;
            }
        }

        while let Some((idx, result)) = in_flight.next().await {
            let segment_id = replicas[idx].locator.segment_id;
            running.remove(&segment_id);

            match result {
                Ok(image) => {
                    let replayed = match SegmentIterator::new(&image.data, image.certificate) {
                        Ok(iter) => self.objects.replay_segment(
                            &mut side_log,
                            iter,
                            Some(&mut *next_node_ids),
                        ),
                        Err(err) => Err(err),
                    };
                    match replayed {
                        Ok(()) => {
                            tracing::debug!(segment_id, "segment replay complete");
                            for sibling in segment_to_indices
                                .get(&segment_id)
                                .into_iter()
                                .flatten()
                            {
                                replicas[*sibling].state = ReplicaState::Ok;
                            }
                        }
                        Err(err) if err.downcast_ref::<ReplayOutOfSpace>().is_some() => {
                            // No sibling can help when the log itself is
                            // full; abort the whole recovery.
                            return Err(err);
                        }
                        Err(err) => {
                            tracing::warn!(error = ?err, segment_id,
                                backup = %replicas[idx].locator.backup_id,
                                "recovery segment corrupted; trying next backup");
                            replicas[idx].state = ReplicaState::Failed;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, segment_id,
                        backup = %replicas[idx].locator.backup_id,
                        "recovery data fetch failed; trying next backup");
                    replicas[idx].state = ReplicaState::Failed;
                }
            }

            // Move the cursor up as far as possible, then refill the fetch
            // slots.
            while not_started < replicas.len()
                && replicas[not_started].state != ReplicaState::NotStarted
            {
                not_started += 1;
            }
            while in_flight.len() < self.fetch_fanout {
                if !launch_next(replicas, &mut running, &mut in_flight, not_started) {
                    break;
                }
            }
        }

        detect_segment_recovery_failure(crashed_master, partition_id, replicas)?;

        tracing::info!("committing recovery side log");
        side_log.commit()?;
        tracing::info!("recovery side log committed; recovered data is durable");
        Ok(())
    }
}

/// Verify that at least one replica of every distinct segment id replayed
/// successfully; otherwise the recovery is unsalvageable.
fn detect_segment_recovery_failure(
    crashed_master: ServerId,
    partition_id: u64,
    replicas: &[Replica],
) -> anyhow::Result<()> {
    let mut ok: HashSet<u64> = HashSet::new();
    let mut seen: HashSet<u64> = HashSet::new();
    for replica in replicas {
        seen.insert(replica.locator.segment_id);
        if replica.state == ReplicaState::Ok {
            ok.insert(replica.locator.segment_id);
        }
    }
    let failures: Vec<u64> = seen.difference(&ok).copied().collect();
    if failures.is_empty() {
        return Ok(());
    }
    for segment_id in &failures {
        tracing::error!(segment_id, crashed_master = %crashed_master, partition_id,
            "unable to recover segment");
    }
    anyhow::bail!(
        "segment recovery failed for master {crashed_master} partition {partition_id}: \
         no usable replica for segments {failures:?}"
    )
}
