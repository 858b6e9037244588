//! Tablet migration and indexlet split-and-migration.
//!
//! Both operations run the same two-phase protocol: phase 1 walks the log in
//! the background and ships matching live entries to the destination in
//! transfer segments; phase 2 locks out new writes, drains the in-flight
//! ones with the process-wide epoch counter, and re-scans the small window of
//! entries that raced phase 1. The destination replays each shipped segment
//! into a side log and commits it atomically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::cluster::{CoordinatorClient, MasterClient, MigrationData, ServerId};
use crate::epoch::{EpochTracker, RpcEpochGuard};
use crate::indexlet::IndexletManager;
use crate::key::{Key, TableId};
use crate::log::{IterItem, Log, LogIterator, Segment, SideLog, SegmentIterator};
use crate::object_manager::ObjectManager;
use crate::protocol::{MigrateTabletRequest, SplitAndMigrateIndexletRequest};
use crate::records::{LogEntryType, Object, Tombstone, TxDecisionRecord};
use crate::status::Status;
use crate::tablet::{TabletManager, TabletState};

pub struct MigrationEngine {
    server_id: ServerId,
    log: Arc<Log>,
    objects: Arc<ObjectManager>,
    tablets: Arc<TabletManager>,
    indexlets: Arc<IndexletManager>,
    epochs: Arc<EpochTracker>,
    peers: Arc<dyn MasterClient>,
    coordinator: Arc<dyn CoordinatorClient>,
    drain_deadline: Duration,
}

/// Accumulates entries into transfer segments and ships each one as it
/// fills. Entry counts are kept for the completion log line.
struct Transfer {
    segment: Option<Segment>,
    capacity: usize,
    objects_sent: u64,
    tombstones_sent: u64,
    decisions_sent: u64,
    bytes_sent: u64,
}

impl Transfer {
    fn new(capacity: usize) -> Self {
        Self {
            segment: None,
            capacity,
            objects_sent: 0,
            tombstones_sent: 0,
            decisions_sent: 0,
            bytes_sent: 0,
        }
    }

    fn count(&mut self, entry_type: LogEntryType, bytes: usize) {
        match entry_type {
            LogEntryType::Object => self.objects_sent += 1,
            LogEntryType::Tombstone => self.tombstones_sent += 1,
            LogEntryType::TxDecision => self.decisions_sent += 1,
            _ => {}
        }
        self.bytes_sent += bytes as u64;
    }
}

impl MigrationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: ServerId,
        log: Arc<Log>,
        objects: Arc<ObjectManager>,
        tablets: Arc<TabletManager>,
        indexlets: Arc<IndexletManager>,
        epochs: Arc<EpochTracker>,
        peers: Arc<dyn MasterClient>,
        coordinator: Arc<dyn CoordinatorClient>,
        drain_deadline: Duration,
    ) -> Self {
        Self {
            server_id,
            log,
            objects,
            tablets,
            indexlets,
            epochs,
            peers,
            coordinator,
            drain_deadline,
        }
    }

    /// Ship the current transfer segment (if any) to `target` and reset it.
    async fn ship(
        &self,
        transfer: &mut Transfer,
        target: ServerId,
        table_id: TableId,
        first_key_hash: u64,
        indexlet: Option<(&[u8], TableId, u8)>,
    ) -> Result<(), Status> {
        let Some(mut segment) = transfer.segment.take() else {
            return Ok(());
        };
        if segment.is_empty() {
            return Ok(());
        }
        segment.close();
        let certificate = segment.certificate();
        let data = MigrationData {
            table_id,
            first_key_hash,
            tablet_first_key: indexlet.map(|(key, _, _)| key.to_vec()).unwrap_or_default(),
            segment_length: segment.len(),
            segment: segment.data().to_vec(),
            certificate,
            is_indexlet_data: indexlet.is_some(),
            data_table_id: indexlet.map(|(_, table, _)| table).unwrap_or(0),
            index_id: indexlet.map(|(_, _, index)| index).unwrap_or(0),
        };
        tracing::debug!(target = %target, bytes = data.segment_length, "sending migration segment");
        match self.peers.receive_migration_data(target, data).await {
            Ok(status) if status.is_ok() => Ok(()),
            Ok(status) => Err(status),
            Err(err) => {
                tracing::warn!(error = ?err, target = %target, "migration data transfer failed");
                Err(Status::InternalError)
            }
        }
    }

    /// Append one entry to the transfer segment, shipping and retrying once
    /// when it does not fit. An entry too large for an empty segment is an
    /// internal error.
    async fn append_to_transfer(
        &self,
        transfer: &mut Transfer,
        entry_type: LogEntryType,
        payload: &[u8],
        target: ServerId,
        table_id: TableId,
        first_key_hash: u64,
        indexlet: Option<(&[u8], TableId, u8)>,
    ) -> Result<(), Status> {
        transfer.count(entry_type, payload.len());
        if transfer.segment.is_none() {
            transfer.segment = Some(Segment::transfer(transfer.capacity));
        }
        if transfer
            .segment
            .as_mut()
            .expect("transfer segment")
            .append(entry_type, payload)
            .is_some()
        {
            return Ok(());
        }

        self.ship(transfer, target, table_id, first_key_hash, indexlet).await?;
        transfer.segment = Some(Segment::transfer(transfer.capacity));
        if transfer
            .segment
            .as_mut()
            .expect("transfer segment")
            .append(entry_type, payload)
            .is_none()
        {
            tracing::error!(
                bytes = payload.len(),
                "migration failed: entry does not fit into an empty segment"
            );
            return Err(Status::InternalError);
        }
        Ok(())
    }

    /// Copy one log entry to the transfer segment if it is live and belongs
    /// to the migrating range.
    async fn migrate_single_log_entry(
        &self,
        item: &IterItem,
        transfer: &mut Transfer,
        request: &MigrateTabletRequest,
    ) -> Result<(), Status> {
        let (entry_table, entry_hash, object) = match item.entry_type {
            LogEntryType::Object => {
                let object = match Object::decode(&item.payload) {
                    Ok(object) => object,
                    Err(_) => return Ok(()),
                };
                (object.table_id, object.key_hash(), Some(object))
            }
            LogEntryType::Tombstone => {
                let tombstone = match Tombstone::decode(&item.payload) {
                    Ok(tombstone) => tombstone,
                    Err(_) => return Ok(()),
                };
                (tombstone.table_id, tombstone.key_hash(), None)
            }
            LogEntryType::TxDecision => {
                let record = match TxDecisionRecord::decode(&item.payload) {
                    Ok(record) => record,
                    Err(_) => return Ok(()),
                };
                (record.table_id, record.key_hash, None)
            }
            // Other entry types never migrate.
            _ => return Ok(()),
        };

        if entry_table != request.table_id
            || entry_hash < request.start_hash
            || entry_hash > request.end_hash
        {
            return Ok(());
        }

        if let Some(object) = &object {
            // Only send objects the hash index still points at; anything
            // else is dead. Tombstones and decisions always ship, since an
            // object sent earlier may have died since.
            let key = Key::new(object.table_id, object.primary_key().to_vec());
            if !self.objects.key_points_at_reference(&key, item.reference) {
                return Ok(());
            }
        }

        self.append_to_transfer(
            transfer,
            item.entry_type,
            &item.payload,
            request.new_owner,
            request.table_id,
            request.start_hash,
            None,
        )
        .await
    }

    /// Drain in-flight writes: bump the process epoch, re-tag the calling
    /// RPC past it, and wait (bounded) until every older RPC retires.
    async fn drain_in_flight(&self, guard: &RpcEpochGuard) -> Result<(), Status> {
        let epoch = self.epochs.increment_epoch();
        guard.set_epoch(epoch + 1);
        let deadline = Instant::now() + self.drain_deadline;
        while self.epochs.earliest_outstanding() <= epoch {
            if Instant::now() >= deadline {
                tracing::error!(epoch, "migration write drain exceeded deadline");
                return Err(Status::InternalError);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    /// Migrate a tablet (or a range within one) to `new_owner`.
    pub async fn migrate_tablet(
        &self,
        request: MigrateTabletRequest,
        guard: &RpcEpochGuard,
    ) -> Status {
        // The range must fall within a single contiguous tablet we own.
        let Some(tablet) =
            self.tablets
                .get_tablet_covering_range(request.table_id, request.start_hash, request.end_hash)
        else {
            tracing::warn!(table_id = request.table_id, start = request.start_hash,
                end = request.end_hash, "migration request for range this master does not own");
            return Status::UnknownTablet;
        };
        if tablet.state != TabletState::Normal {
            return Status::Retry;
        }
        if request.new_owner == self.server_id {
            tracing::warn!("migrating to myself doesn't make much sense");
            return Status::RequestFormatError;
        }

        match self
            .peers
            .prep_for_migration(
                request.new_owner,
                request.table_id,
                request.start_hash,
                request.end_hash,
            )
            .await
        {
            Ok(status) if status.is_ok() => {}
            Ok(status) => return status,
            Err(err) => {
                tracing::warn!(error = ?err, "prep_for_migration failed");
                return Status::InternalError;
            }
        }
        let new_owner_log_head = match self.peers.get_head_of_log(request.new_owner).await {
            Ok(position) => position,
            Err(err) => {
                tracing::warn!(error = ?err, "could not fetch destination log head");
                return Status::InternalError;
            }
        };

        tracing::info!(table_id = request.table_id, start = request.start_hash,
            end = request.end_hash, new_owner = %request.new_owner, "migrating tablet");

        let mut transfer = Transfer::new(self.log.segment_size());
        let mut iter = LogIterator::new(Arc::clone(&self.log));

        // Phase 1: walk the log oldest-first until we reach the head.
        while let Some(item) = iter.current().cloned() {
            if iter.on_head() {
                break;
            }
            if let Err(status) = self.migrate_single_log_entry(&item, &mut transfer, &request).await {
                return status;
            }
            iter.step();
        }

        // Phase 2: block new writes and let the racing ones finish.
        if !self.tablets.change_state(
            tablet.table_id,
            tablet.start_hash,
            tablet.end_hash,
            TabletState::Normal,
            TabletState::LockedForMigration,
        ) {
            return Status::Retry;
        }
        if let Err(status) = self.drain_in_flight(guard).await {
            self.tablets.change_state(
                tablet.table_id,
                tablet.start_hash,
                tablet.end_hash,
                TabletState::LockedForMigration,
                TabletState::Normal,
            );
            return status;
        }

        let position = self.log.head_position();
        iter.refresh();
        while let Some(item) = iter.current().cloned() {
            if item.position() >= position {
                break;
            }
            if let Err(status) = self.migrate_single_log_entry(&item, &mut transfer, &request).await {
                return status;
            }
            iter.step();
        }

        if let Err(status) = self
            .ship(&mut transfer, request.new_owner, request.table_id, request.start_hash, None)
            .await
        {
            return status;
        }

        // All data is on the destination; let the coordinator repoint
        // ownership, then drop our copy.
        if let Err(err) = self
            .coordinator
            .reassign_tablet_ownership(
                request.table_id,
                tablet.start_hash,
                tablet.end_hash,
                request.new_owner,
                new_owner_log_head,
            )
            .await
        {
            tracing::error!(error = ?err, "tablet ownership reassignment failed");
            self.tablets.change_state(
                tablet.table_id,
                tablet.start_hash,
                tablet.end_hash,
                TabletState::LockedForMigration,
                TabletState::Normal,
            );
            return Status::InternalError;
        }

        tracing::info!(table_id = request.table_id,
            objects = transfer.objects_sent, tombstones = transfer.tombstones_sent,
            decisions = transfer.decisions_sent, bytes = transfer.bytes_sent,
            new_owner = %request.new_owner, "tablet migration succeeded");

        self.tablets
            .delete_tablet(tablet.table_id, tablet.start_hash, tablet.end_hash);
        self.objects.remove_orphaned_objects();
        Status::Ok
    }

    /// Copy one backing-table log entry if it belongs to the migrated index
    /// partition, rewriting its table id to the destination backing table.
    async fn migrate_single_index_entry(
        &self,
        item: &IterItem,
        transfer: &mut Transfer,
        request: &SplitAndMigrateIndexletRequest,
    ) -> Result<(), Status> {
        match item.entry_type {
            LogEntryType::Object => {
                let Ok(mut object) = Object::decode(&item.payload) else {
                    return Ok(());
                };
                if object.table_id != request.current_backing_table_id {
                    return Ok(());
                }
                if !self.indexlets.is_greater_or_equal(
                    &object,
                    request.table_id,
                    request.index_id,
                    &request.split_key,
                ) {
                    return Ok(());
                }
                let key = Key::new(object.table_id, object.primary_key().to_vec());
                if !self.objects.key_points_at_reference(&key, item.reference) {
                    return Ok(());
                }
                object.table_id = request.new_backing_table_id;
                let rewritten = object.encode();
                self.append_to_transfer(
                    transfer,
                    LogEntryType::Object,
                    &rewritten,
                    request.new_owner,
                    request.new_backing_table_id,
                    0,
                    Some((request.split_key.as_slice(), request.table_id, request.index_id)),
                )
                .await
            }
            LogEntryType::Tombstone => {
                let Ok(mut tombstone) = Tombstone::decode(&item.payload) else {
                    return Ok(());
                };
                if tombstone.table_id != request.current_backing_table_id {
                    return Ok(());
                }
                // The node a tombstone refers to is dead, so its index key
                // cannot be consulted; ship every backing-table tombstone to
                // preserve replay ordering on the destination.
                tombstone.table_id = request.new_backing_table_id;
                let rewritten = tombstone.encode();
                self.append_to_transfer(
                    transfer,
                    LogEntryType::Tombstone,
                    &rewritten,
                    request.new_owner,
                    request.new_backing_table_id,
                    0,
                    Some((request.split_key.as_slice(), request.table_id, request.index_id)),
                )
                .await
            }
            _ => Ok(()),
        }
    }

    /// Split the indexlet at `split_key` and migrate the upper partition to
    /// `new_owner`, rewriting entries onto a new backing table.
    pub async fn split_and_migrate_indexlet(
        &self,
        request: SplitAndMigrateIndexletRequest,
        guard: &RpcEpochGuard,
    ) -> Status {
        if !self
            .indexlets
            .has_indexlet(request.table_id, request.index_id, &request.split_key)
        {
            tracing::warn!(table_id = request.table_id, index_id = request.index_id,
                "split request for indexlet this master does not own");
            return Status::UnknownIndexlet;
        }
        if self
            .tablets
            .get_tablet(request.current_backing_table_id, 0)
            .is_none()
        {
            tracing::warn!(backing_table_id = request.current_backing_table_id,
                "split request without the indexlet's backing table");
            return Status::UnknownTablet;
        }
        if request.new_owner == self.server_id {
            return Status::RequestFormatError;
        }

        let first_not_owned = self
            .indexlets
            .first_not_owned_key(request.table_id, request.index_id, &request.split_key)
            .unwrap_or_default();
        match self
            .peers
            .prep_for_indexlet_migration(
                request.new_owner,
                request.table_id,
                request.index_id,
                request.new_backing_table_id,
                request.split_key.clone(),
                first_not_owned,
            )
            .await
        {
            Ok(status) if status.is_ok() => {}
            Ok(status) => return status,
            Err(err) => {
                tracing::warn!(error = ?err, "prep_for_indexlet_migration failed");
                return Status::InternalError;
            }
        }

        tracing::info!(table_id = request.table_id, index_id = request.index_id,
            new_owner = %request.new_owner, "migrating indexlet partition");

        let mut transfer = Transfer::new(self.log.segment_size());
        let mut iter = LogIterator::new(Arc::clone(&self.log));

        while let Some(item) = iter.current().cloned() {
            if iter.on_head() {
                break;
            }
            if let Err(status) = self
                .migrate_single_index_entry(&item, &mut transfer, &request)
                .await
            {
                return status;
            }
            iter.step();
        }

        // Disown the migrated partition before draining so no new index
        // writes can slip into it.
        let truncate_status =
            self.indexlets
                .truncate_indexlet(request.table_id, request.index_id, &request.split_key);
        if !truncate_status.is_ok() {
            return truncate_status;
        }
        if let Err(status) = self.drain_in_flight(guard).await {
            return status;
        }

        let position = self.log.head_position();
        iter.refresh();
        while let Some(item) = iter.current().cloned() {
            if item.position() >= position {
                break;
            }
            if let Err(status) = self
                .migrate_single_index_entry(&item, &mut transfer, &request)
                .await
            {
                return status;
            }
            iter.step();
        }

        if let Err(status) = self
            .ship(
                &mut transfer,
                request.new_owner,
                request.new_backing_table_id,
                0,
                Some((request.split_key.as_slice(), request.table_id, request.index_id)),
            )
            .await
        {
            return status;
        }

        tracing::info!(objects = transfer.objects_sent, tombstones = transfer.tombstones_sent,
            bytes = transfer.bytes_sent, "indexlet partition migration succeeded");
        Status::Ok
    }

    /// Destination side: replay a shipped segment into a side log and commit
    /// it. The tablet must have been prepped (RECOVERING) beforehand.
    pub fn receive_migration_data(&self, data: &MigrationData) -> Status {
        let Some(tablet) = self.tablets.get_tablet(data.table_id, data.first_key_hash) else {
            tracing::warn!(table_id = data.table_id, first_key_hash = data.first_key_hash,
                "migration data received for unknown tablet");
            return Status::UnknownTablet;
        };
        if tablet.state != TabletState::Recovering {
            tracing::warn!(state = ?tablet.state,
                "migration data received for tablet not in RECOVERING state");
            return Status::InternalError;
        }

        if data.segment.len() != data.segment_length as usize {
            tracing::error!(actual = data.segment.len(), declared = data.segment_length,
                "migration payload size does not match declared length");
            return Status::RequestFormatError;
        }
        let iter = match SegmentIterator::new(&data.segment, data.certificate) {
            Ok(iter) => iter,
            Err(err) => {
                tracing::error!(error = ?err, "migration segment failed integrity check");
                return Status::RequestFormatError;
            }
        };

        let Some(mut side_log) = SideLog::new(Arc::clone(&self.log)) else {
            return Status::Retry;
        };
        if data.is_indexlet_data {
            let mut next_node_ids = HashMap::new();
            next_node_ids.insert(data.table_id, 0u64);
            if let Err(err) = self
                .objects
                .replay_segment(&mut side_log, iter, Some(&mut next_node_ids))
            {
                tracing::error!(error = ?err, "failed to replay indexlet migration data");
                return Status::InternalError;
            }
            let highest = next_node_ids.get(&data.table_id).copied().unwrap_or(0);
            if highest > 0 {
                self.indexlets.set_next_node_id_if_higher(
                    data.data_table_id,
                    data.index_id,
                    &data.tablet_first_key,
                    highest + 1,
                );
            }
        } else if let Err(err) = self.objects.replay_segment(&mut side_log, iter, None) {
            tracing::error!(error = ?err, "failed to replay migration data");
            return Status::InternalError;
        }

        if let Err(err) = side_log.commit() {
            tracing::error!(error = ?err, "failed to commit received migration data");
            return Status::InternalError;
        }
        Status::Ok
    }
}
