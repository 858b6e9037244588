//! Driver for completing abandoned transactions.
//!
//! A master that owns the first participant of a transaction is that
//! transaction's recovery manager. When peers hint that the client may be
//! dead (`tx_hint_failed`), or when a TxDecisionRecord is replayed during
//! crash recovery, the manager collects prepare outcomes from every
//! participant, appends a durable decision record, and drives the decision
//! to all participants.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::cluster::{MasterClient, ServerId, TxVote};
use crate::log::Log;
use crate::records::{LogEntryType, Participant, TxDecision, TxDecisionRecord};
use crate::status::Status;
use crate::tablet::{TabletManager, TabletState};

struct PendingRecovery {
    lease_id: u64,
    participants: Vec<Participant>,
    /// Present when the decision is already durable (replayed record) and
    /// only needs re-delivery.
    decision: Option<TxDecision>,
}

struct RecoveryState {
    in_progress: HashSet<(u64, u64)>,
    pending: Vec<PendingRecovery>,
}

pub struct TxRecoveryManager {
    server_id: ServerId,
    log: Arc<Log>,
    tablets: Arc<TabletManager>,
    peers: Arc<dyn MasterClient>,
    state: Mutex<RecoveryState>,
}

impl TxRecoveryManager {
    pub fn new(
        server_id: ServerId,
        log: Arc<Log>,
        tablets: Arc<TabletManager>,
        peers: Arc<dyn MasterClient>,
    ) -> Self {
        Self {
            server_id,
            log,
            tablets,
            peers,
            state: Mutex::new(RecoveryState {
                in_progress: HashSet::new(),
                pending: Vec::new(),
            }),
        }
    }

    /// Handle a TxHintFailed message. Only the owner of the first
    /// participant's tablet acts on the hint.
    pub fn handle_tx_hint_failed(&self, lease_id: u64, participants: Vec<Participant>) -> Status {
        let Some(first) = participants.first() else {
            return Status::RequestFormatError;
        };
        match self.tablets.get_tablet(first.table_id, first.key_hash) {
            Some(tablet) if tablet.state == TabletState::Normal => {}
            _ => return Status::UnknownTablet,
        }
        self.enqueue(lease_id, participants, None);
        Status::Ok
    }

    /// Re-queue a decision replayed from the log; delivery resumes once this
    /// master is serving.
    pub fn recover_decision(&self, record: TxDecisionRecord) {
        self.enqueue(record.lease_id, record.participants, Some(record.decision));
    }

    fn enqueue(&self, lease_id: u64, participants: Vec<Participant>, decision: Option<TxDecision>) {
        let Some(first) = participants.first() else {
            return;
        };
        let tx_key = (lease_id, first.rpc_id);
        let mut state = self.state.lock().expect("tx recovery lock");
        if !state.in_progress.insert(tx_key) {
            return;
        }
        state.pending.push(PendingRecovery {
            lease_id,
            participants,
            decision,
        });
    }

    /// Run every queued recovery to completion. A participant that cannot be
    /// reached leaves its transaction eligible for a later hint.
    pub async fn process_pending(&self) {
        loop {
            let next = {
                let mut state = self.state.lock().expect("tx recovery lock");
                state.pending.pop()
            };
            let Some(recovery) = next else {
                return;
            };
            let tx_key = (
                recovery.lease_id,
                recovery.participants.first().map(|p| p.rpc_id).unwrap_or(0),
            );
            if let Err(err) = self.recover_transaction(recovery).await {
                tracing::warn!(error = ?err, server_id = %self.server_id,
                    "transaction recovery attempt failed");
            }
            self.state
                .lock()
                .expect("tx recovery lock")
                .in_progress
                .remove(&tx_key);
        }
    }

    async fn recover_transaction(&self, recovery: PendingRecovery) -> anyhow::Result<()> {
        let PendingRecovery {
            lease_id,
            participants,
            decision,
        } = recovery;

        let decision = match decision {
            Some(decision) => decision,
            None => {
                let decision = self.collect_decision(lease_id, &participants).await?;
                self.append_decision_record(lease_id, &participants, decision)?;
                decision
            }
        };

        for participant in &participants {
            let status = self
                .peers
                .tx_decision(
                    participant.table_id,
                    participant.key_hash,
                    lease_id,
                    decision,
                    vec![*participant],
                )
                .await?;
            if !status.is_ok() {
                tracing::warn!(lease_id, table_id = participant.table_id, ?status,
                    "participant rejected recovered tx decision");
            }
        }
        tracing::info!(lease_id, ?decision, participants = participants.len(),
            "completed abandoned transaction");
        Ok(())
    }

    /// COMMIT only when every participant reports a durable COMMIT vote; any
    /// abort fence or missing prepare forces ABORT.
    async fn collect_decision(
        &self,
        lease_id: u64,
        participants: &[Participant],
    ) -> anyhow::Result<TxDecision> {
        for participant in participants {
            let vote = self
                .peers
                .tx_request_abort(
                    participant.table_id,
                    participant.key_hash,
                    lease_id,
                    participant.rpc_id,
                )
                .await?;
            if vote == TxVote::Abort {
                return Ok(TxDecision::Abort);
            }
        }
        Ok(TxDecision::Commit)
    }

    fn append_decision_record(
        &self,
        lease_id: u64,
        participants: &[Participant],
        decision: TxDecision,
    ) -> anyhow::Result<()> {
        let first = participants
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty participant list"))?;
        let record = TxDecisionRecord {
            table_id: first.table_id,
            key_hash: first.key_hash,
            lease_id,
            decision,
            participants: participants.to_vec(),
        };
        self.log
            .append(LogEntryType::TxDecision, &record.encode())
            .ok_or_else(|| anyhow::anyhow!("log full while appending tx decision record"))?;
        self.log.sync_changes()
    }
}
