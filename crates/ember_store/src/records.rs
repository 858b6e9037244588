//! Typed log-entry encodings.
//!
//! Every record encodes to a length-prefixed big-endian byte layout; the
//! per-entry checksum lives in the segment framing (`log` module), so the
//! codecs here only have to be unambiguous and reject truncated input.

use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::key::{key_hash, Key, KeyHash, TableId};

/// Tag byte identifying the payload type of a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogEntryType {
    Object,
    Tombstone,
    PreparedOp,
    PreparedOpTombstone,
    RpcRecord,
    TxDecision,
}

impl LogEntryType {
    pub fn tag(self) -> u8 {
        match self {
            LogEntryType::Object => 1,
            LogEntryType::Tombstone => 2,
            LogEntryType::PreparedOp => 3,
            LogEntryType::PreparedOpTombstone => 4,
            LogEntryType::RpcRecord => 5,
            LogEntryType::TxDecision => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => LogEntryType::Object,
            2 => LogEntryType::Tombstone,
            3 => LogEntryType::PreparedOp,
            4 => LogEntryType::PreparedOpTombstone,
            5 => LogEntryType::RpcRecord,
            6 => LogEntryType::TxDecision,
            _ => return None,
        })
    }
}

/// A stored object: one primary key, optional secondary keys, and a value.
///
/// Key 0 is the primary key; keys 1..n feed secondary indexes. The version is
/// monotonic per primary key across the object's whole lifetime, including
/// across delete/recreate cycles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub table_id: TableId,
    pub version: u64,
    pub timestamp: u64,
    pub keys: Vec<Vec<u8>>,
    pub value: Vec<u8>,
}

impl Object {
    pub fn new(table_id: TableId, keys: Vec<Vec<u8>>, value: Vec<u8>) -> Self {
        Self {
            table_id,
            version: 0,
            timestamp: 0,
            keys,
            value,
        }
    }

    /// Convenience constructor for the common single-key case.
    pub fn with_single_key(table_id: TableId, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(table_id, vec![key.into()], value.into())
    }

    pub fn primary_key(&self) -> &[u8] {
        &self.keys[0]
    }

    pub fn key(&self) -> Key {
        Key::new(self.table_id, self.primary_key().to_vec())
    }

    pub fn key_hash(&self) -> KeyHash {
        key_hash(self.table_id, self.primary_key())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut size = 8 + 8 + 8 + 1;
        for key in &self.keys {
            size += 2 + key.len();
        }
        size += self.value.len();

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&self.table_id.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.push(self.keys.len() as u8);
        for key in &self.keys {
            out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        }
        for key in &self.keys {
            out.extend_from_slice(key);
        }
        out.extend_from_slice(&self.value);
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let table_id = read_u64(data, &mut offset)?;
        let version = read_u64(data, &mut offset)?;
        let timestamp = read_u64(data, &mut offset)?;
        let key_count = read_u8(data, &mut offset)? as usize;
        ensure!(key_count >= 1, "object must carry a primary key");
        let mut lengths = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            lengths.push(read_u16(data, &mut offset)? as usize);
        }
        let mut keys = Vec::with_capacity(key_count);
        for len in lengths {
            ensure!(offset + len <= data.len(), "short object key");
            keys.push(data[offset..offset + len].to_vec());
            offset += len;
        }
        let value = data[offset..].to_vec();
        Ok(Self {
            table_id,
            version,
            timestamp,
            keys,
            value,
        })
    }
}

/// Marker that a particular version of an object was deleted or overwritten.
///
/// `segment_id` names the segment that held the live object, so replay can
/// order a tombstone against the object entries it supersedes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tombstone {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub version: u64,
    pub segment_id: u64,
}

impl Tombstone {
    pub fn key_hash(&self) -> KeyHash {
        key_hash(self.table_id, &self.key)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 + 8 + 2 + self.key.len());
        out.extend_from_slice(&self.table_id.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.segment_id.to_be_bytes());
        out.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.key);
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let table_id = read_u64(data, &mut offset)?;
        let version = read_u64(data, &mut offset)?;
        let segment_id = read_u64(data, &mut offset)?;
        let key_len = read_u16(data, &mut offset)? as usize;
        ensure!(offset + key_len <= data.len(), "short tombstone key");
        let key = data[offset..offset + key_len].to_vec();
        Ok(Self {
            table_id,
            key,
            version,
            segment_id,
        })
    }
}

/// Operation kind staged by a transaction prepare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOpType {
    Read,
    Remove,
    Write,
}

impl TxOpType {
    fn tag(self) -> u8 {
        match self {
            TxOpType::Read => 0,
            TxOpType::Remove => 1,
            TxOpType::Write => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => TxOpType::Read,
            1 => TxOpType::Remove,
            2 => TxOpType::Write,
            _ => return None,
        })
    }
}

/// One member of a transaction's participant list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub table_id: TableId,
    pub key_hash: KeyHash,
    pub rpc_id: u64,
}

fn encode_participants(out: &mut Vec<u8>, participants: &[Participant]) {
    out.extend_from_slice(&(participants.len() as u32).to_be_bytes());
    for p in participants {
        out.extend_from_slice(&p.table_id.to_be_bytes());
        out.extend_from_slice(&p.key_hash.to_be_bytes());
        out.extend_from_slice(&p.rpc_id.to_be_bytes());
    }
}

fn decode_participants(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<Participant>> {
    let count = read_u32(data, offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(Participant {
            table_id: read_u64(data, offset)?,
            key_hash: read_u64(data, offset)?,
            rpc_id: read_u64(data, offset)?,
        });
    }
    Ok(out)
}

/// A transactional operation staged in the log by a COMMIT prepare vote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedOp {
    pub op: TxOpType,
    pub lease_id: u64,
    pub rpc_id: u64,
    pub participants: Vec<Participant>,
    pub object: Object,
}

impl PreparedOp {
    pub fn encode(&self) -> Vec<u8> {
        let object = self.object.encode();
        let mut out = Vec::with_capacity(1 + 8 + 8 + 4 + self.participants.len() * 24 + 4 + object.len());
        out.push(self.op.tag());
        out.extend_from_slice(&self.lease_id.to_be_bytes());
        out.extend_from_slice(&self.rpc_id.to_be_bytes());
        encode_participants(&mut out, &self.participants);
        out.extend_from_slice(&(object.len() as u32).to_be_bytes());
        out.extend_from_slice(&object);
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let op_tag = read_u8(data, &mut offset)?;
        let op = TxOpType::from_tag(op_tag)
            .ok_or_else(|| anyhow::anyhow!("unknown prepared op tag {op_tag}"))?;
        let lease_id = read_u64(data, &mut offset)?;
        let rpc_id = read_u64(data, &mut offset)?;
        let participants = decode_participants(data, &mut offset)?;
        let object_len = read_u32(data, &mut offset)? as usize;
        ensure!(offset + object_len <= data.len(), "short prepared op object");
        let object = Object::decode(&data[offset..offset + object_len])?;
        Ok(Self {
            op,
            lease_id,
            rpc_id,
            participants,
            object,
        })
    }
}

/// Marker that a prepared op was finalized; suppresses re-registration of the
/// matching PreparedOp during replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedOpTombstone {
    pub lease_id: u64,
    pub rpc_id: u64,
    pub key_hash: KeyHash,
    pub segment_id: u64,
}

impl PreparedOpTombstone {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&self.lease_id.to_be_bytes());
        out.extend_from_slice(&self.rpc_id.to_be_bytes());
        out.extend_from_slice(&self.key_hash.to_be_bytes());
        out.extend_from_slice(&self.segment_id.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        Ok(Self {
            lease_id: read_u64(data, &mut offset)?,
            rpc_id: read_u64(data, &mut offset)?,
            key_hash: read_u64(data, &mut offset)?,
            segment_id: read_u64(data, &mut offset)?,
        })
    }
}

/// Log-resident record of a completed linearizable RPC. The result blob is
/// the canonical response returned to every retry of (lease_id, rpc_id).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcRecord {
    pub table_id: TableId,
    pub key_hash: KeyHash,
    pub lease_id: u64,
    pub rpc_id: u64,
    pub ack_id: u64,
    pub result: Vec<u8>,
}

impl RpcRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 * 5 + 4 + self.result.len());
        out.extend_from_slice(&self.table_id.to_be_bytes());
        out.extend_from_slice(&self.key_hash.to_be_bytes());
        out.extend_from_slice(&self.lease_id.to_be_bytes());
        out.extend_from_slice(&self.rpc_id.to_be_bytes());
        out.extend_from_slice(&self.ack_id.to_be_bytes());
        out.extend_from_slice(&(self.result.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.result);
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let table_id = read_u64(data, &mut offset)?;
        let key_hash = read_u64(data, &mut offset)?;
        let lease_id = read_u64(data, &mut offset)?;
        let rpc_id = read_u64(data, &mut offset)?;
        let ack_id = read_u64(data, &mut offset)?;
        let result_len = read_u32(data, &mut offset)? as usize;
        ensure!(offset + result_len <= data.len(), "short rpc record result");
        let result = data[offset..offset + result_len].to_vec();
        Ok(Self {
            table_id,
            key_hash,
            lease_id,
            rpc_id,
            ack_id,
            result,
        })
    }
}

/// Final verdict for a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxDecision {
    Commit,
    Abort,
}

impl TxDecision {
    fn tag(self) -> u8 {
        match self {
            TxDecision::Commit => 0,
            TxDecision::Abort => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => TxDecision::Commit,
            1 => TxDecision::Abort,
            _ => return None,
        })
    }
}

/// Durable record of a transaction decision, appended before the decision is
/// driven to participants so a crash cannot orphan the transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxDecisionRecord {
    pub table_id: TableId,
    pub key_hash: KeyHash,
    pub lease_id: u64,
    pub decision: TxDecision,
    pub participants: Vec<Participant>,
}

impl TxDecisionRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 + 8 + 1 + 4 + self.participants.len() * 24);
        out.extend_from_slice(&self.table_id.to_be_bytes());
        out.extend_from_slice(&self.key_hash.to_be_bytes());
        out.extend_from_slice(&self.lease_id.to_be_bytes());
        out.push(self.decision.tag());
        encode_participants(&mut out, &self.participants);
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let table_id = read_u64(data, &mut offset)?;
        let key_hash = read_u64(data, &mut offset)?;
        let lease_id = read_u64(data, &mut offset)?;
        let decision_tag = read_u8(data, &mut offset)?;
        let decision = TxDecision::from_tag(decision_tag)
            .ok_or_else(|| anyhow::anyhow!("unknown tx decision tag {decision_tag}"))?;
        let participants = decode_participants(data, &mut offset)?;
        Ok(Self {
            table_id,
            key_hash,
            lease_id,
            decision,
            participants,
        })
    }
}

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    ensure!(*offset + 1 <= data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

pub(crate) fn read_u16(data: &[u8], offset: &mut usize) -> anyhow::Result<u16> {
    ensure!(*offset + 2 <= data.len(), "short u16");
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&data[*offset..*offset + 2]);
    *offset += 2;
    Ok(u16::from_be_bytes(buf))
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

/// Current wall-clock time in whole seconds, used to stamp objects.
pub fn wall_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
