//! Append-only segmented log, side-log staging, and iterators.
//!
//! Entries are framed as `[type u8][len u32][payload][crc32 u32]` inside
//! fixed-capacity segments. A closed segment is immutable. Durability is a
//! seam: `sync_changes` pushes every dirty segment through the configured
//! `SegmentReplicator` and returns once all of them are acknowledged.
//!
//! A `SideLog` stages entries into private segments that share the log's
//! id space (so references resolve immediately) but stay invisible to
//! iterators and replication until `commit`. Dropping an uncommitted side
//! log discards its segments without touching the main log.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::records::LogEntryType;

/// Per-entry framing overhead: tag + length prefix + trailing checksum.
const ENTRY_OVERHEAD: usize = 1 + 4 + 4;

/// A totally ordered location in the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub segment_id: u64,
    pub offset: u32,
}

impl Position {
    pub const ZERO: Position = Position {
        segment_id: 0,
        offset: 0,
    };
}

/// Stable pointer to a log entry. References stay valid across head
/// rollovers and side-log commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reference {
    pub segment_id: u64,
    pub offset: u32,
}

impl Reference {
    pub fn position(self) -> Position {
        Position {
            segment_id: self.segment_id,
            offset: self.offset,
        }
    }
}

/// Integrity summary for a segment image: how many bytes are valid and the
/// crc32 over them. Receivers verify this before replaying an image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub length: u32,
    pub checksum: u32,
}

/// One fixed-capacity chunk of the log.
pub struct Segment {
    id: u64,
    capacity: usize,
    data: Vec<u8>,
    closed: bool,
    staged: bool,
    dirty: bool,
}

impl Segment {
    fn new(id: u64, capacity: usize, staged: bool) -> Self {
        Self {
            id,
            capacity,
            data: Vec::with_capacity(capacity.min(64 * 1024)),
            closed: false,
            staged,
            dirty: false,
        }
    }

    /// Standalone segment used as a migration transfer container.
    pub fn transfer(capacity: usize) -> Self {
        Self::new(0, capacity, false)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append an entry, returning its offset, or `None` if it does not fit
    /// (or the segment is closed).
    pub fn append(&mut self, entry_type: LogEntryType, payload: &[u8]) -> Option<u32> {
        if self.closed {
            return None;
        }
        if self.data.len() + payload.len() + ENTRY_OVERHEAD > self.capacity {
            return None;
        }
        let offset = self.data.len() as u32;
        self.data.push(entry_type.tag());
        self.data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.data.extend_from_slice(payload);
        let checksum = crc32fast::hash(&self.data[offset as usize..]);
        self.data.extend_from_slice(&checksum.to_be_bytes());
        self.dirty = true;
        Some(offset)
    }

    fn fits(&self, total_entry_bytes: usize) -> bool {
        !self.closed && self.data.len() + total_entry_bytes <= self.capacity
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.dirty = true;
    }

    pub fn certificate(&self) -> Certificate {
        Certificate {
            length: self.data.len() as u32,
            checksum: crc32fast::hash(&self.data),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Decode the entry at `offset`, verifying its checksum. Returns the
    /// type, payload, and the offset of the following entry.
    fn read_entry(&self, offset: u32) -> anyhow::Result<(LogEntryType, &[u8], u32)> {
        read_framed_entry(&self.data, offset)
    }
}

fn read_framed_entry(data: &[u8], offset: u32) -> anyhow::Result<(LogEntryType, &[u8], u32)> {
    let start = offset as usize;
    ensure!(start + 5 <= data.len(), "entry header out of bounds");
    let entry_type = LogEntryType::from_tag(data[start])
        .ok_or_else(|| anyhow::anyhow!("unknown log entry tag {}", data[start]))?;
    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(&data[start + 1..start + 5]);
    let len = u32::from_be_bytes(len_buf) as usize;
    let payload_end = start + 5 + len;
    ensure!(payload_end + 4 <= data.len(), "entry payload out of bounds");
    let mut crc_buf = [0u8; 4];
    crc_buf.copy_from_slice(&data[payload_end..payload_end + 4]);
    let expected = u32::from_be_bytes(crc_buf);
    let actual = crc32fast::hash(&data[start..payload_end]);
    ensure!(actual == expected, "log entry checksum mismatch");
    Ok((
        entry_type,
        &data[start + 5..payload_end],
        (payload_end + 4) as u32,
    ))
}

/// Iterator over a raw segment image received from a peer or a backup.
/// Construction verifies the certificate; `next` verifies each entry.
pub struct SegmentIterator<'a> {
    data: &'a [u8],
    limit: u32,
    offset: u32,
}

impl<'a> SegmentIterator<'a> {
    pub fn new(data: &'a [u8], certificate: Certificate) -> anyhow::Result<Self> {
        ensure!(
            certificate.length as usize <= data.len(),
            "certificate length {} exceeds image size {}",
            certificate.length,
            data.len()
        );
        let covered = &data[..certificate.length as usize];
        ensure!(
            crc32fast::hash(covered) == certificate.checksum,
            "segment certificate checksum mismatch"
        );
        Ok(Self {
            data,
            limit: certificate.length,
            offset: 0,
        })
    }

    pub fn next_entry(&mut self) -> anyhow::Result<Option<(LogEntryType, &'a [u8])>> {
        if self.offset >= self.limit {
            return Ok(None);
        }
        let (entry_type, payload, next) = read_framed_entry(self.data, self.offset)?;
        ensure!(next <= self.limit, "entry crosses certificate boundary");
        self.offset = next;
        Ok(Some((entry_type, payload)))
    }
}

/// Durability seam between the log and the (out of scope) backup replication
/// engine. `replicate` must not return until the bytes are durable on the
/// configured number of replicas.
pub trait SegmentReplicator: Send + Sync {
    fn replicate(&self, segment_id: u64, data: &[u8], certificate: Certificate)
        -> anyhow::Result<()>;
}

/// Replicator used when a master runs without backups.
pub struct NullReplicator;

impl SegmentReplicator for NullReplicator {
    fn replicate(&self, _segment_id: u64, _data: &[u8], _certificate: Certificate) -> anyhow::Result<()> {
        Ok(())
    }
}

struct LogInner {
    segments: BTreeMap<u64, Segment>,
    head_id: u64,
}

/// The master's append-only entry store.
pub struct Log {
    inner: Mutex<LogInner>,
    replicator: Arc<dyn SegmentReplicator>,
    segment_size: usize,
    max_segments: usize,
    next_segment_id: AtomicU64,
}

/// One decoded entry produced by a `LogIterator`.
#[derive(Clone, Debug)]
pub struct IterItem {
    pub entry_type: LogEntryType,
    pub payload: Vec<u8>,
    pub reference: Reference,
    next: Position,
}

impl IterItem {
    pub fn position(&self) -> Position {
        self.reference.position()
    }
}

impl Log {
    pub fn new(segment_size: usize, max_segments: usize, replicator: Arc<dyn SegmentReplicator>) -> Self {
        let mut segments = BTreeMap::new();
        segments.insert(1, Segment::new(1, segment_size, false));
        Self {
            inner: Mutex::new(LogInner {
                segments,
                head_id: 1,
            }),
            replicator,
            segment_size,
            max_segments,
            next_segment_id: AtomicU64::new(2),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    fn alloc_segment_id(&self) -> u64 {
        self.next_segment_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Append a single entry to the head, rolling the head if needed.
    /// `None` means the log is out of capacity (caller maps this to RETRY).
    pub fn append(&self, entry_type: LogEntryType, payload: &[u8]) -> Option<Reference> {
        self.append_group(&[(entry_type, payload)]).map(|mut refs| refs.remove(0))
    }

    /// Append a group of entries so that all of them land in the same
    /// segment. Used to bundle an object with its tombstone and rpc record so
    /// replication can never observe half of the group.
    pub fn append_group(&self, entries: &[(LogEntryType, &[u8])]) -> Option<Vec<Reference>> {
        let total: usize = entries
            .iter()
            .map(|(_, payload)| payload.len() + ENTRY_OVERHEAD)
            .sum();
        if total > self.segment_size {
            return None;
        }

        let mut inner = self.inner.lock().expect("log lock");
        let head_id = inner.head_id;
        let head = inner.segments.get_mut(&head_id).expect("head segment");
        if !head.fits(total) {
            if inner.segments.values().filter(|s| !s.staged).count() >= self.max_segments {
                return None;
            }
            let head = inner.segments.get_mut(&head_id).expect("head segment");
            head.close();
            let new_id = self.alloc_segment_id();
            inner.segments.insert(new_id, Segment::new(new_id, self.segment_size, false));
            inner.head_id = new_id;
        }

        let head_id = inner.head_id;
        let head = inner.segments.get_mut(&head_id).expect("head segment");
        let mut refs = Vec::with_capacity(entries.len());
        for (entry_type, payload) in entries {
            let offset = head.append(*entry_type, payload)?;
            refs.push(Reference {
                segment_id: head_id,
                offset,
            });
        }
        Some(refs)
    }

    /// Fetch and decode the entry a reference points at.
    pub fn get_entry(&self, reference: Reference) -> Option<(LogEntryType, Vec<u8>)> {
        let inner = self.inner.lock().expect("log lock");
        let segment = inner.segments.get(&reference.segment_id)?;
        match segment.read_entry(reference.offset) {
            Ok((entry_type, payload, _)) => Some((entry_type, payload.to_vec())),
            Err(err) => {
                tracing::error!(error = ?err, segment_id = reference.segment_id,
                    offset = reference.offset, "corrupt log entry");
                None
            }
        }
    }

    pub fn head_position(&self) -> Position {
        let inner = self.inner.lock().expect("log lock");
        let head = inner.segments.get(&inner.head_id).expect("head segment");
        Position {
            segment_id: inner.head_id,
            offset: head.len(),
        }
    }

    pub fn head_segment_id(&self) -> u64 {
        self.inner.lock().expect("log lock").head_id
    }

    /// Close the head and open a fresh one, returning the new head position.
    /// The boundary is stable: nothing can be appended below it afterwards.
    pub fn roll_head_over(&self) -> Position {
        let mut inner = self.inner.lock().expect("log lock");
        let head_id = inner.head_id;
        inner.segments.get_mut(&head_id).expect("head segment").close();
        let new_id = self.alloc_segment_id();
        inner.segments.insert(new_id, Segment::new(new_id, self.segment_size, false));
        inner.head_id = new_id;
        Position {
            segment_id: new_id,
            offset: 0,
        }
    }

    /// Block until every append issued so far is durable on the replicas.
    pub fn sync_changes(&self) -> anyhow::Result<()> {
        let dirty: Vec<(u64, Vec<u8>, Certificate)> = {
            let mut inner = self.inner.lock().expect("log lock");
            let mut out = Vec::new();
            for segment in inner.segments.values_mut() {
                if segment.dirty && !segment.staged {
                    out.push((segment.id, segment.data.clone(), segment.certificate()));
                    segment.dirty = false;
                }
            }
            out
        };
        for (id, data, certificate) in dirty {
            self.replicator.replicate(id, &data, certificate)?;
        }
        Ok(())
    }

    /// Open a staged segment for a side log. `None` when the log is at
    /// capacity and cannot host another segment.
    fn install_staged_segment(&self) -> Option<u64> {
        let mut inner = self.inner.lock().expect("log lock");
        if inner.segments.len() >= self.max_segments.saturating_mul(2) {
            return None;
        }
        let id = self.alloc_segment_id();
        inner.segments.insert(id, Segment::new(id, self.segment_size, true));
        Some(id)
    }

    fn append_staged(&self, segment_id: u64, entry_type: LogEntryType, payload: &[u8]) -> Option<Reference> {
        let mut inner = self.inner.lock().expect("log lock");
        let segment = inner.segments.get_mut(&segment_id)?;
        let offset = segment.append(entry_type, payload)?;
        Some(Reference { segment_id, offset })
    }

    fn commit_staged(&self, segment_ids: &[u64]) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().expect("log lock");
            for id in segment_ids {
                if let Some(segment) = inner.segments.get_mut(id) {
                    segment.staged = false;
                    segment.close();
                }
            }
        }
        self.sync_changes()
    }

    fn discard_staged(&self, segment_ids: &[u64]) {
        let mut inner = self.inner.lock().expect("log lock");
        for id in segment_ids {
            inner.segments.remove(id);
        }
    }

    /// First committed entry at or after `cursor`, strictly below `limit`.
    fn entry_at_or_after(&self, cursor: Position, limit: Position) -> Option<IterItem> {
        let inner = self.inner.lock().expect("log lock");
        for (id, segment) in inner.segments.range(cursor.segment_id..) {
            if segment.staged {
                continue;
            }
            let start = if *id == cursor.segment_id { cursor.offset } else { 0 };
            if start >= segment.len() {
                continue;
            }
            let position = Position {
                segment_id: *id,
                offset: start,
            };
            if position >= limit {
                return None;
            }
            match segment.read_entry(start) {
                Ok((entry_type, payload, next_offset)) => {
                    let next = if next_offset < segment.len() {
                        Position {
                            segment_id: *id,
                            offset: next_offset,
                        }
                    } else {
                        Position {
                            segment_id: *id + 1,
                            offset: 0,
                        }
                    };
                    return Some(IterItem {
                        entry_type,
                        payload: payload.to_vec(),
                        reference: Reference {
                            segment_id: *id,
                            offset: start,
                        },
                        next,
                    });
                }
                Err(err) => {
                    tracing::error!(error = ?err, segment_id = *id, offset = start,
                        "corrupt entry during log iteration");
                    return None;
                }
            }
        }
        None
    }
}

/// Walks committed log entries oldest-first. While an iterator is alive the
/// entries before it must not be reclaimed (there is no cleaner in this core,
/// so this is a structural guarantee rather than an enforced pin).
pub struct LogIterator {
    log: Arc<Log>,
    limit: Position,
    cursor: Position,
    current: Option<IterItem>,
}

impl LogIterator {
    pub fn new(log: Arc<Log>) -> Self {
        let limit = log.head_position();
        let mut iter = Self {
            log,
            limit,
            cursor: Position::ZERO,
            current: None,
        };
        iter.advance();
        iter
    }

    fn advance(&mut self) {
        self.current = self.log.entry_at_or_after(self.cursor, self.limit);
        if let Some(item) = &self.current {
            self.cursor = item.next;
        }
    }

    pub fn current(&self) -> Option<&IterItem> {
        self.current.as_ref()
    }

    pub fn step(&mut self) {
        self.advance();
    }

    pub fn done(&self) -> bool {
        self.current.is_none()
    }

    /// True when the current entry lives in the log's present head segment.
    pub fn on_head(&self) -> bool {
        match &self.current {
            Some(item) => item.reference.segment_id == self.log.head_segment_id(),
            None => true,
        }
    }

    /// Re-snapshot the head so entries appended since construction (or the
    /// last refresh) become visible.
    pub fn refresh(&mut self) {
        self.limit = self.log.head_position();
        if self.current.is_none() {
            self.advance();
        }
    }
}

/// Staging allocator for recovery and migration receive paths. Entries get
/// real references immediately but stay invisible until `commit`.
pub struct SideLog {
    log: Arc<Log>,
    head: u64,
    segments: Vec<u64>,
    committed: bool,
}

impl SideLog {
    /// `None` when the log cannot host a staging segment.
    pub fn new(log: Arc<Log>) -> Option<Self> {
        let head = log.install_staged_segment()?;
        Some(Self {
            log,
            head,
            segments: vec![head],
            committed: false,
        })
    }

    /// Append to the staging area. `None` means the log ran out of space;
    /// the caller aborts and drops the side log.
    pub fn append(&mut self, entry_type: LogEntryType, payload: &[u8]) -> Option<Reference> {
        if let Some(reference) = self.log.append_staged(self.head, entry_type, payload) {
            return Some(reference);
        }
        let next = self.log.install_staged_segment()?;
        self.head = next;
        self.segments.push(next);
        self.log.append_staged(self.head, entry_type, payload)
    }

    /// Atomically splice the staged segments into the log's durability
    /// stream. After this returns the entries are live and durable.
    pub fn commit(mut self) -> anyhow::Result<()> {
        self.committed = true;
        self.log.commit_staged(&self.segments)
    }
}

impl Drop for SideLog {
    fn drop(&mut self) {
        if !self.committed {
            self.log.discard_staged(&self.segments);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_log() -> Arc<Log> {
        Arc::new(Log::new(256, 64, Arc::new(NullReplicator)))
    }

    #[test]
    fn append_and_read_round_trip() {
        let log = small_log();
        let reference = log.append(LogEntryType::Object, b"hello").expect("append");
        let (entry_type, payload) = log.get_entry(reference).expect("entry");
        assert_eq!(entry_type, LogEntryType::Object);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn head_rolls_when_segment_fills() {
        let log = small_log();
        let first = log.append(LogEntryType::Object, &[0u8; 200]).expect("append");
        let second = log.append(LogEntryType::Object, &[1u8; 200]).expect("append");
        assert_ne!(first.segment_id, second.segment_id);
        assert!(log.head_segment_id() >= second.segment_id);
    }

    #[test]
    fn append_group_is_atomic_within_one_segment() {
        let log = small_log();
        // Fill most of the head so the group cannot fit there.
        log.append(LogEntryType::Object, &[0u8; 180]).expect("append");
        let refs = log
            .append_group(&[
                (LogEntryType::Object, &[1u8; 60][..]),
                (LogEntryType::Tombstone, &[2u8; 60][..]),
            ])
            .expect("group");
        assert_eq!(refs[0].segment_id, refs[1].segment_id);
    }

    #[test]
    fn capacity_exhaustion_returns_none() {
        let log = Arc::new(Log::new(64, 2, Arc::new(NullReplicator)));
        let mut appended = 0;
        while log.append(LogEntryType::Object, &[7u8; 32]).is_some() {
            appended += 1;
            assert!(appended < 100, "log never filled");
        }
        assert!(appended > 0);
    }

    #[test]
    fn iterator_walks_oldest_first_and_stops_at_snapshot() {
        let log = small_log();
        for i in 0..5u8 {
            log.append(LogEntryType::Object, &[i; 40]).expect("append");
        }
        let mut iter = LogIterator::new(log.clone());
        // Appends after the snapshot are not visible until refresh.
        log.append(LogEntryType::Tombstone, &[9; 40]).expect("append");

        let mut seen = Vec::new();
        while let Some(item) = iter.current() {
            seen.push(item.payload[0]);
            iter.step();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        iter.refresh();
        let item = iter.current().expect("refreshed entry");
        assert_eq!(item.entry_type, LogEntryType::Tombstone);
    }

    #[test]
    fn side_log_entries_hidden_until_commit() {
        let log = small_log();
        log.append(LogEntryType::Object, &[1; 16]).expect("append");
        let mut side = SideLog::new(log.clone()).expect("side log");
        let staged_ref = side.append(LogEntryType::Object, &[2; 16]).expect("staged");

        // Resolvable by reference, invisible to iteration.
        assert!(log.get_entry(staged_ref).is_some());
        let mut iter = LogIterator::new(log.clone());
        let mut count = 0;
        while iter.current().is_some() {
            count += 1;
            iter.step();
        }
        assert_eq!(count, 1);

        side.commit().expect("commit");
        let mut iter = LogIterator::new(log.clone());
        let mut count = 0;
        while iter.current().is_some() {
            count += 1;
            iter.step();
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn dropped_side_log_discards_segments() {
        let log = small_log();
        let staged_ref = {
            let mut side = SideLog::new(log.clone()).expect("side log");
            side.append(LogEntryType::Object, &[3; 16]).expect("staged")
        };
        assert!(log.get_entry(staged_ref).is_none());
    }

    #[test]
    fn segment_iterator_rejects_corrupt_image() {
        let mut segment = Segment::transfer(256);
        segment.append(LogEntryType::Object, b"abc").expect("append");
        segment.close();
        let certificate = segment.certificate();

        let mut good = SegmentIterator::new(segment.data(), certificate).expect("iterator");
        let (entry_type, payload) = good.next_entry().expect("entry").expect("some");
        assert_eq!(entry_type, LogEntryType::Object);
        assert_eq!(payload, b"abc");
        assert!(good.next_entry().expect("end").is_none());

        let mut corrupt = segment.data().to_vec();
        corrupt[7] ^= 0xff;
        assert!(SegmentIterator::new(&corrupt, certificate).is_err());
    }
}
