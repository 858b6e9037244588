//! Secondary-index ranges and their entries.
//!
//! An indexlet owns the lexicographic key range [first_key,
//! first_not_owned_key) of one index. Entries are held in an ordered
//! in-memory map and persisted as opaque node objects in the indexlet's
//! backing table (node id = 8-byte big-endian primary key), so migration and
//! recovery move them through the log like any other object. After either of
//! those paths rebuilds the backing table, `load_entries_from_backing`
//! repopulates the in-memory map from the node objects.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::key::{KeyHash, TableId};
use crate::object_manager::ObjectManager;
use crate::records::{read_u16, read_u64, read_u8, LogEntryType, Object};
use crate::status::{RejectRules, Status};

/// Lifecycle state of an indexlet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexletState {
    Normal,
    Recovering,
}

struct Indexlet {
    table_id: TableId,
    index_id: u8,
    backing_table_id: TableId,
    first_key: Vec<u8>,
    /// Exclusive upper bound; empty means unbounded.
    first_not_owned_key: Vec<u8>,
    state: IndexletState,
    next_node_id: u64,
    entries: BTreeMap<(Vec<u8>, KeyHash), u64>,
}

impl Indexlet {
    fn owns_key(&self, key: &[u8]) -> bool {
        key >= self.first_key.as_slice()
            && (self.first_not_owned_key.is_empty() || key < self.first_not_owned_key.as_slice())
    }

    fn overlaps(&self, first: &[u8], first_not_owned: &[u8]) -> bool {
        let below = !first_not_owned.is_empty() && first_not_owned <= self.first_key.as_slice();
        let above =
            !self.first_not_owned_key.is_empty() && self.first_not_owned_key.as_slice() <= first;
        !(below || above)
    }
}

/// The payload of one index node object: which index it belongs to, the
/// index key, and the primary-key hash it points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexNode {
    pub table_id: TableId,
    pub index_id: u8,
    pub index_key: Vec<u8>,
    pub primary_key_hash: KeyHash,
}

impl IndexNode {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 1 + 2 + self.index_key.len() + 8);
        out.extend_from_slice(&self.table_id.to_be_bytes());
        out.push(self.index_id);
        out.extend_from_slice(&(self.index_key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.index_key);
        out.extend_from_slice(&self.primary_key_hash.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let table_id = read_u64(data, &mut offset)?;
        let index_id = read_u8(data, &mut offset)?;
        let key_len = read_u16(data, &mut offset)? as usize;
        ensure!(offset + key_len <= data.len(), "short index node key");
        let index_key = data[offset..offset + key_len].to_vec();
        offset += key_len;
        let primary_key_hash = read_u64(data, &mut offset)?;
        Ok(Self {
            table_id,
            index_id,
            index_key,
            primary_key_hash,
        })
    }
}

pub fn node_primary_key(node_id: u64) -> Vec<u8> {
    node_id.to_be_bytes().to_vec()
}

/// Result of a lookup: matching primary-key hashes plus the key to resume
/// from when the scan was cut short.
pub struct IndexLookup {
    pub primary_key_hashes: Vec<KeyHash>,
    pub next_key: Option<Vec<u8>>,
}

pub struct IndexletManager {
    objects: Arc<ObjectManager>,
    indexlets: Mutex<Vec<Indexlet>>,
}

impl IndexletManager {
    pub fn new(objects: Arc<ObjectManager>) -> Self {
        Self {
            objects,
            indexlets: Mutex::new(Vec::new()),
        }
    }

    /// Register an indexlet. Fails when the range overlaps an existing
    /// indexlet of the same (table, index).
    #[allow(clippy::too_many_arguments)]
    pub fn add_indexlet(
        &self,
        table_id: TableId,
        index_id: u8,
        backing_table_id: TableId,
        first_key: Vec<u8>,
        first_not_owned_key: Vec<u8>,
        state: IndexletState,
        next_node_id: u64,
    ) -> bool {
        let mut indexlets = self.indexlets.lock().expect("indexlet lock");
        if indexlets.iter().any(|i| {
            i.table_id == table_id
                && i.index_id == index_id
                && i.overlaps(&first_key, &first_not_owned_key)
        }) {
            return false;
        }
        indexlets.push(Indexlet {
            table_id,
            index_id,
            backing_table_id,
            first_key,
            first_not_owned_key,
            state,
            next_node_id: next_node_id.max(1),
            entries: BTreeMap::new(),
        });
        true
    }

    pub fn delete_indexlet(
        &self,
        table_id: TableId,
        index_id: u8,
        first_key: &[u8],
        first_not_owned_key: &[u8],
    ) -> bool {
        let mut indexlets = self.indexlets.lock().expect("indexlet lock");
        let before = indexlets.len();
        indexlets.retain(|i| {
            !(i.table_id == table_id
                && i.index_id == index_id
                && i.first_key == first_key
                && i.first_not_owned_key == first_not_owned_key)
        });
        indexlets.len() != before
    }

    pub fn has_indexlet(&self, table_id: TableId, index_id: u8, key: &[u8]) -> bool {
        let indexlets = self.indexlets.lock().expect("indexlet lock");
        indexlets
            .iter()
            .any(|i| i.table_id == table_id && i.index_id == index_id && i.owns_key(key))
    }

    /// Upper bound of the indexlet owning `key` (empty means unbounded).
    pub fn first_not_owned_key(&self, table_id: TableId, index_id: u8, key: &[u8]) -> Option<Vec<u8>> {
        let indexlets = self.indexlets.lock().expect("indexlet lock");
        indexlets
            .iter()
            .find(|i| i.table_id == table_id && i.index_id == index_id && i.owns_key(key))
            .map(|i| i.first_not_owned_key.clone())
    }

    /// Backing table of the indexlet owning `key`.
    pub fn backing_table(&self, table_id: TableId, index_id: u8, key: &[u8]) -> Option<TableId> {
        let indexlets = self.indexlets.lock().expect("indexlet lock");
        indexlets
            .iter()
            .find(|i| i.table_id == table_id && i.index_id == index_id && i.owns_key(key))
            .map(|i| i.backing_table_id)
    }

    /// CAS on indexlet state; RECOVERING -> NORMAL additionally rebuilds the
    /// in-memory entry map from the backing table's node objects.
    pub fn change_state(
        &self,
        table_id: TableId,
        index_id: u8,
        first_key: &[u8],
        first_not_owned_key: &[u8],
        from: IndexletState,
        to: IndexletState,
    ) -> bool {
        let changed = {
            let mut indexlets = self.indexlets.lock().expect("indexlet lock");
            let mut hit = false;
            for indexlet in indexlets.iter_mut() {
                if indexlet.table_id == table_id
                    && indexlet.index_id == index_id
                    && indexlet.first_key == first_key
                    && indexlet.first_not_owned_key == first_not_owned_key
                    && indexlet.state == from
                {
                    indexlet.state = to;
                    hit = true;
                    break;
                }
            }
            hit
        };
        if changed && from == IndexletState::Recovering && to == IndexletState::Normal {
            self.load_entries_from_backing(table_id, index_id, first_key);
        }
        changed
    }

    /// Insert one index entry: persist a node object in the backing table,
    /// then publish it in the ordered map.
    pub fn insert_entry(
        &self,
        table_id: TableId,
        index_id: u8,
        index_key: &[u8],
        primary_key_hash: KeyHash,
    ) -> Status {
        let mut indexlets = self.indexlets.lock().expect("indexlet lock");
        let Some(indexlet) = indexlets
            .iter_mut()
            .find(|i| i.table_id == table_id && i.index_id == index_id && i.owns_key(index_key))
        else {
            return Status::UnknownIndexlet;
        };
        if indexlet.state != IndexletState::Normal {
            return Status::Retry;
        }

        let node_id = indexlet.next_node_id;
        let node = IndexNode {
            table_id,
            index_id,
            index_key: index_key.to_vec(),
            primary_key_hash,
        };
        let object = Object::with_single_key(
            indexlet.backing_table_id,
            node_primary_key(node_id),
            node.encode(),
        );
        match self.objects.write_object(object, &RejectRules::default(), None) {
            Ok(_) => {
                indexlet.next_node_id += 1;
                indexlet
                    .entries
                    .insert((index_key.to_vec(), primary_key_hash), node_id);
                Status::Ok
            }
            Err(status) => status,
        }
    }

    /// Remove one index entry and its node object. Removing an entry that
    /// is not present succeeds (the object it indexed is already gone).
    pub fn remove_entry(
        &self,
        table_id: TableId,
        index_id: u8,
        index_key: &[u8],
        primary_key_hash: KeyHash,
    ) -> Status {
        let (backing_table_id, node_id) = {
            let mut indexlets = self.indexlets.lock().expect("indexlet lock");
            let Some(indexlet) = indexlets
                .iter_mut()
                .find(|i| i.table_id == table_id && i.index_id == index_id && i.owns_key(index_key))
            else {
                return Status::UnknownIndexlet;
            };
            if indexlet.state != IndexletState::Normal {
                return Status::Retry;
            }
            match indexlet
                .entries
                .remove(&(index_key.to_vec(), primary_key_hash))
            {
                Some(node_id) => (indexlet.backing_table_id, node_id),
                None => return Status::Ok,
            }
        };

        let node_key = crate::key::Key::new(backing_table_id, node_primary_key(node_id));
        match self.objects.remove_object(&node_key, &RejectRules::default()) {
            Ok(_) => Status::Ok,
            Err(status) => status,
        }
    }

    /// Range lookup over [first_key, last_key], clamped to the owning
    /// indexlet, returning at most `max_keys` primary-key hashes.
    pub fn lookup_index_keys(
        &self,
        table_id: TableId,
        index_id: u8,
        first_key: &[u8],
        last_key: &[u8],
        max_keys: usize,
    ) -> Result<IndexLookup, Status> {
        let indexlets = self.indexlets.lock().expect("indexlet lock");
        let Some(indexlet) = indexlets
            .iter()
            .find(|i| i.table_id == table_id && i.index_id == index_id && i.owns_key(first_key))
        else {
            return Err(Status::UnknownIndexlet);
        };
        if indexlet.state != IndexletState::Normal {
            return Err(Status::Retry);
        }

        let mut hashes = Vec::new();
        let mut next_key = None;
        for ((key, hash), _) in indexlet
            .entries
            .range((first_key.to_vec(), KeyHash::MIN)..)
        {
            if key.as_slice() > last_key {
                break;
            }
            if hashes.len() >= max_keys {
                next_key = Some(key.clone());
                break;
            }
            hashes.push(*hash);
        }
        Ok(IndexLookup {
            primary_key_hashes: hashes,
            next_key,
        })
    }

    /// Split-boundary test used by indexlet migration: does this node object
    /// belong to the partition at or above `split_key`?
    pub fn is_greater_or_equal(
        &self,
        node_object: &Object,
        table_id: TableId,
        index_id: u8,
        split_key: &[u8],
    ) -> bool {
        match IndexNode::decode(&node_object.value) {
            Ok(node) => {
                node.table_id == table_id
                    && node.index_id == index_id
                    && node.index_key.as_slice() >= split_key
            }
            Err(err) => {
                tracing::warn!(error = ?err, "undecodable index node during split comparison");
                false
            }
        }
    }

    /// Shrink the indexlet owning `split_key` so that [split_key, ...) is no
    /// longer owned, dropping the in-memory entries for the migrated part.
    pub fn truncate_indexlet(&self, table_id: TableId, index_id: u8, split_key: &[u8]) -> Status {
        let mut indexlets = self.indexlets.lock().expect("indexlet lock");
        let Some(indexlet) = indexlets
            .iter_mut()
            .find(|i| i.table_id == table_id && i.index_id == index_id && i.owns_key(split_key))
        else {
            return Status::UnknownIndexlet;
        };
        indexlet.first_not_owned_key = split_key.to_vec();
        indexlet
            .entries
            .retain(|(key, _), _| key.as_slice() < split_key);
        Status::Ok
    }

    /// Raise the node-id allocator of the indexlet owning `key`. Called with
    /// the highest node id observed while replaying migrated or recovered
    /// backing-table data.
    pub fn set_next_node_id_if_higher(
        &self,
        table_id: TableId,
        index_id: u8,
        key: &[u8],
        next_node_id: u64,
    ) {
        let mut indexlets = self.indexlets.lock().expect("indexlet lock");
        if let Some(indexlet) = indexlets
            .iter_mut()
            .find(|i| i.table_id == table_id && i.index_id == index_id && i.owns_key(key))
        {
            if next_node_id > indexlet.next_node_id {
                indexlet.next_node_id = next_node_id;
            }
        }
    }

    /// Rebuild the in-memory entry map of the indexlet owning `key` from the
    /// node objects currently live in its backing table.
    pub fn load_entries_from_backing(&self, table_id: TableId, index_id: u8, key: &[u8]) {
        let mut indexlets = self.indexlets.lock().expect("indexlet lock");
        let Some(indexlet) = indexlets
            .iter_mut()
            .find(|i| i.table_id == table_id && i.index_id == index_id && i.owns_key(key))
        else {
            return;
        };

        let raw = self
            .objects
            .hash_index()
            .collect_table_range(indexlet.backing_table_id, 0, u64::MAX);
        indexlet.entries.clear();
        let mut highest_node_id = 0u64;
        for (_, primary_key, reference) in raw {
            let Some((entry_type, payload)) = self.objects.log().get_entry(reference) else {
                continue;
            };
            if entry_type != LogEntryType::Object {
                continue;
            }
            let Ok(object) = Object::decode(&payload) else {
                continue;
            };
            let Ok(node) = IndexNode::decode(&object.value) else {
                continue;
            };
            let node_id = match primary_key.as_slice().try_into() {
                Ok(bytes) => u64::from_be_bytes(bytes),
                Err(_) => continue,
            };
            highest_node_id = highest_node_id.max(node_id);
            if indexlet.owns_key(&node.index_key) {
                indexlet
                    .entries
                    .insert((node.index_key, node.primary_key_hash), node_id);
            }
        }
        if highest_node_id + 1 > indexlet.next_node_id {
            indexlet.next_node_id = highest_node_id + 1;
        }
        tracing::debug!(table_id, index_id, entries = indexlet.entries.len(),
            next_node_id = indexlet.next_node_id, "rebuilt indexlet entries from backing table");
    }

    /// Count of live entries across indexlets of (table, index).
    pub fn entry_count(&self, table_id: TableId, index_id: u8) -> usize {
        let indexlets = self.indexlets.lock().expect("indexlet lock");
        indexlets
            .iter()
            .filter(|i| i.table_id == table_id && i.index_id == index_id)
            .map(|i| i.entries.len())
            .sum()
    }
}
