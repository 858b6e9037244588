//! Map from (table, key hash, key) to the live log reference.
//!
//! Buckets are striped across independently locked shards selected by key
//! hash. Colliding keys under one hash are disambiguated by comparing the
//! full key bytes.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::key::{KeyHash, TableId};
use crate::log::Reference;

struct HashEntry {
    key: Vec<u8>,
    reference: Reference,
}

/// The object map: exactly one entry per live object.
pub struct HashIndex {
    stripes: Vec<Mutex<HashMap<(TableId, KeyHash), Vec<HashEntry>>>>,
}

impl HashIndex {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, key_hash: KeyHash) -> &Mutex<HashMap<(TableId, KeyHash), Vec<HashEntry>>> {
        &self.stripes[(key_hash as usize) % self.stripes.len()]
    }

    pub fn lookup(&self, table_id: TableId, key_hash: KeyHash, key: &[u8]) -> Option<Reference> {
        let stripe = self.stripe(key_hash).lock().expect("hash index lock");
        let bucket = stripe.get(&(table_id, key_hash))?;
        bucket
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.reference)
    }

    /// Insert a reference for a key, returning the reference it displaced.
    pub fn insert_or_replace(
        &self,
        table_id: TableId,
        key_hash: KeyHash,
        key: &[u8],
        reference: Reference,
    ) -> Option<Reference> {
        let mut stripe = self.stripe(key_hash).lock().expect("hash index lock");
        let bucket = stripe.entry((table_id, key_hash)).or_default();
        for entry in bucket.iter_mut() {
            if entry.key == key {
                let old = entry.reference;
                entry.reference = reference;
                return Some(old);
            }
        }
        bucket.push(HashEntry {
            key: key.to_vec(),
            reference,
        });
        None
    }

    pub fn remove(&self, table_id: TableId, key_hash: KeyHash, key: &[u8]) -> Option<Reference> {
        let mut stripe = self.stripe(key_hash).lock().expect("hash index lock");
        let bucket = stripe.get_mut(&(table_id, key_hash))?;
        let idx = bucket.iter().position(|entry| entry.key == key)?;
        let entry = bucket.swap_remove(idx);
        if bucket.is_empty() {
            stripe.remove(&(table_id, key_hash));
        }
        Some(entry.reference)
    }

    /// All (key, reference) pairs stored under one hash. Used by readHashes,
    /// where the client supplies pre-hashed keys.
    pub fn entries_for(&self, table_id: TableId, key_hash: KeyHash) -> Vec<(Vec<u8>, Reference)> {
        let stripe = self.stripe(key_hash).lock().expect("hash index lock");
        match stripe.get(&(table_id, key_hash)) {
            Some(bucket) => bucket
                .iter()
                .map(|entry| (entry.key.clone(), entry.reference))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every entry of a table whose hash falls in [first_hash, last_hash],
    /// sorted by hash. Drives enumeration.
    pub fn collect_table_range(
        &self,
        table_id: TableId,
        first_hash: KeyHash,
        last_hash: KeyHash,
    ) -> Vec<(KeyHash, Vec<u8>, Reference)> {
        let mut out = Vec::new();
        for stripe in &self.stripes {
            let stripe = stripe.lock().expect("hash index lock");
            for ((table, hash), bucket) in stripe.iter() {
                if *table != table_id || *hash < first_hash || *hash > last_hash {
                    continue;
                }
                for entry in bucket {
                    out.push((*hash, entry.key.clone(), entry.reference));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        out
    }

    /// Drop every entry the ownership filter rejects. Used after tablets are
    /// dropped or migrated away.
    pub fn remove_orphans(&self, keep: impl Fn(TableId, KeyHash) -> bool) -> usize {
        let mut removed = 0;
        for stripe in &self.stripes {
            let mut stripe = stripe.lock().expect("hash index lock");
            stripe.retain(|(table, hash), bucket| {
                if keep(*table, *hash) {
                    true
                } else {
                    removed += bucket.len();
                    false
                }
            });
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(segment_id: u64, offset: u32) -> Reference {
        Reference { segment_id, offset }
    }

    #[test]
    fn insert_lookup_replace_remove() {
        let index = HashIndex::new(8);
        assert_eq!(index.insert_or_replace(1, 42, b"k", reference(1, 0)), None);
        assert_eq!(index.lookup(1, 42, b"k"), Some(reference(1, 0)));

        let old = index.insert_or_replace(1, 42, b"k", reference(2, 16));
        assert_eq!(old, Some(reference(1, 0)));
        assert_eq!(index.lookup(1, 42, b"k"), Some(reference(2, 16)));

        assert_eq!(index.remove(1, 42, b"k"), Some(reference(2, 16)));
        assert_eq!(index.lookup(1, 42, b"k"), None);
    }

    #[test]
    fn colliding_keys_are_disambiguated_by_bytes() {
        let index = HashIndex::new(8);
        index.insert_or_replace(1, 7, b"a", reference(1, 0));
        index.insert_or_replace(1, 7, b"b", reference(1, 64));
        assert_eq!(index.lookup(1, 7, b"a"), Some(reference(1, 0)));
        assert_eq!(index.lookup(1, 7, b"b"), Some(reference(1, 64)));
        assert_eq!(index.entries_for(1, 7).len(), 2);

        index.remove(1, 7, b"a");
        assert_eq!(index.lookup(1, 7, b"b"), Some(reference(1, 64)));
    }

    #[test]
    fn orphan_purge_respects_ownership_filter() {
        let index = HashIndex::new(4);
        index.insert_or_replace(1, 10, b"keep", reference(1, 0));
        index.insert_or_replace(1, 2_000, b"drop", reference(1, 32));
        let removed = index.remove_orphans(|_, hash| hash < 1_000);
        assert_eq!(removed, 1);
        assert_eq!(index.lookup(1, 10, b"keep"), Some(reference(1, 0)));
        assert_eq!(index.lookup(1, 2_000, b"drop"), None);
    }
}
