//! Primary-key model and the 64-bit key hash used for tablet routing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub type TableId = u64;
pub type KeyHash = u64;

/// Hash a primary key within a table. Tablet ownership, hash-index bucketing,
/// and key locking all key off this value.
pub fn key_hash(table_id: TableId, key: &[u8]) -> KeyHash {
    let mut hasher = DefaultHasher::new();
    table_id.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

/// A (table, primary key) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    table_id: TableId,
    bytes: Vec<u8>,
}

impl Key {
    pub fn new(table_id: TableId, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            table_id,
            bytes: bytes.into(),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hash(&self) -> KeyHash {
        key_hash(self.table_id, &self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_table_scoped() {
        let a = key_hash(1, b"alpha");
        assert_eq!(a, key_hash(1, b"alpha"));
        assert_ne!(a, key_hash(2, b"alpha"));
        assert_ne!(a, key_hash(1, b"beta"));
        assert_eq!(Key::new(1, b"alpha".to_vec()).hash(), a);
    }
}
