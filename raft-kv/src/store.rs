//! Local key-value storage for the Raft state machine.
//!
//! [`KvStore`] is the contract the state machine needs from a storage engine.
//! Locking is not the store's concern: the state machine owns its store
//! behind a read-write lock, so implementations only see `&mut self` for
//! writes and `&self` for reads.

use std::collections::BTreeMap;

use crate::error::StorageError;

/// Ordered `(key, value)` pairs yielded by [`KvStore::iter_all`].
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StorageError>> + 'a>;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores a key-value pair, overwriting any existing value.
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StorageError>;

    /// Removes a key. Removing an absent key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;

    /// Every pair in ascending key order. Used only for snapshots.
    fn iter_all(&self) -> Result<KvIter<'_>, StorageError>;

    /// Removes every pair. Used only when restoring a snapshot.
    fn clear(&mut self) -> Result<(), StorageError>;
}

/// In-memory store used by each node.
///
/// # Why BTreeMap instead of HashMap?
///
/// BTreeMap iterates in key order, which makes snapshots of equal datasets
/// byte-for-byte identical regardless of the order the keys were written in.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StorageError> {
        self.data.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    fn iter_all(&self) -> Result<KvIter<'_>, StorageError> {
        Ok(Box::new(
            self.data.iter().map(|(k, v)| Ok((k.clone(), v.clone()))),
        ))
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.data.clear();
        Ok(())
    }
}
