//! Backing-store boundary: the `Backend` trait and its transaction adapter
//!
//! The tree never talks to a concrete store directly. All structural writes
//! of one top-level operation are buffered in a [`Transaction`] and handed
//! to the backend as a single atomic batch on commit.

mod file_store;
mod memory;

pub use file_store::FileStore;
pub use memory::MemoryStore;

use crate::{Error, Result};
use std::collections::BTreeMap;

/// One entry of an atomic write batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered key-value store the tree persists into.
///
/// `apply` is the transactional primitive: the whole batch becomes visible
/// at once or not at all. `put` and `delete` are the single-op conveniences
/// required by the store contract and are equivalent to a one-entry batch.
pub trait Backend: Send + Sync {
    /// Read a value, failing with [`Error::KeyNotFound`] when absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Write a single key.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(vec![BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }])
    }

    /// Remove a single key. Removing an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.apply(vec![BatchOp::Delete { key: key.to_vec() }])
    }

    /// Apply a write batch atomically.
    fn apply(&self, batch: Vec<BatchOp>) -> Result<()>;
}

/// Buffered writes against a backend, applied atomically on commit.
///
/// Reads issued against an open transaction observe its own staged writes
/// first, so an operation sees the nodes it has already rewritten. Dropping
/// a transaction without committing discards the buffer.
pub struct Transaction<'a, B: Backend + ?Sized> {
    backend: &'a B,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a, B: Backend + ?Sized> Transaction<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Transaction {
            backend,
            staged: BTreeMap::new(),
        }
    }

    /// Read through the staged overlay, then the backend.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self.staged.get(key) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(Error::key_not_found(key)),
            None => self.backend.get(key),
        }
    }

    /// Stage a write.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.staged.insert(key.to_vec(), Some(value.to_vec()));
    }

    /// Stage a removal.
    pub fn delete(&mut self, key: &[u8]) {
        self.staged.insert(key.to_vec(), None);
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Whether anything has been staged.
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Flush the buffer to the backend as one atomic batch.
    pub fn commit(self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let batch = self
            .staged
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => BatchOp::Put { key, value },
                None => BatchOp::Delete { key },
            })
            .collect();
        self.backend.apply(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_reads_own_writes() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new(&store);

        tx.put(b"k", b"v");
        assert_eq!(tx.get(b"k").unwrap(), b"v");

        // Nothing visible outside the transaction yet
        assert!(store.get(b"k").is_err());
    }

    #[test]
    fn test_transaction_staged_delete_masks_backend() {
        let store = MemoryStore::new();
        store.put(b"k", b"v").unwrap();

        let mut tx = Transaction::new(&store);
        tx.delete(b"k");
        assert!(matches!(tx.get(b"k"), Err(Error::KeyNotFound(_))));

        // Still present until commit
        assert_eq!(store.get(b"k").unwrap(), b"v");
        tx.commit().unwrap();
        assert!(store.get(b"k").is_err());
    }

    #[test]
    fn test_transaction_drop_discards() {
        let store = MemoryStore::new();
        {
            let mut tx = Transaction::new(&store);
            tx.put(b"k", b"v");
        }
        assert!(store.get(b"k").is_err());
    }

    #[test]
    fn test_transaction_commit_applies_all() {
        let store = MemoryStore::new();
        store.put(b"old", b"1").unwrap();

        let mut tx = Transaction::new(&store);
        tx.put(b"a", b"1");
        tx.put(b"b", b"2");
        tx.delete(b"old");
        tx.commit().unwrap();

        assert_eq!(store.get(b"a").unwrap(), b"1");
        assert_eq!(store.get(b"b").unwrap(), b"2");
        assert!(store.get(b"old").is_err());
    }

    #[test]
    fn test_transaction_last_write_wins() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new(&store);
        tx.put(b"k", b"first");
        tx.put(b"k", b"second");
        tx.commit().unwrap();

        assert_eq!(store.get(b"k").unwrap(), b"second");
    }
}
