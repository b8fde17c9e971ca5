//! In-memory backend for tests and filesystem-free embedding

use super::{Backend, BatchOp};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An ordered key-value store held entirely in memory.
///
/// Batches are applied while holding the write guard, so a batch is atomic
/// with respect to every other read and write on the store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Backend for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let entries = self.entries.read();
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::key_not_found(key))
    }

    fn apply(&self, batch: Vec<BatchOp>) -> Result<()> {
        let mut entries = self.entries.write();
        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
