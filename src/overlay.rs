//! Staged mutations: an in-memory log of writes with atomic keep/discard
//!
//! An [`Overlay`] batches logical writes before they touch durable state.
//! The caller stages any number of sets and deletes, then either replays
//! them through a [`Database`] with [`Overlay::commit`] or throws them away
//! with [`Overlay::rollback`].

use crate::database::Database;
use crate::model::Hash;
use crate::store::Backend;
use crate::Result;

/// One staged logical write
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Mutation {
    /// The key this mutation targets
    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Set { key, .. } => key,
            Mutation::Delete { key } => key,
        }
    }
}

/// A pending log of logical writes against a [`Database`].
///
/// The log is an ordered mapping: staging a key that is already pending
/// replaces that entry in place, keeping its position. Nothing here is
/// durable; the log lives entirely in memory until committed.
///
/// Handles are produced by [`Database::mutations`].
pub struct Overlay {
    pending: Vec<Mutation>,
}

impl Overlay {
    pub(crate) fn new() -> Self {
        Overlay {
            pending: Vec::new(),
        }
    }

    /// Stage a write of `key`
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.record(Mutation::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    /// Stage a removal of `key`
    pub fn delete(&mut self, key: &[u8]) {
        self.record(Mutation::Delete { key: key.to_vec() });
    }

    /// The staged mutations, in replay order
    pub fn pending(&self) -> &[Mutation] {
        &self.pending
    }

    /// Number of staged mutations
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Replay the staged log through `db` in order and clear it on full
    /// success, returning the root hash covering all staged changes.
    ///
    /// Each entry is applied as its own tree transaction. If one fails,
    /// earlier entries remain durably applied and are cleared from the
    /// log, while the failed entry and everything after it stay staged.
    /// Partial application is a documented outcome, not rolled back;
    /// callers needing all-or-nothing batches must stage related changes
    /// as a single backing-store transaction instead.
    pub fn commit<B: Backend>(&mut self, db: &Database<B>) -> Result<Option<Hash>> {
        let mut applied = 0;
        for mutation in &self.pending {
            let result = match mutation {
                Mutation::Set { key, value } => db.put(key, value),
                Mutation::Delete { key } => db.delete(key),
            };
            if let Err(err) = result {
                self.pending.drain(..applied);
                return Err(err);
            }
            applied += 1;
        }
        self.pending.clear();
        db.root_hash()
    }

    /// Discard the staged log; durable state is untouched
    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    /// Root hash of the committed tree underneath this overlay; staged
    /// mutations are not reflected until committed.
    pub fn root_hash<B: Backend>(&self, db: &Database<B>) -> Result<Option<Hash>> {
        db.root_hash()
    }

    fn record(&mut self, mutation: Mutation) {
        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|pending| pending.key() == mutation.key())
        {
            *existing = mutation;
        } else {
            self.pending.push(mutation);
        }
    }
}
