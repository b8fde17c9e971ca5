//! High-level database API
//!
//! [`Database`] owns the backing store, the lazily loaded tree state, and
//! the writer lock serializing all structural mutations.

use crate::avl::{self, AvlTree, BackendNodes, Node};
use crate::model::Hash;
use crate::overlay::Overlay;
use crate::store::{Backend, FileStore, Transaction};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::path::Path;

/// Reserved key holding the decimal id of the current root node
const ROOT_KEY: &[u8] = b"meta:root";

/// Reserved key holding the decimal id allocator watermark
const NEXT_ID_KEY: &[u8] = b"meta:next_id";

/// The in-memory mirror of the persisted tree state.
///
/// Between commits this is the source of truth for reads; it is replaced
/// wholesale, after a successful commit, while holding the write guard.
#[derive(Clone)]
struct TreeState {
    root: Option<Node>,
    next_id: u64,
}

/// An authenticated key-value store backed by a Merkle AVL tree.
///
/// Writers (`put`, `delete`) are serialized by a process-wide mutex and
/// each runs inside exactly one backing-store transaction. Readers never
/// take the writer lock: they clone the current root reference and descend
/// over immutable records, so a read always observes a fully consistent
/// pre- or post-mutation tree.
pub struct Database<B: Backend> {
    backend: B,
    state: RwLock<Option<TreeState>>,
    writer: Mutex<()>,
}

impl Database<FileStore> {
    /// Create a new database file at the given path
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Database::with_backend(FileStore::create(path)?))
    }

    /// Open an existing database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Construction(format!(
                "no database at {}",
                path.display()
            )));
        }
        Ok(Database::with_backend(FileStore::open(path)?))
    }

    /// Open or create a database file
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }
}

impl<B: Backend> Database<B> {
    /// Build a database over any backend
    pub fn with_backend(backend: B) -> Self {
        Database {
            backend,
            state: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    // === Key-value operations ===

    /// Insert or overwrite a key.
    ///
    /// Acquires the writer lock, applies the insertion inside one
    /// transaction, and swaps the in-memory root only after the commit
    /// succeeds. On error the durable and in-memory state are unchanged.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.load()?;
        let _writer = self.writer.lock();
        let snapshot = self.load()?;

        let mut tree = AvlTree::new(Transaction::new(&self.backend), snapshot.next_id);
        let root_id = tree.insert(snapshot.root.as_ref().map(|n| n.id), key, value)?;
        let new_root = tree.node(root_id)?;
        let next_id = tree.next_id();

        let mut tx = tree.into_transaction();
        Self::set_root(snapshot.root.as_ref(), Some(&new_root), &mut tx);
        if next_id != snapshot.next_id {
            tx.put(NEXT_ID_KEY, next_id.to_string().as_bytes());
        }
        tx.commit()?;

        *self.state.write() = Some(TreeState {
            root: Some(new_root),
            next_id,
        });
        Ok(())
    }

    /// Look up a key, failing with [`Error::KeyNotFound`] when absent.
    ///
    /// Lock-free: reads descend from the current committed root.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let snapshot = self.load()?;
        let root = snapshot.root.ok_or_else(|| Error::key_not_found(key))?;

        let mut nodes = BackendNodes::new(&self.backend);
        let found = avl::search(&mut nodes, root, key)?;
        if found.key == key {
            Ok(found.value)
        } else {
            Err(Error::key_not_found(key))
        }
    }

    /// Remove a key.
    ///
    /// Fails with [`Error::EmptyTree`] before any I/O when the tree has no
    /// root, and with [`Error::KeyNotFound`] when the key is absent.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if self.load()?.root.is_none() {
            return Err(Error::EmptyTree);
        }
        let _writer = self.writer.lock();
        let snapshot = self.load()?;
        let root = snapshot.root.as_ref().ok_or(Error::EmptyTree)?;

        let mut tree = AvlTree::new(Transaction::new(&self.backend), snapshot.next_id);
        let new_root = match tree.delete(root.id, key)? {
            Some(id) => Some(tree.node(id)?),
            None => None,
        };
        let next_id = tree.next_id();

        let mut tx = tree.into_transaction();
        Self::set_root(snapshot.root.as_ref(), new_root.as_ref(), &mut tx);
        if next_id != snapshot.next_id {
            tx.put(NEXT_ID_KEY, next_id.to_string().as_bytes());
        }
        tx.commit()?;

        *self.state.write() = Some(TreeState {
            root: new_root,
            next_id,
        });
        Ok(())
    }

    /// Digest authenticating the entire committed dataset, or `None` for an
    /// empty tree. Reflects the last successfully committed mutation only.
    pub fn root_hash(&self) -> Result<Option<Hash>> {
        Ok(self.load()?.root.map(|node| node.hash))
    }

    /// Height of the committed tree; an empty tree has height 0
    pub fn height(&self) -> Result<u32> {
        Ok(self.load()?.root.map_or(0, |node| node.height))
    }

    /// All keys in ascending order
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let snapshot = self.load()?;
        let mut out = Vec::new();
        if let Some(root) = snapshot.root {
            let mut nodes = BackendNodes::new(&self.backend);
            avl::in_order(&mut nodes, &root, &mut out)?;
        }
        Ok(out)
    }

    /// Number of live keys. Walks the tree.
    pub fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.load()?.root.is_none())
    }

    // === Staged mutations ===

    /// Produce an overlay handle for staging a batch of writes.
    ///
    /// Staged mutations have no durable effect until
    /// [`Overlay::commit`] replays them through this database.
    pub fn mutations(&self) -> Overlay {
        Overlay::new()
    }

    // === Internal helpers ===

    /// Stage the root-pointer update for this operation. No-op when the
    /// proposed root id equals the current one; exactly one pointer write
    /// per top-level operation otherwise.
    fn set_root(current: Option<&Node>, proposed: Option<&Node>, tx: &mut Transaction<'_, B>) {
        if current.map(|n| n.id) == proposed.map(|n| n.id) {
            return;
        }
        match proposed {
            Some(node) => tx.put(ROOT_KEY, node.id.to_string().as_bytes()),
            None => tx.delete(ROOT_KEY),
        }
    }

    /// Clone the current tree state, loading it from the reserved keys on
    /// first use. Every public operation goes through here.
    fn load(&self) -> Result<TreeState> {
        if let Some(state) = self.state.read().as_ref() {
            return Ok(state.clone());
        }

        let mut guard = self.state.write();
        match guard.as_ref() {
            Some(state) => Ok(state.clone()),
            None => {
                let state = self.read_state()?;
                *guard = Some(state.clone());
                Ok(state)
            }
        }
    }

    fn read_state(&self) -> Result<TreeState> {
        let root = match self.backend.get(ROOT_KEY) {
            Ok(bytes) => {
                let id = parse_decimal(&bytes, "root pointer")?;
                let mut nodes = BackendNodes::new(&self.backend);
                Some(avl::NodeRead::node(&mut nodes, id)?)
            }
            Err(Error::KeyNotFound(_)) => None,
            Err(other) => return Err(other),
        };

        let next_id = match self.backend.get(NEXT_ID_KEY) {
            Ok(bytes) => parse_decimal(&bytes, "id watermark")?,
            Err(Error::KeyNotFound(_)) => 1,
            Err(other) => return Err(other),
        };

        Ok(TreeState { root, next_id })
    }
}

fn parse_decimal(bytes: &[u8], what: &str) -> Result<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Corruption(format!("unreadable {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::tempdir;

    fn db() -> Database<MemoryStore> {
        Database::with_backend(MemoryStore::new())
    }

    #[test]
    fn test_put_get_roundtrip() {
        let db = db();
        db.put(b"a", b"1").unwrap();
        assert_eq!(db.get(b"a").unwrap(), b"1");
    }

    #[test]
    fn test_get_missing_fails() {
        let db = db();
        assert!(matches!(db.get(b"nope"), Err(Error::KeyNotFound(_))));

        db.put(b"a", b"1").unwrap();
        assert!(matches!(db.get(b"nope"), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_empty_tree_has_no_root_hash() {
        let db = db();
        assert_eq!(db.root_hash().unwrap(), None);
        assert_eq!(db.height().unwrap(), 0);
        assert!(db.is_empty().unwrap());
    }

    #[test]
    fn test_root_hash_appears_and_is_stable() {
        let db = db();
        db.put(b"a", b"1").unwrap();

        let first = db.root_hash().unwrap();
        assert!(first.is_some());
        // Idempotent read: no intervening mutation, identical result
        assert_eq!(db.root_hash().unwrap(), first);
    }

    #[test]
    fn test_overwrite_changes_root_hash() {
        let db = db();
        db.put(b"a", b"1").unwrap();
        let before = db.root_hash().unwrap();

        db.put(b"a", b"2").unwrap();
        let after = db.root_hash().unwrap();

        assert_ne!(before, after);
        assert_eq!(db.get(b"a").unwrap(), b"2");
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn test_delete_then_get_fails() {
        let db = db();
        db.put(b"a", b"1").unwrap();
        db.delete(b"a").unwrap();

        assert!(matches!(db.get(b"a"), Err(Error::KeyNotFound(_))));
        // Tree is empty again: deleting once more is an EmptyTree error
        assert!(matches!(db.delete(b"a"), Err(Error::EmptyTree)));
    }

    #[test]
    fn test_delete_missing_key_fails() {
        let db = db();
        db.put(b"a", b"1").unwrap();
        assert!(matches!(db.delete(b"z"), Err(Error::KeyNotFound(_))));
        // The failed delete left the tree untouched
        assert_eq!(db.get(b"a").unwrap(), b"1");
    }

    #[test]
    fn test_delete_on_empty_tree_fails() {
        let db = db();
        assert!(matches!(db.delete(b"a"), Err(Error::EmptyTree)));
    }

    #[test]
    fn test_emptiness_roundtrip() {
        let db = db();
        assert_eq!(db.root_hash().unwrap(), None);

        db.put(b"only", b"1").unwrap();
        assert!(db.root_hash().unwrap().is_some());

        db.delete(b"only").unwrap();
        assert_eq!(db.root_hash().unwrap(), None);
    }

    #[test]
    fn test_ascending_inserts_keep_order_and_height() {
        let db = db();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        db.put(b"c", b"3").unwrap();

        assert_eq!(db.height().unwrap(), 2);
        assert_eq!(
            db.keys().unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn test_failed_delete_keeps_root_hash() {
        let db = db();
        db.put(b"a", b"1").unwrap();
        let before = db.root_hash().unwrap();

        let _ = db.delete(b"missing");
        assert_eq!(db.root_hash().unwrap(), before);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.canopy");

        let hash = {
            let db = Database::create(&path).unwrap();
            db.put(b"a", b"1").unwrap();
            db.put(b"b", b"2").unwrap();
            db.root_hash().unwrap()
        };

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get(b"a").unwrap(), b"1");
        assert_eq!(db.get(b"b").unwrap(), b"2");
        assert_eq!(db.root_hash().unwrap(), hash);
    }

    #[test]
    fn test_open_missing_path_is_construction_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.canopy");
        assert!(matches!(
            Database::<FileStore>::open(&path),
            Err(Error::Construction(_))
        ));
    }
}
