//! Persisted tree node and its subtree digest

use crate::model::Hash;
use serde::{Deserialize, Serialize};

/// One vertex of the Merkle AVL tree.
///
/// Records are immutable once written: every structural change is persisted
/// under a freshly allocated id, so a record reachable from some root never
/// changes underneath a reader holding that root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    /// Backing-store identity, allocated monotonically and never reused
    pub id: u64,
    /// Opaque key; ordering is total lexicographic byte order
    pub key: Vec<u8>,
    /// Opaque value
    pub value: Vec<u8>,
    /// Left child id (all keys strictly less)
    pub left: Option<u64>,
    /// Right child id (all keys strictly greater)
    pub right: Option<u64>,
    /// Subtree height; a leaf has height 1
    pub height: u32,
    /// Digest over key, value, and both child digests
    pub hash: Hash,
}

impl Node {
    /// Create a leaf node
    pub fn leaf(id: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        let hash = Node::compute_hash(&key, &value, None, None);
        Node {
            id,
            key,
            value,
            left: None,
            right: None,
            height: 1,
            hash,
        }
    }

    /// Compute the subtree digest for a node with the given content.
    ///
    /// Key and value are length-prefixed so the preimage cannot be
    /// reframed; an absent child contributes the zero digest.
    pub fn compute_hash(
        key: &[u8],
        value: &[u8],
        left: Option<&Hash>,
        right: Option<&Hash>,
    ) -> Hash {
        Hash::digest_many(&[
            &(key.len() as u64).to_le_bytes(),
            key,
            &(value.len() as u64).to_le_bytes(),
            value,
            left.unwrap_or(&Hash::ZERO).as_bytes(),
            right.unwrap_or(&Hash::ZERO).as_bytes(),
        ])
    }

    /// Whether this node has no children
    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}
