//! Search, insertion, deletion, and rebalancing over stored node records
//!
//! All structural writes of one top-level operation flow through a single
//! transaction owned by [`AvlTree`]. Nodes are copy-on-write: a changed
//! node is persisted under a freshly allocated id and the superseded record
//! is left in place, so readers descending from an older root always see a
//! consistent tree.

use super::Node;
use crate::model::Hash;
use crate::store::{Backend, Transaction};
use crate::{Error, Result};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Backing-store key for a node record
pub(crate) fn node_key(id: u64) -> Vec<u8> {
    format!("node:{}", id).into_bytes()
}

/// Anything node records can be loaded from
pub(crate) trait NodeRead {
    fn node(&mut self, id: u64) -> Result<Node>;
}

fn decode_node(id: u64, bytes: &[u8]) -> Result<Node> {
    let node: Node = bincode::deserialize(bytes)?;
    if node.id != id {
        return Err(Error::Corruption(format!(
            "node record {} carries id {}",
            id, node.id
        )));
    }
    Ok(node)
}

/// Reads committed node records straight from a backend, for lock-free gets
pub(crate) struct BackendNodes<'a, B: Backend + ?Sized> {
    backend: &'a B,
}

impl<'a, B: Backend + ?Sized> BackendNodes<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        BackendNodes { backend }
    }
}

impl<B: Backend + ?Sized> NodeRead for BackendNodes<'_, B> {
    fn node(&mut self, id: u64) -> Result<Node> {
        let bytes = self.backend.get(&node_key(id)).map_err(|err| match err {
            Error::KeyNotFound(_) => Error::Corruption(format!("missing node record {}", id)),
            other => other,
        })?;
        decode_node(id, &bytes)
    }
}

/// Standard BST descent. Returns the node where descent terminated: the
/// exact match, or the last node visited on a miss. Callers verify key
/// equality themselves.
pub(crate) fn search<S: NodeRead>(source: &mut S, mut node: Node, key: &[u8]) -> Result<Node> {
    loop {
        let next = match key.cmp(&node.key) {
            Ordering::Equal => return Ok(node),
            Ordering::Less => node.left,
            Ordering::Greater => node.right,
        };
        match next {
            Some(id) => node = source.node(id)?,
            None => return Ok(node),
        }
    }
}

/// In-order traversal collecting every key under `node` in ascending order
pub(crate) fn in_order<S: NodeRead>(
    source: &mut S,
    node: &Node,
    out: &mut Vec<Vec<u8>>,
) -> Result<()> {
    if let Some(left) = node.left {
        let left = source.node(left)?;
        in_order(source, &left, out)?;
    }
    out.push(node.key.clone());
    if let Some(right) = node.right {
        let right = source.node(right)?;
        in_order(source, &right, out)?;
    }
    Ok(())
}

/// One mutating operation's view of the tree.
///
/// Owns the operation's transaction, an id allocator cursor, and a cache of
/// loaded records so repeated visits inside one operation stay in memory.
pub(crate) struct AvlTree<'a, B: Backend + ?Sized> {
    tx: Transaction<'a, B>,
    cache: HashMap<u64, Node>,
    next_id: u64,
}

impl<'a, B: Backend + ?Sized> AvlTree<'a, B> {
    pub fn new(tx: Transaction<'a, B>, next_id: u64) -> Self {
        AvlTree {
            tx,
            cache: HashMap::new(),
            next_id,
        }
    }

    /// Current allocator watermark
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Hand the buffered writes back for root-pointer updates and commit
    pub fn into_transaction(self) -> Transaction<'a, B> {
        self.tx
    }

    /// Load a node record, consulting the operation cache first
    pub fn node(&mut self, id: u64) -> Result<Node> {
        if let Some(node) = self.cache.get(&id) {
            return Ok(node.clone());
        }
        let bytes = self.tx.get(&node_key(id)).map_err(|err| match err {
            Error::KeyNotFound(_) => Error::Corruption(format!("missing node record {}", id)),
            other => other,
        })?;
        let node = decode_node(id, &bytes)?;
        self.cache.insert(id, node.clone());
        Ok(node)
    }

    /// Insert or overwrite `key`, returning the new subtree root id.
    ///
    /// `root` is `None` for an empty tree, in which case the allocated leaf
    /// becomes the root.
    pub fn insert(&mut self, root: Option<u64>, key: &[u8], value: &[u8]) -> Result<u64> {
        match root {
            None => {
                let leaf = Node::leaf(self.alloc(), key.to_vec(), value.to_vec());
                self.persist(&leaf)?;
                Ok(leaf.id)
            }
            Some(id) => self.insert_at(id, key, value),
        }
    }

    /// Remove `key` from the subtree rooted at `root`, failing with
    /// [`Error::KeyNotFound`] when absent. Returns the new subtree root id,
    /// or `None` when the subtree is now empty.
    pub fn delete(&mut self, root: u64, key: &[u8]) -> Result<Option<u64>> {
        let node = self.node(root)?;
        match key.cmp(&node.key) {
            Ordering::Less => {
                let left = node.left.ok_or_else(|| Error::key_not_found(key))?;
                let mut updated = node;
                updated.left = self.delete(left, key)?;
                Ok(Some(self.rebalance(updated)?))
            }
            Ordering::Greater => {
                let right = node.right.ok_or_else(|| Error::key_not_found(key))?;
                let mut updated = node;
                updated.right = self.delete(right, key)?;
                Ok(Some(self.rebalance(updated)?))
            }
            Ordering::Equal => match (node.left, node.right) {
                (None, None) => Ok(None),
                (Some(child), None) | (None, Some(child)) => Ok(Some(child)),
                (Some(_), Some(right)) => {
                    // Replace with the in-order successor, then remove the
                    // successor from the right subtree.
                    let successor = self.leftmost(right)?;
                    let mut updated = node;
                    updated.key = successor.key.clone();
                    updated.value = successor.value;
                    updated.right = self.delete(right, &successor.key)?;
                    Ok(Some(self.rebalance(updated)?))
                }
            },
        }
    }

    fn insert_at(&mut self, id: u64, key: &[u8], value: &[u8]) -> Result<u64> {
        let node = self.node(id)?;
        match key.cmp(&node.key) {
            Ordering::Equal => {
                // Overwrite in place; structure and heights are unchanged
                let mut updated = node;
                updated.value = value.to_vec();
                self.refresh(&mut updated)?;
                let updated = self.persist_new(updated)?;
                Ok(updated.id)
            }
            Ordering::Less => {
                let child = match node.left {
                    Some(left) => self.insert_at(left, key, value)?,
                    None => {
                        let leaf = Node::leaf(self.alloc(), key.to_vec(), value.to_vec());
                        self.persist(&leaf)?;
                        leaf.id
                    }
                };
                let mut updated = node;
                updated.left = Some(child);
                self.rebalance(updated)
            }
            Ordering::Greater => {
                let child = match node.right {
                    Some(right) => self.insert_at(right, key, value)?,
                    None => {
                        let leaf = Node::leaf(self.alloc(), key.to_vec(), value.to_vec());
                        self.persist(&leaf)?;
                        leaf.id
                    }
                };
                let mut updated = node;
                updated.right = Some(child);
                self.rebalance(updated)
            }
        }
    }

    /// Recompute height and hash, restore the AVL invariant if violated,
    /// and persist. Returns the id of the (possibly rotated) subtree root.
    fn rebalance(&mut self, mut node: Node) -> Result<u64> {
        self.refresh(&mut node)?;
        let balance = self.balance_factor(&node)?;

        if balance > 1 {
            let left_id = node
                .left
                .ok_or_else(|| Error::Corruption("left-heavy node without left child".into()))?;
            let left = self.node(left_id)?;
            if self.balance_factor(&left)? < 0 {
                // Left-right: rotate the child into the matching skew first
                let new_left = self.rotate_left(left)?;
                node.left = Some(new_left.id);
                self.refresh(&mut node)?;
            }
            let new_root = self.rotate_right(node)?;
            return Ok(new_root.id);
        }

        if balance < -1 {
            let right_id = node
                .right
                .ok_or_else(|| Error::Corruption("right-heavy node without right child".into()))?;
            let right = self.node(right_id)?;
            if self.balance_factor(&right)? > 0 {
                let new_right = self.rotate_right(right)?;
                node.right = Some(new_right.id);
                self.refresh(&mut node)?;
            }
            let new_root = self.rotate_left(node)?;
            return Ok(new_root.id);
        }

        let node = self.persist_new(node)?;
        Ok(node.id)
    }

    /// Rotate the subtree rooted at `node` to the left; the right child is
    /// promoted. Both restructured nodes are rehashed and persisted.
    fn rotate_left(&mut self, mut node: Node) -> Result<Node> {
        let pivot_id = node
            .right
            .ok_or_else(|| Error::Corruption("left rotation without right child".into()))?;
        let mut pivot = self.node(pivot_id)?;

        node.right = pivot.left;
        self.refresh(&mut node)?;
        let node = self.persist_new(node)?;

        pivot.left = Some(node.id);
        self.refresh(&mut pivot)?;
        self.persist_new(pivot)
    }

    /// Mirror image of [`Self::rotate_left`]; the left child is promoted.
    fn rotate_right(&mut self, mut node: Node) -> Result<Node> {
        let pivot_id = node
            .left
            .ok_or_else(|| Error::Corruption("right rotation without left child".into()))?;
        let mut pivot = self.node(pivot_id)?;

        node.left = pivot.right;
        self.refresh(&mut node)?;
        let node = self.persist_new(node)?;

        pivot.right = Some(node.id);
        self.refresh(&mut pivot)?;
        self.persist_new(pivot)
    }

    /// Recompute `height` and `hash` from the current children
    fn refresh(&mut self, node: &mut Node) -> Result<()> {
        let (left_height, left_hash) = self.child_info(node.left)?;
        let (right_height, right_hash) = self.child_info(node.right)?;
        node.height = 1 + left_height.max(right_height);
        node.hash = Node::compute_hash(
            &node.key,
            &node.value,
            left_hash.as_ref(),
            right_hash.as_ref(),
        );
        Ok(())
    }

    fn balance_factor(&mut self, node: &Node) -> Result<i32> {
        let (left_height, _) = self.child_info(node.left)?;
        let (right_height, _) = self.child_info(node.right)?;
        Ok(left_height as i32 - right_height as i32)
    }

    fn child_info(&mut self, id: Option<u64>) -> Result<(u32, Option<Hash>)> {
        match id {
            None => Ok((0, None)),
            Some(id) => {
                let child = self.node(id)?;
                Ok((child.height, Some(child.hash)))
            }
        }
    }

    fn leftmost(&mut self, id: u64) -> Result<Node> {
        let mut node = self.node(id)?;
        while let Some(left) = node.left {
            node = self.node(left)?;
        }
        Ok(node)
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Persist `node` under a fresh id: copy-on-write identity for every
    /// structural change.
    fn persist_new(&mut self, mut node: Node) -> Result<Node> {
        node.id = self.alloc();
        self.persist(&node)?;
        Ok(node)
    }

    fn persist(&mut self, node: &Node) -> Result<()> {
        let bytes = bincode::serialize(node)?;
        self.tx.put(&node_key(node.id), &bytes);
        self.cache.insert(node.id, node.clone());
        Ok(())
    }
}
