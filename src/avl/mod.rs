//! The Merkle AVL tree: persisted node records and the rebalancing algorithm

mod node;
mod tree;

pub use node::Node;
pub(crate) use tree::{in_order, search, AvlTree, BackendNodes, NodeRead};
