//! Hash-consed dataflow term graph.
//!
//! A [`Graph`] owns every node of one execution path. Structurally identical
//! expressions are represented by a single node ([`NodeKey`] identity), edges
//! are bidirectional (ordered inputs plus a consumer set), and ids remain
//! stable across [`Graph::fork`] so that handles held by the processor, the
//! predicate and the memory map can be migrated into a fork by id lookup.

mod export;
mod node;
mod store;

pub use node::{Node, NodeId, NodeKey, NodeKind, OpTag};
pub use store::Graph;
