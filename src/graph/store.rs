//! Hash-consed node arena with bidirectional edges.

use std::collections::HashMap;

use crate::graph::{Node, NodeId, NodeKey, NodeKind};
use crate::Result;

/// A term graph over [`Node`]s with hash-consing and bidirectional edges.
///
/// The graph owns every node of one execution path. Nodes are indexed both by
/// id and by their [`NodeKey`]; inserting a key that is already present is a
/// structural defect, so callers go through [`Graph::intern`] which resolves
/// to the existing instance instead.
///
/// Ids increase monotonically and are never reused, which keeps them stable
/// across [`Graph::fork`]: a handle held before a fork resolves to the
/// equivalent node in the fork by plain id lookup.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    index: HashMap<NodeKey, NodeId>,
    next_id: u32,
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Looks up a node by its hash-consing key.
    #[must_use]
    pub fn find(&self, key: &NodeKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    /// Re-resolves a handle from another (parent) graph in this graph.
    ///
    /// Fork preserves all ids, so this is an id lookup that treats absence as
    /// a structural error.
    pub fn migrate(&self, id: NodeId) -> Result<NodeId> {
        if self.nodes.contains_key(&id) {
            Ok(id)
        } else {
            Err(crate::Error::Migration(id.index()))
        }
    }

    /// Returns the existing node for the given expression, or inserts a new
    /// one.
    ///
    /// This is the hash-consing entry point: all builder operations funnel
    /// through it after simplification.
    pub fn intern(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let key = NodeKey::of(&kind, &inputs);
        if let Some(existing) = self.index.get(&key) {
            return *existing;
        }
        self.insert_new(key, kind, inputs)
    }

    fn insert_new(&mut self, key: NodeKey, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;

        let node = Node::new(id, kind, inputs);
        for input in &node.unique_inputs {
            if let Some(producer) = self.nodes.get_mut(input) {
                producer.consumers.insert(id);
            }
        }
        self.index.insert(key, id);
        self.nodes.insert(id, node);
        id
    }

    /// Removes a node, untying it from its producers.
    ///
    /// Callers must have removed or scheduled removal of all consumers first;
    /// the cleanup pass guarantees this ordering.
    pub(crate) fn remove(&mut self, id: NodeId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        for input in &node.unique_inputs {
            if let Some(producer) = self.nodes.get_mut(input) {
                producer.consumers.remove(&id);
            }
        }
        self.index.remove(&node.key());
    }

    /// The value the next inserted node will receive as id.
    ///
    /// Used to mint uniqueness tags for opaque nodes.
    #[must_use]
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Iterates all node ids in ascending order.
    ///
    /// Ascending id order is the deterministic traversal used by the export
    /// and by the cleanup pass.
    #[must_use]
    pub fn sorted_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Iterates all nodes in arbitrary order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Creates a node-disjoint copy preserving ids, topology and the id
    /// counter.
    ///
    /// Because nodes reference each other by id rather than by pointer, the
    /// fork is a structural clone; no recursive copy is needed.
    #[must_use]
    pub fn fork(&self) -> Graph {
        self.clone()
    }
}
