//! Node identifier, node kinds and the hash-consing key.
//!
//! Every value flowing through an analyzed function is represented by exactly
//! one [`Node`] inside a [`Graph`](crate::graph::Graph). The [`NodeKey`]
//! derived from a node's kind and ordered input list is the hash-consing
//! identity: two structurally identical expressions always resolve to the
//! same node instance within one graph.

use std::collections::HashSet;
use std::fmt;

/// A strongly-typed identifier for nodes within a dataflow graph.
///
/// `NodeId` wraps a `u32` index, providing type safety to prevent accidental
/// mixing of node ids with other integer values. Ids are assigned sequentially
/// by the owning graph and are stable across forks: migrating a handle into a
/// forked graph is a lookup of the same id.
///
/// # Thread Safety
///
/// `NodeId` is [`Copy`], [`Send`], and [`Sync`], enabling efficient passing
/// between threads and use in concurrent data structures.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Creates a new `NodeId` from a raw index value.
    ///
    /// This constructor is primarily intended for internal use and testing.
    /// Normal usage should obtain `NodeId` values from the builder operations.
    #[must_use]
    #[inline]
    pub const fn new(index: u32) -> Self {
        NodeId(index)
    }

    /// Returns the raw index value of this node identifier.
    #[must_use]
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// The operation or value a node represents.
///
/// Kinds without payload (the arithmetic and memory operations) derive their
/// meaning entirely from the ordered input list of the node carrying them.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NodeKind {
    /// A 32-bit literal value
    Constant(u32),
    /// An architectural register, identified by its index
    Register(u8),
    /// N-ary addition, variadic after flattening
    Add,
    /// N-ary multiplication, variadic after flattening
    Mult,
    /// A call to a function that was not inlined; the payload is the callee
    /// address and the single input is the first argument register
    Call {
        /// Address of the callee
        target: u64,
    },
    /// A memory read; the single input is the symbolic address
    Load,
    /// A memory write; inputs are the stored value and the symbolic address
    Store,
    /// N-ary exclusive or
    Xor,
    /// N-ary bitwise and
    And,
    /// N-ary bitwise or
    Or,
    /// Bitwise shift of input 0 by input 1; a negative constant amount is a
    /// right shift
    Shift,
    /// Rotate right of input 0 by input 1
    Rotate,
    /// The carry flag produced by the underlying operation
    Carry,
    /// The overflow flag produced by the underlying operation
    Overflow,
    /// A unique placeholder value that never merges with any other node
    Opaque {
        /// Uniqueness tag, taken from the graph's node counter at creation
        id: u32,
        /// Optional human-readable origin label
        label: String,
        /// Optional origin slot, -1 when unused
        slot: i32,
    },
}

impl NodeKind {
    /// Short operation name, as used in exports and diagnostics.
    #[must_use]
    pub fn mnemonic(&self) -> String {
        match self {
            NodeKind::Constant(value) => {
                if (*value as i32) < 0 {
                    format!("CONST:-{:x}", (*value as i32).wrapping_neg())
                } else {
                    format!("CONST:{:x}", value)
                }
            }
            NodeKind::Register(13) => "SP".to_string(),
            NodeKind::Register(14) => "LR".to_string(),
            NodeKind::Register(15) => "PC".to_string(),
            NodeKind::Register(index) => format!("R{}", index),
            NodeKind::Add => "ADD".to_string(),
            NodeKind::Mult => "MULT".to_string(),
            NodeKind::Call { target } => format!("CALL:sub_{:x}", target),
            NodeKind::Load => "LOAD".to_string(),
            NodeKind::Store => "STORE".to_string(),
            NodeKind::Xor => "XOR".to_string(),
            NodeKind::And => "AND".to_string(),
            NodeKind::Or => "ORR".to_string(),
            NodeKind::Shift => "SHIFT".to_string(),
            NodeKind::Rotate => "ROTATE".to_string(),
            NodeKind::Carry => "CARRY".to_string(),
            NodeKind::Overflow => "OVERFLOW".to_string(),
            NodeKind::Opaque { label, .. } => {
                if label.is_empty() {
                    "OPAQUE".to_string()
                } else {
                    format!("OPAQUE<{}>", label)
                }
            }
        }
    }
}

/// Discriminant for input-defined operations, used in [`NodeKey`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OpTag {
    /// [`NodeKind::Add`]
    Add,
    /// [`NodeKind::Mult`]
    Mult,
    /// [`NodeKind::Load`]
    Load,
    /// [`NodeKind::Store`]
    Store,
    /// [`NodeKind::Xor`]
    Xor,
    /// [`NodeKind::And`]
    And,
    /// [`NodeKind::Or`]
    Or,
    /// [`NodeKind::Shift`]
    Shift,
    /// [`NodeKind::Rotate`]
    Rotate,
    /// [`NodeKind::Carry`]
    Carry,
    /// [`NodeKind::Overflow`]
    Overflow,
}

/// Hash-consing identity of a node.
///
/// Two nodes with equal keys represent the same expression and must be the
/// same node instance within a graph. The key of an operation embeds the
/// ordered input id list; the builder interns commutative operations with
/// symbolic operands sorted ascending by id and any folded constant last, so
/// `add(a, b)` and `add(b, a)` resolve to the same node while positional
/// operations like shifts stay order-sensitive.
///
/// Opaque nodes are keyed by their uniqueness tag only, which makes every
/// opaque node distinct by construction.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum NodeKey {
    /// Literal value
    Constant(u32),
    /// Register index
    Register(u8),
    /// Opaque uniqueness tag
    Opaque(u32),
    /// Call site, keyed by callee address and argument ids
    Call {
        /// Address of the callee
        target: u64,
        /// Ordered argument node ids
        inputs: Vec<NodeId>,
    },
    /// Input-defined operation
    Op {
        /// Operation discriminant
        tag: OpTag,
        /// Ordered input node ids
        inputs: Vec<NodeId>,
    },
}

impl NodeKey {
    /// Computes the key for a prospective node before it is inserted.
    #[must_use]
    pub fn of(kind: &NodeKind, inputs: &[NodeId]) -> NodeKey {
        match kind {
            NodeKind::Constant(value) => NodeKey::Constant(*value),
            NodeKind::Register(index) => NodeKey::Register(*index),
            NodeKind::Opaque { id, .. } => NodeKey::Opaque(*id),
            NodeKind::Call { target } => NodeKey::Call {
                target: *target,
                inputs: inputs.to_vec(),
            },
            NodeKind::Add => NodeKey::op(OpTag::Add, inputs),
            NodeKind::Mult => NodeKey::op(OpTag::Mult, inputs),
            NodeKind::Load => NodeKey::op(OpTag::Load, inputs),
            NodeKind::Store => NodeKey::op(OpTag::Store, inputs),
            NodeKind::Xor => NodeKey::op(OpTag::Xor, inputs),
            NodeKind::And => NodeKey::op(OpTag::And, inputs),
            NodeKind::Or => NodeKey::op(OpTag::Or, inputs),
            NodeKind::Shift => NodeKey::op(OpTag::Shift, inputs),
            NodeKind::Rotate => NodeKey::op(OpTag::Rotate, inputs),
            NodeKind::Carry => NodeKey::op(OpTag::Carry, inputs),
            NodeKind::Overflow => NodeKey::op(OpTag::Overflow, inputs),
        }
    }

    fn op(tag: OpTag, inputs: &[NodeId]) -> NodeKey {
        NodeKey::Op {
            tag,
            inputs: inputs.to_vec(),
        }
    }
}

/// A single node of the dataflow graph.
///
/// Inputs are ordered and may repeat (for example `x * x`). The consumer set
/// is the exact inverse of the input lists of all other nodes and is
/// maintained by the owning graph on insert and remove.
#[derive(Clone, Debug)]
pub struct Node {
    /// Graph-local identifier, stable across forks
    pub id: NodeId,
    /// Operation or value this node represents
    pub kind: NodeKind,
    /// Ordered producer list; duplicates allowed
    pub inputs: Vec<NodeId>,
    /// Deduplicated view of `inputs`
    pub unique_inputs: HashSet<NodeId>,
    /// Ids of nodes that list this node among their inputs
    pub consumers: HashSet<NodeId>,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind, inputs: Vec<NodeId>) -> Node {
        let unique_inputs = inputs.iter().copied().collect();
        Node {
            id,
            kind,
            inputs,
            unique_inputs,
            consumers: HashSet::new(),
        }
    }

    /// The hash-consing key of this node.
    #[must_use]
    pub fn key(&self) -> NodeKey {
        NodeKey::of(&self.kind, &self.inputs)
    }

    /// Returns the literal value if this node is a constant.
    #[must_use]
    pub fn constant_value(&self) -> Option<u32> {
        match self.kind {
            NodeKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    /// True if this node is a constant.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, NodeKind::Constant(_))
    }

    /// True if this node is a register.
    #[must_use]
    pub fn is_register(&self) -> bool {
        matches!(self.kind, NodeKind::Register(_))
    }
}
