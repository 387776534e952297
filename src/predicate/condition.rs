//! A single relational constraint between graph expressions.
//!
//! Conditions arise from conditional instructions: the processor lowers a
//! condition code plus the flag-setting operation back into a comparison of
//! graph nodes. Before a condition enters a [`Predicate`](crate::predicate::Predicate)
//! it is normalized into `expr REL constant` form with only non-strict
//! relational operators, which is what makes the per-expression merge matrix
//! tractable.

use crate::builder::Builder;
use crate::graph::{Graph, NodeId, NodeKind};
use crate::Result;

/// Relational operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    /// Equal
    Eq,
    /// Not equal
    Neq,
    /// Unsigned greater or equal
    Uge,
    /// Unsigned less than
    Ult,
    /// Unsigned greater than
    Ugt,
    /// Unsigned less or equal
    Ule,
    /// Signed greater or equal
    Ge,
    /// Signed less than
    Lt,
    /// Signed greater than
    Gt,
    /// Signed less or equal
    Le,
}

impl RelOp {
    /// The operator describing the complement of this comparison.
    #[must_use]
    pub fn negate(self) -> RelOp {
        match self {
            RelOp::Eq => RelOp::Neq,
            RelOp::Neq => RelOp::Eq,
            RelOp::Uge => RelOp::Ult,
            RelOp::Ult => RelOp::Uge,
            RelOp::Ugt => RelOp::Ule,
            RelOp::Ule => RelOp::Ugt,
            RelOp::Ge => RelOp::Lt,
            RelOp::Lt => RelOp::Ge,
            RelOp::Gt => RelOp::Le,
            RelOp::Le => RelOp::Gt,
        }
    }

    /// The operator resulting from swapping the two operands.
    #[must_use]
    pub fn flip(self) -> RelOp {
        match self {
            RelOp::Eq => RelOp::Eq,
            RelOp::Neq => RelOp::Neq,
            RelOp::Uge => RelOp::Ule,
            RelOp::Ult => RelOp::Ugt,
            RelOp::Ugt => RelOp::Ult,
            RelOp::Ule => RelOp::Uge,
            RelOp::Ge => RelOp::Le,
            RelOp::Lt => RelOp::Gt,
            RelOp::Gt => RelOp::Lt,
            RelOp::Le => RelOp::Ge,
        }
    }
}

impl std::fmt::Display for RelOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RelOp::Eq => "=",
            RelOp::Neq => "!=",
            RelOp::Uge => ">=u",
            RelOp::Ult => "<u",
            RelOp::Ugt => ">u",
            RelOp::Ule => "<=u",
            RelOp::Ge => ">=",
            RelOp::Lt => "<",
            RelOp::Gt => ">",
            RelOp::Le => "<=",
        };
        f.write_str(text)
    }
}

/// One path condition over graph expressions.
///
/// The `True` and `False` sentinels absorb conditions that normalization
/// could decide outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Trivially satisfied
    True,
    /// Unsatisfiable
    False,
    /// Comparison between two graph expressions
    Expr {
        /// Left-hand expression
        lhs: NodeId,
        /// Relational operator
        op: RelOp,
        /// Right-hand expression, a constant once normalized
        rhs: NodeId,
    },
}

impl Condition {
    /// Creates a comparison condition.
    #[must_use]
    pub fn new(lhs: NodeId, op: RelOp, rhs: NodeId) -> Condition {
        Condition::Expr { lhs, op, rhs }
    }

    /// The complement of this condition.
    #[must_use]
    pub fn negate(&self) -> Condition {
        match self {
            Condition::True => Condition::False,
            Condition::False => Condition::True,
            Condition::Expr { lhs, op, rhs } => Condition::Expr {
                lhs: *lhs,
                op: op.negate(),
                rhs: *rhs,
            },
        }
    }

    /// Re-resolves the node handles in a forked graph.
    pub fn migrate(&self, graph: &Graph) -> Result<Condition> {
        match self {
            Condition::Expr { lhs, op, rhs } => Ok(Condition::Expr {
                lhs: graph.migrate(*lhs)?,
                op: *op,
                rhs: graph.migrate(*rhs)?,
            }),
            other => Ok(*other),
        }
    }

    /// Renders the condition against its graph.
    #[must_use]
    pub fn expression(&self, graph: &Graph, max_depth: i32) -> String {
        match self {
            Condition::True => "true".to_string(),
            Condition::False => "false".to_string(),
            Condition::Expr { lhs, op, rhs } => format!(
                "{} {} {}",
                graph.expression(*lhs, max_depth),
                op,
                graph.expression(*rhs, max_depth)
            ),
        }
    }

    /// Rewrites the condition into canonical `expr REL constant` form.
    ///
    /// The right-hand side is forced constant (swapping operands or moving
    /// everything left as `lhs - rhs REL 0`), constants are pulled out of the
    /// outermost addition, multiplication, exclusive-or or right-shift layer
    /// by layer, strict comparisons become non-strict with boundary
    /// saturation, and fully constant comparisons collapse to the `True` or
    /// `False` sentinel.
    pub fn normalize(&mut self, builder: &mut Builder) {
        let Condition::Expr { mut lhs, mut op, mut rhs } = *self else {
            return;
        };

        if constant_of(builder, rhs).is_none() {
            if constant_of(builder, lhs).is_some() {
                std::mem::swap(&mut lhs, &mut rhs);
                op = op.flip();
            } else {
                let minus_one = builder.constant(0xffff_ffff);
                let negated = builder.mult(rhs, minus_one);
                lhs = builder.add(lhs, negated);
                rhs = builder.constant(0);
            }
        }

        loop {
            let Some(target) = constant_of(builder, rhs) else {
                break;
            };
            match junction_with_constant(builder, lhs) {
                Some(JunctionKind::Add { pulled, rest_head, tail }) => {
                    let mut replacement = match rest_head {
                        RestHead::Empty => builder.constant(0),
                        RestHead::Single(node) => node,
                        RestHead::Pair(a, b) => builder.add(a, b),
                    };
                    for node in tail {
                        replacement = builder.add(replacement, node);
                    }
                    lhs = replacement;
                    rhs = builder.constant(target.wrapping_sub(pulled));
                    continue;
                }
                Some(JunctionKind::Mult { pulled, rest_head, tail }) => {
                    let factor = pulled as i32;
                    if target == 0x8000_0000 && pulled == 0xffff_ffff {
                        // -0x80000000 / -1 does not fit 32 bits
                        *self = Condition::False;
                        return;
                    }
                    if factor != 0 && (target as i32).wrapping_rem(factor) == 0 {
                        let mut replacement = match rest_head {
                            RestHead::Empty => builder.constant(0),
                            RestHead::Single(node) => node,
                            RestHead::Pair(a, b) => builder.mult(a, b),
                        };
                        for node in tail {
                            replacement = builder.mult(replacement, node);
                        }
                        lhs = replacement;
                        rhs = builder.constant((target as i32).wrapping_div(factor) as u32);
                        if factor < 0 {
                            op = op.flip();
                        }
                        continue;
                    }
                }
                Some(JunctionKind::Xor { pulled, rest_head, tail }) => {
                    let mut replacement = match rest_head {
                        RestHead::Empty => builder.constant(0),
                        RestHead::Single(node) => node,
                        RestHead::Pair(a, b) => builder.xor(a, b),
                    };
                    for node in tail {
                        replacement = builder.xor(replacement, node);
                    }
                    lhs = replacement;
                    rhs = builder.constant(target ^ pulled);
                    continue;
                }
                Some(JunctionKind::ShiftRight { value, amount }) => {
                    lhs = value;
                    rhs = builder.constant(target.wrapping_shl(amount));
                    continue;
                }
                Some(JunctionKind::RotateRight { value, amount }) => {
                    lhs = value;
                    rhs = builder.constant(target.rotate_left(amount));
                    continue;
                }
                None => {}
            }
            break;
        }

        // strict comparisons become non-strict so the merge matrix only
        // deals with six operators, saturating at the type bounds
        if let Some(target) = constant_of(builder, rhs) {
            match op {
                RelOp::Ugt => {
                    if target == 0xffff_ffff {
                        *self = Condition::False;
                        return;
                    }
                    rhs = builder.constant(target + 1);
                    op = RelOp::Uge;
                }
                RelOp::Uge => {
                    if target == 0 {
                        *self = Condition::True;
                        return;
                    }
                }
                RelOp::Ult => {
                    if target == 0 {
                        *self = Condition::False;
                        return;
                    }
                    rhs = builder.constant(target - 1);
                    op = RelOp::Ule;
                }
                RelOp::Ule => {
                    if target == 0xffff_ffff {
                        *self = Condition::True;
                        return;
                    }
                }
                RelOp::Gt => {
                    if target == 0x7fff_ffff {
                        *self = Condition::False;
                        return;
                    }
                    rhs = builder.constant(target.wrapping_add(1));
                    op = RelOp::Ge;
                }
                RelOp::Ge => {
                    if target == 0x8000_0000 {
                        *self = Condition::True;
                        return;
                    }
                }
                RelOp::Lt => {
                    if target == 0x8000_0000 {
                        *self = Condition::False;
                        return;
                    }
                    rhs = builder.constant(target.wrapping_sub(1));
                    op = RelOp::Le;
                }
                RelOp::Le => {
                    if target == 0x7fff_ffff {
                        *self = Condition::True;
                        return;
                    }
                }
                RelOp::Eq | RelOp::Neq => {}
            }
        }

        if let (Some(left), Some(right)) = (constant_of(builder, lhs), constant_of(builder, rhs)) {
            let holds = match op {
                RelOp::Eq => left == right,
                RelOp::Neq => left != right,
                RelOp::Uge => left >= right,
                RelOp::Ule => left <= right,
                RelOp::Ge => (left as i32) >= (right as i32),
                RelOp::Le => (left as i32) <= (right as i32),
                RelOp::Ult => left < right,
                RelOp::Ugt => left > right,
                RelOp::Lt => (left as i32) < (right as i32),
                RelOp::Gt => (left as i32) > (right as i32),
            };
            *self = if holds { Condition::True } else { Condition::False };
            return;
        }

        *self = Condition::Expr { lhs, op, rhs };
    }
}

enum RestHead {
    Empty,
    Single(NodeId),
    Pair(NodeId, NodeId),
}

enum JunctionKind {
    Add {
        pulled: u32,
        rest_head: RestHead,
        tail: Vec<NodeId>,
    },
    Mult {
        pulled: u32,
        rest_head: RestHead,
        tail: Vec<NodeId>,
    },
    Xor {
        pulled: u32,
        rest_head: RestHead,
        tail: Vec<NodeId>,
    },
    ShiftRight {
        value: NodeId,
        amount: u32,
    },
    RotateRight {
        value: NodeId,
        amount: u32,
    },
}

fn constant_of(builder: &Builder, id: NodeId) -> Option<u32> {
    builder.graph().node(id).and_then(|node| node.constant_value())
}

/// Decomposes the outermost layer of `lhs` when a constant can be pulled
/// through it onto the right-hand side.
fn junction_with_constant(builder: &Builder, lhs: NodeId) -> Option<JunctionKind> {
    let node = builder.graph().node(lhs)?;
    match node.kind {
        NodeKind::Add | NodeKind::Mult | NodeKind::Xor => {
            let inputs = node.inputs.clone();
            let mut pulled = None;
            let mut first = None;
            let mut second = None;
            let mut tail = Vec::new();
            for input in &inputs {
                if let Some(value) = constant_of(builder, *input) {
                    pulled = Some(value);
                } else if first.is_none() {
                    first = Some(*input);
                } else if second.is_none() {
                    second = Some(*input);
                } else {
                    tail.push(*input);
                }
            }
            let pulled = pulled?;
            let rest_head = match (first, second) {
                (None, _) => RestHead::Empty,
                (Some(a), None) => RestHead::Single(a),
                (Some(a), Some(b)) => RestHead::Pair(a, b),
            };
            Some(match node.kind {
                NodeKind::Add => JunctionKind::Add { pulled, rest_head, tail },
                NodeKind::Mult => JunctionKind::Mult { pulled, rest_head, tail },
                _ => JunctionKind::Xor { pulled, rest_head, tail },
            })
        }
        NodeKind::Shift => {
            if node.inputs.len() != 2 {
                return None;
            }
            let value = node.inputs[0];
            let amount = constant_of(builder, node.inputs[1])? as i32;
            // only a right shift can be undone by shifting the target back
            if amount >= 0 {
                return None;
            }
            Some(JunctionKind::ShiftRight {
                value,
                amount: amount.unsigned_abs(),
            })
        }
        NodeKind::Rotate => {
            if node.inputs.len() != 2 {
                return None;
            }
            let value = node.inputs[0];
            let amount = constant_of(builder, node.inputs[1])? & 31;
            if amount == 0 {
                return None;
            }
            Some(JunctionKind::RotateRight { value, amount })
        }
        _ => None,
    }
}
