//! Path predicates and constraint merging.
//!
//! A [`Predicate`] is the conjunction of all conditions taken on one
//! execution path. Conditions entering the predicate are normalized first,
//! then merged pairwise against existing entries with the same left-hand
//! expression: a new condition can be absorbed, can narrow an entry, or can
//! contradict one, in which case the whole predicate collapses to `false`
//! and the path is dead.

use crate::builder::Builder;
use crate::graph::Graph;
use crate::Result;

mod condition;

pub use condition::{Condition, RelOp};

/// Answer of a read-only satisfiability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfied {
    /// Implied by the current predicate
    Always,
    /// Contradicts the current predicate
    Never,
    /// Neither implied nor contradicted
    Sometimes,
}

/// How a normalized condition relates to an existing entry over the same
/// left-hand expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MergeOutcome {
    /// No relationship, both conditions stand
    NotMergable,
    /// The entry already implies the new condition
    AlwaysSatisfied,
    /// The entry contradicts the new condition
    NeverSatisfied,
    /// Entry and new condition combine into the carried condition
    Mergable(Condition),
}

/// Conjunction of path conditions.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    conditions: Vec<Condition>,
}

impl Predicate {
    /// Creates an empty, always-true predicate.
    #[must_use]
    pub fn new() -> Predicate {
        Predicate::default()
    }

    /// Number of conjuncts currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Whether the predicate is the trivial `true`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether the predicate has collapsed to `false`.
    #[must_use]
    pub fn is_unsatisfiable(&self) -> bool {
        self.conditions.first() == Some(&Condition::False)
    }

    /// The current conjuncts.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Adds a condition to the conjunction.
    ///
    /// The condition is normalized, then repeatedly compared against entries
    /// with the same left-hand expression. Whenever a comparison produces a
    /// combined condition the entry is removed and the scan restarts with the
    /// combined condition, so chains of narrowing steps resolve in one call.
    pub fn merge_condition(&mut self, condition: Condition, builder: &mut Builder) -> Result<()> {
        let mut condition = condition;
        condition.normalize(builder);

        loop {
            match condition {
                Condition::True => return Ok(()),
                Condition::False => {
                    self.conditions = vec![Condition::False];
                    return Ok(());
                }
                Condition::Expr { .. } => {}
            }

            let mut index = 0;
            let mut restart = false;
            while index < self.conditions.len() {
                let entry = self.conditions[index];
                if entry == Condition::False {
                    return Ok(());
                }
                match compare_normalized(builder, &condition, &entry)? {
                    MergeOutcome::NeverSatisfied => {
                        self.conditions = vec![Condition::False];
                        return Ok(());
                    }
                    MergeOutcome::AlwaysSatisfied => return Ok(()),
                    MergeOutcome::Mergable(merged) => {
                        self.conditions.remove(index);
                        condition = merged;
                        condition.normalize(builder);
                        restart = true;
                        break;
                    }
                    MergeOutcome::NotMergable => index += 1,
                }
            }
            if restart {
                continue;
            }
            self.conditions.push(condition);
            return Ok(());
        }
    }

    /// Read-only query of how a condition relates to the predicate.
    ///
    /// Unlike [`merge_condition`](Predicate::merge_condition) this never
    /// alters the conjunct list.
    pub fn is_satisfied(&self, condition: Condition, builder: &mut Builder) -> Result<Satisfied> {
        let mut condition = condition;
        condition.normalize(builder);
        match condition {
            Condition::True => return Ok(Satisfied::Always),
            Condition::False => return Ok(Satisfied::Never),
            Condition::Expr { .. } => {}
        }
        for entry in &self.conditions {
            if *entry == Condition::False {
                return Ok(Satisfied::Never);
            }
            match compare_normalized(builder, &condition, entry)? {
                MergeOutcome::AlwaysSatisfied => return Ok(Satisfied::Always),
                MergeOutcome::NeverSatisfied => return Ok(Satisfied::Never),
                MergeOutcome::Mergable(_) | MergeOutcome::NotMergable => {}
            }
        }
        Ok(Satisfied::Sometimes)
    }

    /// Re-resolves every conjunct in a forked graph.
    pub fn migrate(&self, graph: &Graph) -> Result<Predicate> {
        let mut conditions = Vec::with_capacity(self.conditions.len());
        for condition in &self.conditions {
            conditions.push(condition.migrate(graph)?);
        }
        Ok(Predicate { conditions })
    }

    /// Renders the conjunction against its graph.
    #[must_use]
    pub fn expression(&self, graph: &Graph, max_depth: i32) -> String {
        if self.conditions.is_empty() {
            return "true".to_string();
        }
        self.conditions
            .iter()
            .map(|condition| condition.expression(graph, max_depth))
            .collect::<Vec<_>>()
            .join(" /\\ ")
    }
}

/// Relates two normalized conditions over the same left-hand expression.
///
/// Only the non-strict operators survive normalization; a strict operator
/// reaching this point is a bug. Conditions over different expressions, or
/// with a symbolic right-hand side, never merge.
fn compare_normalized(
    builder: &mut Builder,
    c1: &Condition,
    c2: &Condition,
) -> Result<MergeOutcome> {
    let (Condition::Expr { lhs: lhs1, op: op1, rhs: rhs1 },
         Condition::Expr { lhs: lhs2, op: op2, rhs: rhs2 }) = (c1, c2)
    else {
        return Ok(MergeOutcome::NotMergable);
    };
    if lhs1 != lhs2 {
        return Ok(MergeOutcome::NotMergable);
    }
    let lhs = *lhs1;
    let (Some(v1), Some(v2)) = (
        builder.graph().node(*rhs1).and_then(|node| node.constant_value()),
        builder.graph().node(*rhs2).and_then(|node| node.constant_value()),
    ) else {
        return Ok(MergeOutcome::NotMergable);
    };

    let s1 = v1 as i32;
    let s2 = v2 as i32;
    let rebuilt = |builder: &mut Builder, op: RelOp, value: u32| {
        let rhs = builder.constant(value);
        Condition::new(lhs, op, rhs)
    };

    let outcome = match (op1, op2) {
        (RelOp::Eq, RelOp::Eq) => {
            if v1 == v2 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NeverSatisfied
            }
        }
        (RelOp::Eq, RelOp::Neq) => {
            if v1 == v2 {
                MergeOutcome::NeverSatisfied
            } else {
                MergeOutcome::Mergable(*c1)
            }
        }
        (RelOp::Eq, RelOp::Ule) => {
            if v1 <= v2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::NeverSatisfied
            }
        }
        (RelOp::Eq, RelOp::Uge) => {
            if v1 >= v2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::NeverSatisfied
            }
        }
        (RelOp::Eq, RelOp::Le) => {
            if s1 <= s2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::NeverSatisfied
            }
        }
        (RelOp::Eq, RelOp::Ge) => {
            if s1 >= s2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::NeverSatisfied
            }
        }
        (RelOp::Neq, RelOp::Eq) => {
            if v1 == v2 {
                MergeOutcome::NeverSatisfied
            } else {
                MergeOutcome::AlwaysSatisfied
            }
        }
        (RelOp::Neq, RelOp::Neq) => {
            if v1 == v2 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Neq, RelOp::Uge) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Uge, v2.wrapping_add(1)))
            } else if v1 < v2 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Neq, RelOp::Ule) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Ule, v2.wrapping_sub(1)))
            } else if v1 > v2 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Neq, RelOp::Ge) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Ge, v2.wrapping_add(1)))
            } else if s1 < s2 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Neq, RelOp::Le) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Le, v2.wrapping_sub(1)))
            } else if s1 > s2 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Ule, RelOp::Eq) => {
            if v2 <= v1 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NeverSatisfied
            }
        }
        (RelOp::Uge, RelOp::Eq) => {
            if v2 >= v1 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NeverSatisfied
            }
        }
        (RelOp::Le, RelOp::Eq) => {
            if s2 <= s1 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NeverSatisfied
            }
        }
        (RelOp::Ge, RelOp::Eq) => {
            if s2 >= s1 {
                MergeOutcome::AlwaysSatisfied
            } else {
                MergeOutcome::NeverSatisfied
            }
        }
        (RelOp::Ule, RelOp::Neq) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Ule, v1.wrapping_sub(1)))
            } else if v1 < v2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Uge, RelOp::Neq) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Uge, v1.wrapping_add(1)))
            } else if v1 > v2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Le, RelOp::Neq) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Le, v1.wrapping_sub(1)))
            } else if s1 < s2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Ge, RelOp::Neq) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Ge, v1.wrapping_add(1)))
            } else if s1 > s2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Ule, RelOp::Ule) => {
            if v1 < v2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::AlwaysSatisfied
            }
        }
        (RelOp::Uge, RelOp::Uge) => {
            if v1 > v2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::AlwaysSatisfied
            }
        }
        (RelOp::Le, RelOp::Le) => {
            if s1 < s2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::AlwaysSatisfied
            }
        }
        (RelOp::Ge, RelOp::Ge) => {
            if s1 > s2 {
                MergeOutcome::Mergable(*c1)
            } else {
                MergeOutcome::AlwaysSatisfied
            }
        }
        (RelOp::Ule, RelOp::Uge) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Eq, v1))
            } else if v1 < v2 {
                MergeOutcome::NeverSatisfied
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Uge, RelOp::Ule) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Eq, v1))
            } else if v1 > v2 {
                MergeOutcome::NeverSatisfied
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Le, RelOp::Ge) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Eq, v1))
            } else if s1 < s2 {
                MergeOutcome::NeverSatisfied
            } else {
                MergeOutcome::NotMergable
            }
        }
        (RelOp::Ge, RelOp::Le) => {
            if v1 == v2 {
                MergeOutcome::Mergable(rebuilt(builder, RelOp::Eq, v1))
            } else if s1 > s2 {
                MergeOutcome::NeverSatisfied
            } else {
                MergeOutcome::NotMergable
            }
        }
        // unsigned and signed bounds describe incomparable ranges
        (RelOp::Ule | RelOp::Uge, RelOp::Le | RelOp::Ge)
        | (RelOp::Le | RelOp::Ge, RelOp::Ule | RelOp::Uge) => MergeOutcome::NotMergable,
        (RelOp::Ult | RelOp::Ugt | RelOp::Lt | RelOp::Gt, _)
        | (_, RelOp::Ult | RelOp::Ugt | RelOp::Lt | RelOp::Gt) => {
            return Err(internal_error!(format!(
                "strict operator {op1} or {op2} survived normalization"
            )));
        }
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::empty_disassembly;

    fn builder() -> Builder {
        Builder::new(empty_disassembly())
    }

    // Helper to build `register REL constant` without manual interning
    fn cond(b: &mut Builder, register: u8, op: RelOp, value: u32) -> Condition {
        let lhs = b.register(register);
        let rhs = b.constant(value);
        Condition::new(lhs, op, rhs)
    }

    fn entry_constant(b: &Builder, p: &Predicate, index: usize) -> (RelOp, u32) {
        match p.conditions()[index] {
            Condition::Expr { op, rhs, .. } => (
                op,
                b.graph().node(rhs).and_then(|n| n.constant_value()).unwrap(),
            ),
            ref other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_merge_same_condition_is_idempotent() {
        let mut b = builder();
        let mut p = Predicate::new();
        let c = cond(&mut b, 1, RelOp::Uge, 5);
        p.merge_condition(c.clone(), &mut b).unwrap();
        p.merge_condition(c, &mut b).unwrap();
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_merge_narrows_bound_with_inequality() {
        let mut b = builder();
        let mut p = Predicate::new();
        let at_least = cond(&mut b, 1, RelOp::Uge, 5);
        let not_five = cond(&mut b, 1, RelOp::Neq, 5);
        p.merge_condition(at_least, &mut b).unwrap();
        p.merge_condition(not_five, &mut b).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(entry_constant(&b, &p, 0), (RelOp::Uge, 6));
    }

    #[test]
    fn test_merge_tighter_bound_replaces_looser() {
        let mut b = builder();
        let mut p = Predicate::new();
        let loose = cond(&mut b, 1, RelOp::Ule, 100);
        let tight = cond(&mut b, 1, RelOp::Ule, 10);
        p.merge_condition(loose, &mut b).unwrap();
        p.merge_condition(tight, &mut b).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(entry_constant(&b, &p, 0), (RelOp::Ule, 10));
    }

    #[test]
    fn test_merge_bounds_pinch_to_equality() {
        let mut b = builder();
        let mut p = Predicate::new();
        let lower = cond(&mut b, 1, RelOp::Uge, 7);
        let upper = cond(&mut b, 1, RelOp::Ule, 7);
        p.merge_condition(lower, &mut b).unwrap();
        p.merge_condition(upper, &mut b).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(entry_constant(&b, &p, 0), (RelOp::Eq, 7));
    }

    #[test]
    fn test_merge_contradiction_collapses_to_false() {
        let mut b = builder();
        let mut p = Predicate::new();
        let is_three = cond(&mut b, 1, RelOp::Eq, 3);
        let is_four = cond(&mut b, 1, RelOp::Eq, 4);
        p.merge_condition(is_three, &mut b).unwrap();
        p.merge_condition(is_four, &mut b).unwrap();
        assert!(p.is_unsatisfiable());
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_merge_mixed_signedness_keeps_both() {
        let mut b = builder();
        let mut p = Predicate::new();
        let unsigned = cond(&mut b, 1, RelOp::Ule, 10);
        let signed = cond(&mut b, 1, RelOp::Ge, 2);
        p.merge_condition(unsigned, &mut b).unwrap();
        p.merge_condition(signed, &mut b).unwrap();
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_merge_different_expressions_keep_both() {
        let mut b = builder();
        let mut p = Predicate::new();
        let first = cond(&mut b, 1, RelOp::Eq, 1);
        let second = cond(&mut b, 2, RelOp::Eq, 2);
        p.merge_condition(first, &mut b).unwrap();
        p.merge_condition(second, &mut b).unwrap();
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_merge_equality_absorbs_compatible_bound() {
        let mut b = builder();
        let mut p = Predicate::new();
        let bound = cond(&mut b, 1, RelOp::Ule, 10);
        let exact = cond(&mut b, 1, RelOp::Eq, 4);
        p.merge_condition(bound, &mut b).unwrap();
        p.merge_condition(exact, &mut b).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(entry_constant(&b, &p, 0), (RelOp::Eq, 4));
    }

    #[test]
    fn test_is_satisfied_reports_all_three_answers() {
        let mut b = builder();
        let mut p = Predicate::new();
        let exact = cond(&mut b, 1, RelOp::Eq, 4);
        p.merge_condition(exact, &mut b).unwrap();

        let implied = cond(&mut b, 1, RelOp::Ule, 10);
        assert_eq!(p.is_satisfied(implied, &mut b).unwrap(), Satisfied::Always);

        let impossible = cond(&mut b, 1, RelOp::Eq, 9);
        assert_eq!(p.is_satisfied(impossible, &mut b).unwrap(), Satisfied::Never);

        let unrelated = cond(&mut b, 2, RelOp::Eq, 1);
        assert_eq!(
            p.is_satisfied(unrelated, &mut b).unwrap(),
            Satisfied::Sometimes
        );
    }

    #[test]
    fn test_is_satisfied_does_not_modify_predicate() {
        let mut b = builder();
        let mut p = Predicate::new();
        let bound = cond(&mut b, 1, RelOp::Uge, 5);
        p.merge_condition(bound, &mut b).unwrap();
        let probe = cond(&mut b, 1, RelOp::Neq, 5);
        let _ = p.is_satisfied(probe, &mut b).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(entry_constant(&b, &p, 0), (RelOp::Uge, 5));
    }

    #[test]
    fn test_migrate_resolves_conditions_in_fork() {
        let mut b = builder();
        let mut p = Predicate::new();
        let c = cond(&mut b, 1, RelOp::Uge, 5);
        p.merge_condition(c, &mut b).unwrap();

        let fork = b.fork();
        let migrated = p.migrate(fork.graph()).unwrap();
        assert_eq!(migrated.len(), 1);
    }

    #[test]
    fn test_expression_joins_conjuncts() {
        let mut b = builder();
        let mut p = Predicate::new();
        assert_eq!(p.expression(b.graph(), 4), "true");
        let first = cond(&mut b, 1, RelOp::Eq, 1);
        let second = cond(&mut b, 2, RelOp::Eq, 2);
        p.merge_condition(first, &mut b).unwrap();
        p.merge_condition(second, &mut b).unwrap();
        let text = p.expression(b.graph(), 4);
        assert!(text.contains(" /\\ "));
    }

    #[test]
    fn test_merge_symbolic_rhs_conditions_coexist() {
        let mut b = builder();
        let mut p = Predicate::new();
        let r1 = b.register(1);
        let r2 = b.register(2);
        // r1 = r2 normalizes to (r1 - r2) = 0 with a symbolic lhs
        let c = Condition::new(r1, RelOp::Eq, r2);
        p.merge_condition(c.clone(), &mut b).unwrap();
        p.merge_condition(c, &mut b).unwrap();
        assert_eq!(p.len(), 1);
    }
}
