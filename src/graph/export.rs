//! Textual rendering of graphs and expressions.
//!
//! Two renderings exist: [`Graph::expression`] produces a depth-bounded infix
//! form for diagnostics, and [`Graph::export`] produces the full
//! serialization where every expression with fan-out greater than one is
//! emitted once under a `sub_N` name and referenced thereafter. Both walks
//! are deterministic because they traverse node ids in ascending order.

use std::collections::HashMap;

use crate::graph::{Graph, Node, NodeId, NodeKind};

impl Graph {
    /// Renders the expression rooted at `id` up to `max_depth` levels.
    ///
    /// A negative depth renders without limit; truncated subtrees appear as
    /// `(...)`. Unknown ids render as `?`, which only happens on stale
    /// handles.
    #[must_use]
    pub fn expression(&self, id: NodeId, max_depth: i32) -> String {
        let Some(node) = self.node(id) else {
            return "?".to_string();
        };
        match &node.kind {
            NodeKind::Constant(_) | NodeKind::Register(_) | NodeKind::Opaque { .. } => {
                node.kind.mnemonic()
            }
            NodeKind::Add => self.infix(node, "+", max_depth),
            NodeKind::Mult => self.infix(node, "*", max_depth),
            NodeKind::Xor => self.infix(node, "^", max_depth),
            NodeKind::And => self.infix(node, "&", max_depth),
            NodeKind::Or => self.infix(node, "|", max_depth),
            NodeKind::Shift => self.infix(node, "<<", max_depth),
            NodeKind::Rotate => self.infix(node, " ROR ", max_depth),
            NodeKind::Call { .. } => self.prefix(node, &node.kind.mnemonic(), max_depth),
            NodeKind::Load => self.prefix(node, "LOAD", max_depth),
            NodeKind::Store => self.prefix(node, "STORE", max_depth),
            NodeKind::Carry => self.prefix(node, "CARRY", max_depth),
            NodeKind::Overflow => self.prefix(node, "OVERFLOW", max_depth),
        }
    }

    fn infix(&self, node: &Node, separator: &str, max_depth: i32) -> String {
        format!("({})", self.join(node, separator, max_depth))
    }

    fn prefix(&self, node: &Node, label: &str, max_depth: i32) -> String {
        format!("{}({})", label, self.join(node, ",", max_depth))
    }

    fn join(&self, node: &Node, separator: &str, max_depth: i32) -> String {
        if max_depth == 0 {
            return "...".to_string();
        }
        let next_depth = if max_depth < 0 { max_depth } else { max_depth - 1 };
        node.inputs
            .iter()
            .map(|input| self.expression(*input, next_depth))
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// Serializes the whole graph.
    ///
    /// Every node whose value is consumed more than once is emitted as a
    /// numbered `sub_N` definition; constants and registers are always
    /// inlined. The output is one `sub_N:expression;` line per definition,
    /// in definition order.
    #[must_use]
    pub fn export(&self) -> String {
        let mut definitions: HashMap<NodeId, (usize, String)> = HashMap::new();
        for id in self.sorted_ids() {
            if !definitions.contains_key(&id) {
                self.export_node(&mut definitions, id);
            }
        }

        let mut sorted: Vec<(usize, String)> = definitions.into_values().collect();
        sorted.sort_unstable_by_key(|(index, _)| *index);

        let mut output = String::new();
        for (index, text) in sorted {
            output.push_str(&format!("sub_{}:{};\n", index, text));
        }
        output
    }

    fn export_node(&self, definitions: &mut HashMap<NodeId, (usize, String)>, id: NodeId) -> String {
        let Some(node) = self.node(id) else {
            return "?".to_string();
        };
        let inline = node.is_constant() || node.is_register() || node.consumers.len() == 1;
        if !inline {
            if let Some((index, _)) = definitions.get(&id) {
                return format!("sub_{}", index);
            }
        }

        let text = match &node.kind {
            NodeKind::Constant(value) => format!("{}", value),
            NodeKind::Register(_) => node.kind.mnemonic(),
            NodeKind::Add => format!("({})", self.export_join(definitions, node, "+")),
            NodeKind::Shift => self.export_shift(definitions, node),
            NodeKind::Rotate => format!("ROTATE({})", self.export_join(definitions, node, ",")),
            NodeKind::Or => format!("OR({})", self.export_join(definitions, node, ",")),
            NodeKind::Opaque { .. } => {
                if node.inputs.is_empty() {
                    node.kind.mnemonic()
                } else {
                    format!(
                        "{}({})",
                        node.kind.mnemonic(),
                        self.export_join(definitions, node, ",")
                    )
                }
            }
            _ => format!(
                "{}({})",
                node.kind.mnemonic(),
                self.export_join(definitions, node, ",")
            ),
        };

        if inline {
            text
        } else {
            let index = definitions.len();
            definitions.insert(id, (index, text));
            format!("sub_{}", index)
        }
    }

    fn export_join(
        &self,
        definitions: &mut HashMap<NodeId, (usize, String)>,
        node: &Node,
        separator: &str,
    ) -> String {
        node.inputs
            .iter()
            .map(|input| self.export_node(definitions, *input))
            .collect::<Vec<_>>()
            .join(separator)
    }

    fn export_shift(&self, definitions: &mut HashMap<NodeId, (usize, String)>, node: &Node) -> String {
        let value = self.export_node(definitions, node.inputs[0]);
        let amount = self
            .node(node.inputs[1])
            .and_then(Node::constant_value)
            .map(|raw| raw as i32);
        match amount {
            Some(amount) if amount < 0 => format!("({} >> {})", value, -amount),
            _ => format!(
                "({} << {})",
                value,
                self.export_node(definitions, node.inputs[1])
            ),
        }
    }
}
