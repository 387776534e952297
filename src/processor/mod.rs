//! Architecture strategy interface.
//!
//! A [`Processor`] owns the architectural state of one path (register file,
//! flags, call stack) and translates decoded instructions into graph
//! operations. The path driver owns the loop; the processor only ever sees
//! one instruction at a time and reports whether execution continues or the
//! path has ended.

use crate::builder::Builder;
use crate::context::PathContext;
use crate::graph::{Graph, Node};
use crate::Result;

mod arm;

pub use arm::Arm;

/// Outcome of executing a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Execution continues at the address written to `next_address`
    Continue,
    /// The path returned out of the analyzed function
    Done,
}

/// Architecture-specific execution strategy.
pub trait Processor: Send {
    /// Seeds the initial architectural state into the graph.
    fn initialize(&mut self, builder: &mut Builder);

    /// Executes the instruction at `address`.
    ///
    /// `next_address` is pre-set to the following instruction and may be
    /// overwritten by branches. Conditional instructions go through
    /// [`PathContext::introduce_condition`], which may fork the path.
    fn step(
        &mut self,
        ctx: &mut PathContext,
        next_address: &mut u32,
        address: u32,
    ) -> Result<Step>;

    /// Whether an output-less node still carries meaning for this
    /// architecture and must survive cleanup.
    fn should_retain(&self, graph: &Graph, node: &Node) -> bool;

    /// Clones the processor state into a forked graph, re-resolving every
    /// node handle.
    fn migrate(&self, graph: &Graph) -> Result<Box<dyn Processor>>;
}
