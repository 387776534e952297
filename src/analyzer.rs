//! Top-level driver tying the scheduler, disassembly service and path
//! oracles together.

use std::sync::Arc;

use crate::config::AnalysisLimits;
use crate::context::{PathContext, PathTask};
use crate::disasm::Disassembly;
use crate::graph::Graph;
use crate::oracle::OracleRegistry;
use crate::predicate::Predicate;
use crate::processor::{Arm, Processor};
use crate::scheduler::Scheduler;
use crate::{Error, Result};

/// Result of one finished execution path, delivered in arrival order.
#[derive(Debug)]
pub enum AnalysisOutcome {
    /// The path ran to completion and produced a cleaned dataflow graph.
    Graph {
        /// Entry address of the analyzed function
        function: u32,
        /// Display name of the analyzed function
        name: String,
        /// The reconstructed dataflow graph
        graph: Graph,
        /// The branch conditions under which this graph is reachable
        predicate: Predicate,
    },
    /// The path was abandoned.
    Failed {
        /// Entry address of the analyzed function
        function: u32,
        /// Display name of the analyzed function
        name: String,
        /// Rendering of the path predicate at the point of failure
        predicate: String,
        /// What ended the path
        error: Error,
    },
}

impl AnalysisOutcome {
    /// Entry address of the function this outcome belongs to.
    #[must_use]
    pub fn function(&self) -> u32 {
        match self {
            AnalysisOutcome::Graph { function, .. }
            | AnalysisOutcome::Failed { function, .. } => *function,
        }
    }

    /// Display name of the function this outcome belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            AnalysisOutcome::Graph { name, .. } | AnalysisOutcome::Failed { name, .. } => name,
        }
    }

    /// True if the path was abandoned before producing a graph.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, AnalysisOutcome::Failed { .. })
    }
}

/// Schedules function analyses and collects their outcomes.
///
/// Each scheduled function gets its own [`crate::oracle::PathOracle`] from
/// the registry, shared by every path forked off that function, so the fork
/// budget is accounted per function regardless of which worker runs a path.
pub struct Analyzer {
    scheduler: Arc<Scheduler<AnalysisOutcome>>,
    disasm: Disassembly,
    limits: AnalysisLimits,
    oracles: OracleRegistry,
}

impl Analyzer {
    /// Creates an analyzer over the given disassembly service with default
    /// limits and worker count.
    #[must_use]
    pub fn new(disasm: Disassembly) -> Analyzer {
        Analyzer::with_limits(disasm, AnalysisLimits::default())
    }

    /// Creates an analyzer with explicit resource limits.
    #[must_use]
    pub fn with_limits(disasm: Disassembly, limits: AnalysisLimits) -> Analyzer {
        Analyzer {
            scheduler: Arc::new(Scheduler::new()),
            disasm,
            limits,
            oracles: OracleRegistry::new(),
        }
    }

    /// Queues analysis of the function at `address` with the builtin ARM
    /// processor.
    pub fn schedule(&self, address: u32) -> Result<()> {
        self.schedule_with(address, Box::new(Arm::new()))
    }

    /// Queues analysis of the function at `address` with a caller-provided
    /// execution strategy.
    pub fn schedule_with(&self, address: u32, processor: Box<dyn Processor>) -> Result<()> {
        let task = self.task(address, processor)?;
        self.scheduler.schedule(Box::new(task));
        Ok(())
    }

    /// Queues analysis only when a worker is free to pick it up, returning
    /// whether the function was accepted.
    pub fn try_schedule(&self, address: u32) -> Result<bool> {
        let task = self.task(address, Box::new(Arm::new()))?;
        Ok(self.scheduler.try_schedule(Box::new(task)).is_none())
    }

    /// Blocks for the next finished path. `None` means every scheduled path
    /// has already been delivered.
    #[must_use]
    pub fn wait_result(&self) -> Option<AnalysisOutcome> {
        self.scheduler.wait_for_result()
    }

    fn task(&self, address: u32, processor: Box<dyn Processor>) -> Result<PathTask> {
        let oracle = self.oracles.oracle(address, &self.limits);
        let context = PathContext::new(
            address,
            self.disasm.clone(),
            self.limits,
            oracle,
            Arc::clone(&self.scheduler),
        )?;
        Ok(PathTask::new(context, processor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{Insn, Mnemonic, Operand};
    use crate::test::ScriptedImage;

    fn two_function_image() -> Disassembly {
        let mut image = ScriptedImage::new();
        image.put(Insn::new(
            0x1000,
            4,
            Mnemonic::Mov,
            vec![Operand::Register(0), Operand::Immediate(5)],
        ));
        image.put(Insn::new(0x1004, 4, Mnemonic::Ret, vec![]));
        image.function(0x1000, "alpha", true);
        image.put(Insn::new(
            0x2000,
            4,
            Mnemonic::Mov,
            vec![Operand::Register(0), Operand::Immediate(9)],
        ));
        image.put(Insn::new(0x2004, 4, Mnemonic::Ret, vec![]));
        image.into_disassembly()
    }

    #[test]
    fn test_every_scheduled_function_reports_back() {
        let analyzer = Analyzer::new(two_function_image());
        analyzer.schedule(0x1000).unwrap();
        analyzer.schedule(0x2000).unwrap();

        let mut names = Vec::new();
        while let Some(outcome) = analyzer.wait_result() {
            assert!(!outcome.is_failure());
            names.push(outcome.name().to_string());
        }
        names.sort();
        assert_eq!(names, vec!["alpha", "sub_2000"]);
    }

    #[test]
    fn test_failure_is_correlated_by_function() {
        let analyzer = Analyzer::new(two_function_image());
        // no instruction at this address
        analyzer.schedule(0x3000).unwrap();

        let outcome = analyzer.wait_result().unwrap();
        assert!(outcome.is_failure());
        assert_eq!(outcome.function(), 0x3000);
        assert!(analyzer.wait_result().is_none());
    }
}
