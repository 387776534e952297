//! Per-path execution state and the task that drives it.
//!
//! A [`PathContext`] bundles everything one symbolic execution path owns: the
//! graph builder, the predicate accumulated from taken branches, the branch
//! decision backlog and a handle to the per-function path oracle. When the
//! constraint solver cannot decide a branch, [`PathContext::introduce_condition`]
//! consults the oracle and, on a two-sided verdict, forks the whole bundle
//! and schedules the false side as a fresh [`PathTask`].

use std::sync::Arc;
use std::time::Instant;

use crate::analyzer::AnalysisOutcome;
use crate::builder::Builder;
use crate::config::AnalysisLimits;
use crate::disasm::Disassembly;
use crate::oracle::{Backlog, ForkPolicy, PathOracle};
use crate::predicate::{Condition, Predicate, Satisfied};
use crate::processor::{Processor, Step};
use crate::scheduler::{Scheduler, Task};
use crate::{Error, Result};

/// Outcome of introducing a branch condition on the current path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The condition holds on this path, execute the guarded instruction.
    Continue,
    /// The condition does not hold, fall through.
    Skip,
}

/// State owned by a single execution path.
pub struct PathContext {
    builder: Builder,
    predicate: Predicate,
    backlog: Backlog,
    oracle: Arc<PathOracle>,
    scheduler: Arc<Scheduler<AnalysisOutcome>>,
    disasm: Disassembly,
    function: u32,
    name: String,
    limits: AnalysisLimits,
    conditions: usize,
    current_address: u32,
}

impl PathContext {
    /// Creates the root context for analyzing the function at `function`.
    pub fn new(
        function: u32,
        disasm: Disassembly,
        limits: AnalysisLimits,
        oracle: Arc<PathOracle>,
        scheduler: Arc<Scheduler<AnalysisOutcome>>,
    ) -> Result<PathContext> {
        let name = disasm.function_name(function)?;
        Ok(PathContext {
            builder: Builder::new(disasm.clone()),
            predicate: Predicate::new(),
            backlog: Backlog::new(),
            oracle,
            scheduler,
            disasm,
            function,
            name,
            limits,
            conditions: 0,
            current_address: function,
        })
    }

    /// The graph builder of this path.
    #[must_use]
    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    /// Mutable access to the graph builder of this path.
    pub fn builder_mut(&mut self) -> &mut Builder {
        &mut self.builder
    }

    /// The path predicate accumulated so far.
    #[must_use]
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// A handle to the disassembly service backing this analysis.
    #[must_use]
    pub fn disassembly(&self) -> Disassembly {
        self.disasm.clone()
    }

    /// The resource limits in effect for this path.
    #[must_use]
    pub fn limits(&self) -> AnalysisLimits {
        self.limits
    }

    /// Entry address of the function under analysis.
    #[must_use]
    pub fn function(&self) -> u32 {
        self.function
    }

    /// Display name of the function under analysis.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn set_current_address(&mut self, address: u32) {
        self.current_address = address;
    }

    /// Registers a branch condition on this path and decides which way
    /// execution proceeds.
    ///
    /// The constraint solver settles conditions implied or contradicted by
    /// the existing predicate without a fork. For genuinely open conditions
    /// the path oracle decides: taking one side merges the (possibly
    /// negated) condition into the predicate, taking both additionally forks
    /// the graph, predicate, backlog and processor, schedules the false side
    /// at `resume_address` and continues the current path on the true side.
    /// When migration of any forked component fails, the fork is abandoned
    /// and only the true side is followed.
    pub fn introduce_condition(
        &mut self,
        condition: Condition,
        resume_address: u32,
        processor: &dyn Processor,
    ) -> Result<Verdict> {
        match self.predicate.is_satisfied(condition, &mut self.builder)? {
            Satisfied::Always => return Ok(Verdict::Continue),
            Satisfied::Never => return Ok(Verdict::Skip),
            Satisfied::Sometimes => {}
        }

        self.conditions += 1;
        if self.conditions >= self.limits.max_conditions {
            return Err(Error::ConditionLimit(u64::from(self.current_address)));
        }

        match self.oracle.should_fork(self.current_address, &self.backlog) {
            ForkPolicy::TakeTrue => self.take_true(condition),
            ForkPolicy::TakeFalse => {
                self.predicate
                    .merge_condition(condition.negate(), &mut self.builder)?;
                self.backlog.record(self.current_address, false);
                Ok(Verdict::Skip)
            }
            ForkPolicy::TakeBoth => {
                match self.fork(condition, resume_address, processor)? {
                    Some(task) => {
                        self.predicate.merge_condition(condition, &mut self.builder)?;
                        self.backlog.record(self.current_address, true);
                        self.scheduler.schedule(Box::new(task));
                        Ok(Verdict::Continue)
                    }
                    // migration failed, degrade to a one-sided branch
                    None => self.take_true(condition),
                }
            }
        }
    }

    fn take_true(&mut self, condition: Condition) -> Result<Verdict> {
        self.predicate.merge_condition(condition, &mut self.builder)?;
        self.backlog.record(self.current_address, true);
        Ok(Verdict::Continue)
    }

    /// Builds the false-side task of a two-sided branch, or `None` when any
    /// component cannot be migrated to the forked graph.
    fn fork(
        &self,
        condition: Condition,
        resume_address: u32,
        processor: &dyn Processor,
    ) -> Result<Option<PathTask>> {
        let builder = self.builder.fork();
        let Ok(predicate) = self.predicate.migrate(builder.graph()) else {
            return Ok(None);
        };
        let Ok(negated) = condition.negate().migrate(builder.graph()) else {
            return Ok(None);
        };
        let Ok(processor) = processor.migrate(builder.graph()) else {
            return Ok(None);
        };

        let mut context = PathContext {
            builder,
            predicate,
            backlog: self.backlog.clone(),
            oracle: Arc::clone(&self.oracle),
            scheduler: Arc::clone(&self.scheduler),
            disasm: self.disasm.clone(),
            function: self.function,
            name: self.name.clone(),
            limits: self.limits,
            conditions: self.conditions,
            current_address: self.current_address,
        };
        context
            .predicate
            .merge_condition(negated, &mut context.builder)?;
        context.backlog.record(self.current_address, false);

        Ok(Some(PathTask {
            context,
            processor,
            start: resume_address,
        }))
    }
}

/// A schedulable unit of work: one execution path from a start address to
/// its end.
pub struct PathTask {
    context: PathContext,
    processor: Box<dyn Processor>,
    start: u32,
}

impl PathTask {
    /// Creates the root task for a fresh analysis, seeding the processor's
    /// initial state into the graph.
    #[must_use]
    pub fn new(mut context: PathContext, mut processor: Box<dyn Processor>) -> PathTask {
        processor.initialize(&mut context.builder);
        let start = context.function;
        PathTask {
            context,
            processor,
            start,
        }
    }
}

impl Task<AnalysisOutcome> for PathTask {
    fn execute(self: Box<Self>) -> AnalysisOutcome {
        let PathTask {
            mut context,
            mut processor,
            start,
        } = *self;

        match run(&mut context, processor.as_mut(), start) {
            Ok(()) => {
                context
                    .builder
                    .cleanup(&|graph, node| !processor.should_retain(graph, node));
                let PathContext {
                    builder,
                    predicate,
                    function,
                    name,
                    ..
                } = context;
                AnalysisOutcome::Graph {
                    function,
                    name,
                    graph: builder.into_graph(),
                    predicate,
                }
            }
            Err(error) => AnalysisOutcome::Failed {
                function: context.function,
                name: context.name.clone(),
                predicate: context.predicate.expression(context.builder.graph(), 4),
                error,
            },
        }
    }
}

/// The decode-simplify-branch loop, with the resource ceilings checked
/// before every instruction.
fn run(context: &mut PathContext, processor: &mut dyn Processor, start: u32) -> Result<()> {
    let started = Instant::now();
    let mut address = start;
    let mut last_size = 0;
    let mut streak = 0usize;

    loop {
        let size = context.builder.graph().len();
        if size > context.limits.max_graph_size {
            return Err(Error::GraphSizeExceeded(context.name.clone()));
        }
        if size == last_size {
            streak += 1;
            if streak == context.limits.max_consecutive_noops {
                return Err(Error::NoProgress {
                    count: u32::try_from(streak).unwrap_or(u32::MAX),
                    function: context.name.clone(),
                });
            }
        } else {
            streak = 0;
        }
        last_size = size;
        if started.elapsed() > context.limits.max_construction_time {
            return Err(Error::ConstructionTimeout(context.name.clone()));
        }

        context.current_address = address;
        let mut next = address;
        match processor.step(context, &mut next, address)? {
            Step::Continue => address = next,
            Step::Done => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{Insn, Mnemonic, Operand};
    use crate::graph::NodeId;
    use crate::predicate::RelOp;
    use crate::processor::Arm;
    use crate::test::ScriptedImage;

    /// Minimal strategy whose whole state is one anchored node.
    struct Anchored {
        value: NodeId,
    }

    impl Processor for Anchored {
        fn initialize(&mut self, _builder: &mut Builder) {}

        fn step(
            &mut self,
            _ctx: &mut PathContext,
            _next_address: &mut u32,
            _address: u32,
        ) -> Result<Step> {
            Ok(Step::Done)
        }

        fn should_retain(&self, _graph: &crate::graph::Graph, _node: &crate::graph::Node) -> bool {
            false
        }

        fn migrate(&self, graph: &crate::graph::Graph) -> Result<Box<dyn Processor>> {
            Ok(Box::new(Anchored {
                value: graph.migrate(self.value)?,
            }))
        }
    }

    fn context_with_limits(limits: AnalysisLimits) -> PathContext {
        let disasm = ScriptedImage::new().into_disassembly();
        let oracle = Arc::new(PathOracle::new(&limits));
        let scheduler = Arc::new(Scheduler::with_workers(1));
        PathContext::new(0x1000, disasm, limits, oracle, scheduler).unwrap()
    }

    #[test]
    fn test_decided_conditions_do_not_touch_the_predicate() {
        let mut ctx = context_with_limits(AnalysisLimits::default());
        let stub = Anchored {
            value: ctx.builder_mut().constant(0),
        };

        let one = ctx.builder_mut().constant(1);
        let two = ctx.builder_mut().constant(2);
        let same = Condition::new(one, RelOp::Eq, one);
        let different = Condition::new(one, RelOp::Eq, two);

        assert!(matches!(
            ctx.introduce_condition(same, 0x1004, &stub).unwrap(),
            Verdict::Continue
        ));
        assert!(matches!(
            ctx.introduce_condition(different, 0x1004, &stub).unwrap(),
            Verdict::Skip
        ));
        assert!(ctx.predicate().is_empty());
    }

    #[test]
    fn test_open_condition_forks_both_sides() {
        let mut ctx = context_with_limits(AnalysisLimits::default());
        let anchor = ctx.builder_mut().register(0);
        let stub = Anchored { value: anchor };

        let five = ctx.builder_mut().constant(5);
        let condition = Condition::new(anchor, RelOp::Uge, five);
        ctx.set_current_address(0x1010);

        let verdict = ctx.introduce_condition(condition, 0x1014, &stub).unwrap();
        assert!(matches!(verdict, Verdict::Continue));
        assert_eq!(ctx.predicate().conditions().len(), 1);

        // the false side ran on the pool with the negated condition
        let outcome = ctx.scheduler.wait_for_result().unwrap();
        match outcome {
            AnalysisOutcome::Graph { predicate, .. } => {
                assert_eq!(predicate.conditions().len(), 1);
                assert_ne!(predicate.conditions(), ctx.predicate().conditions());
            }
            AnalysisOutcome::Failed { error, .. } => panic!("fork failed: {error}"),
        }
    }

    #[test]
    fn test_condition_ceiling_aborts_the_path() {
        let limits = AnalysisLimits {
            max_conditions: 1,
            ..AnalysisLimits::default()
        };
        let mut ctx = context_with_limits(limits);
        let anchor = ctx.builder_mut().register(0);
        let stub = Anchored { value: anchor };

        let five = ctx.builder_mut().constant(5);
        let condition = Condition::new(anchor, RelOp::Uge, five);
        ctx.set_current_address(0x1010);

        assert!(matches!(
            ctx.introduce_condition(condition, 0x1014, &stub),
            Err(Error::ConditionLimit(0x1010))
        ));
    }

    #[test]
    fn test_path_task_yields_cleaned_graph() {
        let mut image = ScriptedImage::new();
        image.put(Insn::new(
            0x1000,
            4,
            Mnemonic::Mov,
            vec![Operand::Register(0), Operand::Immediate(5)],
        ));
        image.put(Insn::new(0x1004, 4, Mnemonic::Ret, vec![]));
        image.function(0x1000, "main", true);

        let limits = AnalysisLimits::default();
        let disasm = image.into_disassembly();
        let oracle = Arc::new(PathOracle::new(&limits));
        let scheduler = Arc::new(Scheduler::with_workers(1));
        let context = PathContext::new(0x1000, disasm, limits, oracle, scheduler).unwrap();
        let task = PathTask::new(context, Box::new(Arm::new()));

        match Box::new(task).execute() {
            AnalysisOutcome::Graph {
                function,
                name,
                graph,
                ..
            } => {
                assert_eq!(function, 0x1000);
                assert_eq!(name, "main");
                assert!(graph.nodes().any(|node| node.constant_value() == Some(5)));
            }
            AnalysisOutcome::Failed { error, .. } => panic!("path failed: {error}"),
        }
    }

    #[test]
    fn test_unproductive_loop_fails_with_no_progress() {
        let mut image = ScriptedImage::new();
        image.put(Insn::new(
            0x1000,
            4,
            Mnemonic::B,
            vec![Operand::Address(0x1000)],
        ));
        image.internal(0x1000, 0x1100);

        let limits = AnalysisLimits {
            max_consecutive_noops: 8,
            ..AnalysisLimits::default()
        };
        let disasm = image.into_disassembly();
        let oracle = Arc::new(PathOracle::new(&limits));
        let scheduler = Arc::new(Scheduler::with_workers(1));
        let context = PathContext::new(0x1000, disasm, limits, oracle, scheduler).unwrap();
        let task = PathTask::new(context, Box::new(Arm::new()));

        match Box::new(task).execute() {
            AnalysisOutcome::Failed { name, error, .. } => {
                assert_eq!(name, "sub_1000");
                assert!(matches!(error, Error::NoProgress { count: 8, .. }));
            }
            AnalysisOutcome::Graph { .. } => panic!("expected the path to be aborted"),
        }
    }

    #[test]
    fn test_graph_size_ceiling_fails_the_path() {
        let mut image = ScriptedImage::new();
        image.put(Insn::new(0x1000, 4, Mnemonic::Ret, vec![]));

        let limits = AnalysisLimits {
            max_graph_size: 4,
            ..AnalysisLimits::default()
        };
        let disasm = image.into_disassembly();
        let oracle = Arc::new(PathOracle::new(&limits));
        let scheduler = Arc::new(Scheduler::with_workers(1));
        let context = PathContext::new(0x1000, disasm, limits, oracle, scheduler).unwrap();
        let task = PathTask::new(context, Box::new(Arm::new()));

        match Box::new(task).execute() {
            AnalysisOutcome::Failed { error, .. } => {
                assert!(matches!(error, Error::GraphSizeExceeded(_)));
            }
            AnalysisOutcome::Graph { .. } => panic!("expected the path to be aborted"),
        }
    }
}
