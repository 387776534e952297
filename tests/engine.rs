//! End-to-end tests driving the analyzer over small scripted programs.
//!
//! Each test wires a handful of hand-assembled instructions into a
//! [`DisassemblyService`], schedules one or more functions and inspects the
//! reconstructed dataflow graphs.

use dfgscope::prelude::*;
use std::collections::HashMap;

/// A program image scripted instruction by instruction.
struct ScriptedProgram {
    instructions: HashMap<u32, Insn>,
    functions: HashMap<u32, String>,
}

impl ScriptedProgram {
    fn new() -> ScriptedProgram {
        ScriptedProgram {
            instructions: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    fn put(&mut self, insn: Insn) -> &mut ScriptedProgram {
        self.instructions.insert(insn.address, insn);
        self
    }

    fn function(&mut self, start: u32, name: &str) -> &mut ScriptedProgram {
        self.functions.insert(start, name.to_string());
        self
    }

    fn into_disassembly(self) -> Disassembly {
        Disassembly::new(Box::new(self))
    }
}

impl DisassemblyService for ScriptedProgram {
    fn decode(&self, address: u32) -> Result<Insn> {
        self.instructions
            .get(&address)
            .cloned()
            .ok_or(Error::Decode(u64::from(address)))
    }

    fn read_word(&self, _address: u32) -> Option<u32> {
        None
    }

    fn is_read_only(&self, _address: u32) -> bool {
        false
    }

    fn is_internal(&self, address: u32) -> bool {
        self.instructions.contains_key(&address)
    }

    fn is_thumb(&self, _address: u32) -> bool {
        false
    }

    fn function_start(&self, address: u32) -> Option<u32> {
        self.functions
            .keys()
            .copied()
            .filter(|start| *start <= address)
            .max()
    }

    fn function_returns(&self, _address: u32) -> bool {
        true
    }

    fn function_name(&self, address: u32) -> String {
        self.functions
            .get(&address)
            .cloned()
            .unwrap_or_else(|| format!("sub_{address:x}"))
    }
}

fn reconstructed_graph(outcome: AnalysisOutcome) -> Graph {
    match outcome {
        AnalysisOutcome::Graph { graph, .. } => graph,
        AnalysisOutcome::Failed { name, error, .. } => {
            panic!("analysis of {name} failed: {error}")
        }
    }
}

/// The two's-complement negate idiom `r0 = ~r0 + 1` must reconstruct as a
/// plain multiplication by minus one, indistinguishable from code that
/// negates directly.
#[test]
fn test_negate_idiom_reconstructs_as_multiplication() -> Result<()> {
    let mut program = ScriptedProgram::new();
    program
        .put(Insn::new(
            0x1000,
            4,
            Mnemonic::Mvn,
            vec![Operand::Register(1), Operand::Register(0)],
        ))
        .put(Insn::new(
            0x1004,
            4,
            Mnemonic::Add,
            vec![
                Operand::Register(0),
                Operand::Register(1),
                Operand::Immediate(1),
            ],
        ))
        .put(Insn::new(0x1008, 4, Mnemonic::Ret, vec![]))
        .function(0x1000, "negate");

    let analyzer = Analyzer::new(program.into_disassembly());
    analyzer.schedule(0x1000)?;

    let outcome = analyzer.wait_result().ok_or(Error::Decode(0))?;
    let graph = reconstructed_graph(outcome);

    let negated = graph.nodes().find(|node| {
        matches!(node.kind, NodeKind::Mult)
            && node.inputs.len() == 2
            && node.inputs.iter().any(|input| {
                matches!(graph.node(*input), Some(node) if node.kind == NodeKind::Register(0))
            })
            && node.inputs.iter().any(|input| {
                graph.node(*input).and_then(Node::constant_value) == Some(0xffff_ffff)
            })
    });
    assert!(
        negated.is_some(),
        "expected r0 * -1 in:\n{}",
        graph.export()
    );

    // the intermediate xor and add are gone entirely
    assert!(graph
        .nodes()
        .all(|node| !matches!(node.kind, NodeKind::Xor | NodeKind::Add)));
    Ok(())
}

/// An unresolvable compare forks the path; both sides must complete with
/// their own graph and a one-condition predicate, without leaking nodes
/// into each other.
#[test]
fn test_open_branch_explores_both_sides() -> Result<()> {
    let mut program = ScriptedProgram::new();
    program
        .put(Insn::new(
            0x1000,
            4,
            Mnemonic::Cmp,
            vec![Operand::Register(0), Operand::Immediate(5)],
        ))
        .put(
            Insn::new(0x1004, 4, Mnemonic::B, vec![Operand::Address(0x2000)])
                .with_condition(ConditionCode::Eq),
        )
        .put(Insn::new(
            0x1008,
            4,
            Mnemonic::Mov,
            vec![Operand::Register(0), Operand::Immediate(2)],
        ))
        .put(Insn::new(0x100c, 4, Mnemonic::Ret, vec![]))
        .put(Insn::new(
            0x2000,
            4,
            Mnemonic::Mov,
            vec![Operand::Register(0), Operand::Immediate(1)],
        ))
        .put(Insn::new(0x2004, 4, Mnemonic::Ret, vec![]))
        .function(0x1000, "branchy");

    let analyzer = Analyzer::new(program.into_disassembly());
    analyzer.schedule(0x1000)?;

    let mut results = Vec::new();
    while let Some(outcome) = analyzer.wait_result() {
        let (graph, predicate) = match outcome {
            AnalysisOutcome::Graph {
                graph, predicate, ..
            } => (graph, predicate),
            AnalysisOutcome::Failed { name, error, .. } => {
                panic!("path of {name} failed: {error}")
            }
        };
        assert_eq!(predicate.len(), 1);
        let constant = graph
            .nodes()
            .filter_map(Node::constant_value)
            .find(|value| *value == 1 || *value == 2);
        results.push(constant);
    }
    results.sort();
    assert_eq!(results, vec![Some(1), Some(2)]);
    Ok(())
}

/// Stores to the local stack frame are scaffolding and must be cleaned from
/// the result; stores through arbitrary pointers survive.
#[test]
fn test_stack_stores_are_dropped_from_the_result() -> Result<()> {
    let mut program = ScriptedProgram::new();
    program
        .put(Insn::new(
            0x1000,
            4,
            Mnemonic::Str,
            vec![
                Operand::Register(0),
                Operand::Displacement {
                    base: 13,
                    offset: 4,
                },
            ],
        ))
        .put(Insn::new(
            0x1004,
            4,
            Mnemonic::Str,
            vec![
                Operand::Register(0),
                Operand::Displacement { base: 1, offset: 0 },
            ],
        ))
        .put(Insn::new(0x1008, 4, Mnemonic::Ret, vec![]))
        .function(0x1000, "spill");

    let analyzer = Analyzer::new(program.into_disassembly());
    analyzer.schedule(0x1000)?;

    let outcome = analyzer.wait_result().ok_or(Error::Decode(0))?;
    let graph = reconstructed_graph(outcome);

    let stores: Vec<&Node> = graph
        .nodes()
        .filter(|node| matches!(node.kind, NodeKind::Store))
        .collect();
    assert_eq!(stores.len(), 1, "graph:\n{}", graph.export());
    // the surviving store goes through r1, not through the stack pointer
    assert!(matches!(
        graph.node(stores[0].inputs[1]),
        Some(address) if address.kind == NodeKind::Register(1)
    ));
    Ok(())
}

/// Every scheduled function produces exactly one result, and the result
/// stream ends once all of them are in.
#[test]
fn test_result_stream_drains_all_scheduled_functions() -> Result<()> {
    let mut program = ScriptedProgram::new();
    for index in 0..8u32 {
        let start = 0x1000 + index * 0x10;
        program
            .put(Insn::new(
                start,
                4,
                Mnemonic::Mov,
                vec![Operand::Register(0), Operand::Immediate(index)],
            ))
            .put(Insn::new(start + 4, 4, Mnemonic::Ret, vec![]))
            .function(start, &format!("chunk_{index}"));
    }

    let analyzer = Analyzer::new(program.into_disassembly());
    for index in 0..8u32 {
        analyzer.schedule(0x1000 + index * 0x10)?;
    }

    let mut names = Vec::new();
    while let Some(outcome) = analyzer.wait_result() {
        assert!(!outcome.is_failure(), "unexpected failure: {outcome:?}");
        names.push(outcome.name().to_string());
    }
    names.sort();

    let expected: Vec<String> = (0..8).map(|index| format!("chunk_{index}")).collect();
    assert_eq!(names, expected);
    Ok(())
}
