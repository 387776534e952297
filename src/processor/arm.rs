//! 32-bit ARM and Thumb execution strategy.
//!
//! Registers hold graph node handles instead of values; executing an
//! instruction rewrites the register file through the simplifying builder.
//! Condition flags are not computed eagerly: flag-setting instructions only
//! record which operation last updated which flag, and a conditional
//! instruction lowers that record into a relational [`Condition`] on demand.
//! Calls into the analyzed binary are inlined up to a depth limit; anything
//! beyond that becomes an opaque `CALL` node over the first argument
//! register.

use std::sync::Arc;

use crate::builder::Builder;
use crate::config::AnalysisLimits;
use crate::context::{PathContext, Verdict};
use crate::disasm::{
    ConditionCode, Disassembly, InsnFlags, Mnemonic, Operand, ShiftAmount, ShiftKind,
};
use crate::graph::{Graph, Node, NodeId, NodeKind};
use crate::predicate::{Condition, RelOp};
use crate::processor::{Processor, Step};
use crate::{Error, Result};

const SP: u8 = 13;
const LR: u8 = 14;
const PC: u8 = 15;

/// Which operation last produced a flag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagKind {
    Add,
    Shift,
    Mult,
    And,
    Or,
    Xor,
}

/// Deferred flag state: the operands of the flag-setting operation.
///
/// One `FlagOrigin` is shared by every flag the operation wrote, and that
/// sharing is meaningful: compound condition codes (`HI`, `GE`, `GT`, ...)
/// are only well-defined when all flags they read come from the same
/// operation, which is checked by pointer identity.
#[derive(Debug)]
struct FlagOrigin {
    kind: FlagKind,
    n1: NodeId,
    n2: NodeId,
}

impl FlagOrigin {
    fn migrate(&self, graph: &Graph) -> Result<FlagOrigin> {
        Ok(FlagOrigin {
            kind: self.kind,
            n1: graph.migrate(self.n1)?,
            n2: graph.migrate(self.n2)?,
        })
    }

    /// The carry produced by the flag-setting operation, when it has one.
    fn carry(&self, builder: &mut Builder) -> Option<NodeId> {
        let mut sink = None;
        match self.kind {
            FlagKind::Add => {
                builder.add_ext(self.n1, self.n2, Some(&mut sink), None);
            }
            FlagKind::Shift => {
                builder.shift_ext(self.n1, self.n2, Some(&mut sink), None);
            }
            _ => {}
        }
        sink
    }

    /// Lowers the flag state into the condition tested by `cc`.
    fn lower(&self, builder: &mut Builder, cc: ConditionCode, address: u32) -> Result<Condition> {
        match self.kind {
            FlagKind::Add => self.lower_add(builder, cc, address),
            FlagKind::Shift => self.lower_shift(builder, cc, address),
            _ => self.lower_bitwise(builder, cc, address),
        }
    }

    fn lower_add(&self, builder: &mut Builder, cc: ConditionCode, address: u32) -> Result<Condition> {
        match cc {
            ConditionCode::Eq
            | ConditionCode::Ne
            | ConditionCode::Cs
            | ConditionCode::Cc
            | ConditionCode::Hi
            | ConditionCode::Ls
            | ConditionCode::Ge
            | ConditionCode::Lt
            | ConditionCode::Gt
            | ConditionCode::Le => {
                let minus_one = builder.constant(0xffff_ffff);
                let rhs = builder.mult(self.n2, minus_one);
                let op = match cc {
                    ConditionCode::Eq => RelOp::Eq,
                    ConditionCode::Ne => RelOp::Neq,
                    ConditionCode::Cs => RelOp::Uge,
                    ConditionCode::Cc => RelOp::Ult,
                    ConditionCode::Hi => RelOp::Ugt,
                    ConditionCode::Ls => RelOp::Ule,
                    ConditionCode::Ge => RelOp::Ge,
                    ConditionCode::Lt => RelOp::Lt,
                    ConditionCode::Gt => RelOp::Gt,
                    _ => RelOp::Le,
                };
                Ok(Condition::new(self.n1, op, rhs))
            }
            ConditionCode::Mi | ConditionCode::Pl | ConditionCode::Vs | ConditionCode::Vc => {
                let lhs = builder.add(self.n1, self.n2);
                let zero = builder.constant(0);
                let op = match cc {
                    ConditionCode::Mi => RelOp::Lt,
                    ConditionCode::Pl => RelOp::Ge,
                    ConditionCode::Vs => RelOp::Neq,
                    _ => RelOp::Eq,
                };
                Ok(Condition::new(lhs, op, zero))
            }
            ConditionCode::Al | ConditionCode::Nv => {
                Err(Error::FlagOrigin(u64::from(address)))
            }
        }
    }

    fn lower_shift(&self, builder: &mut Builder, cc: ConditionCode, address: u32) -> Result<Condition> {
        match cc {
            ConditionCode::Eq | ConditionCode::Ne | ConditionCode::Mi | ConditionCode::Pl => {
                let lhs = builder.shift(self.n1, self.n2);
                let zero = builder.constant(0);
                let op = match cc {
                    ConditionCode::Eq => RelOp::Eq,
                    ConditionCode::Ne => RelOp::Neq,
                    ConditionCode::Mi => RelOp::Lt,
                    _ => RelOp::Ge,
                };
                Ok(Condition::new(lhs, op, zero))
            }
            ConditionCode::Cs | ConditionCode::Cc => {
                let mut carry = None;
                builder.shift_ext(self.n1, self.n2, Some(&mut carry), None);
                let carry = carry.ok_or(Error::FlagOrigin(u64::from(address)))?;
                let zero = builder.constant(0);
                let op = if cc == ConditionCode::Cs {
                    RelOp::Neq
                } else {
                    RelOp::Eq
                };
                Ok(Condition::new(carry, op, zero))
            }
            ConditionCode::Hi | ConditionCode::Ls => {
                // C & !Z tested as (C | ~Z) != 0
                let mut carry = None;
                let result = builder.shift_ext(self.n1, self.n2, Some(&mut carry), None);
                let carry = carry.ok_or(Error::FlagOrigin(u64::from(address)))?;
                let all_ones = builder.constant(0xffff_ffff);
                let not_zero = builder.xor(result, all_ones);
                let lhs = builder.or(not_zero, carry);
                let zero = builder.constant(0);
                let op = if cc == ConditionCode::Hi {
                    RelOp::Neq
                } else {
                    RelOp::Eq
                };
                Ok(Condition::new(lhs, op, zero))
            }
            _ => Err(Error::FlagOrigin(u64::from(address))),
        }
    }

    fn lower_bitwise(
        &self,
        builder: &mut Builder,
        cc: ConditionCode,
        address: u32,
    ) -> Result<Condition> {
        if self.kind == FlagKind::Xor
            && (cc == ConditionCode::Eq || cc == ConditionCode::Ne)
        {
            let op = if cc == ConditionCode::Eq {
                RelOp::Eq
            } else {
                RelOp::Neq
            };
            return Ok(Condition::new(self.n1, op, self.n2));
        }
        let lhs = match self.kind {
            FlagKind::Mult => builder.mult(self.n1, self.n2),
            FlagKind::And => builder.and(self.n1, self.n2),
            FlagKind::Or => builder.or(self.n1, self.n2),
            FlagKind::Xor => builder.xor(self.n1, self.n2),
            FlagKind::Add | FlagKind::Shift => {
                return Err(Error::FlagOrigin(u64::from(address)))
            }
        };
        let zero = builder.constant(0);
        let op = match cc {
            ConditionCode::Eq => RelOp::Eq,
            ConditionCode::Ne => RelOp::Neq,
            ConditionCode::Mi => RelOp::Lt,
            ConditionCode::Pl => RelOp::Ge,
            _ => return Err(Error::FlagOrigin(u64::from(address))),
        };
        Ok(Condition::new(lhs, op, zero))
    }
}

/// Whether register writes ended the path.
enum Flow {
    Continue,
    Done,
}

/// ARM/Thumb processor state for one path.
pub struct Arm {
    registers: Vec<NodeId>,
    call_stack: Vec<u32>,
    carry: Option<Arc<FlagOrigin>>,
    overflow: Option<Arc<FlagOrigin>>,
    zero: Option<Arc<FlagOrigin>>,
    negative: Option<Arc<FlagOrigin>>,
}

impl Arm {
    /// Creates a processor with no architectural state seeded yet.
    #[must_use]
    pub fn new() -> Arm {
        Arm {
            registers: Vec::new(),
            call_stack: Vec::new(),
            carry: None,
            overflow: None,
            zero: None,
            negative: None,
        }
    }

    fn set_flag(&mut self, kind: FlagKind, n1: NodeId, n2: NodeId) {
        let origin = Arc::new(FlagOrigin { kind, n1, n2 });
        match kind {
            FlagKind::Add => {
                self.carry = Some(Arc::clone(&origin));
                self.overflow = Some(Arc::clone(&origin));
                self.zero = Some(Arc::clone(&origin));
                self.negative = Some(origin);
            }
            FlagKind::Shift => {
                self.carry = Some(Arc::clone(&origin));
                self.zero = Some(Arc::clone(&origin));
                self.negative = Some(origin);
            }
            FlagKind::Mult | FlagKind::And | FlagKind::Or | FlagKind::Xor => {
                self.zero = Some(Arc::clone(&origin));
                self.negative = Some(origin);
            }
        }
    }

    /// Flag origin consulted by a condition code, after checking that every
    /// flag the code reads was produced by the same operation.
    fn flag_origin_for(&self, cc: ConditionCode, address: u32) -> Result<Arc<FlagOrigin>> {
        let error = || Error::FlagOrigin(u64::from(address));
        match cc {
            ConditionCode::Eq | ConditionCode::Ne => self.zero.clone().ok_or_else(error),
            ConditionCode::Cs | ConditionCode::Cc => self.carry.clone().ok_or_else(error),
            ConditionCode::Mi | ConditionCode::Pl => self.negative.clone().ok_or_else(error),
            ConditionCode::Vs | ConditionCode::Vc => self.overflow.clone().ok_or_else(error),
            ConditionCode::Hi | ConditionCode::Ls => {
                let (Some(carry), Some(zero)) = (&self.carry, &self.zero) else {
                    return Err(error());
                };
                if !Arc::ptr_eq(carry, zero) {
                    return Err(error());
                }
                Ok(Arc::clone(carry))
            }
            ConditionCode::Ge | ConditionCode::Lt => {
                let (Some(negative), Some(overflow)) = (&self.negative, &self.overflow) else {
                    return Err(error());
                };
                if !Arc::ptr_eq(negative, overflow) {
                    return Err(error());
                }
                Ok(Arc::clone(negative))
            }
            ConditionCode::Gt | ConditionCode::Le => {
                let (Some(zero), Some(negative), Some(overflow)) =
                    (&self.zero, &self.negative, &self.overflow)
                else {
                    return Err(error());
                };
                if !Arc::ptr_eq(zero, negative) || !Arc::ptr_eq(zero, overflow) {
                    return Err(error());
                }
                Ok(Arc::clone(zero))
            }
            ConditionCode::Al | ConditionCode::Nv => Err(error()),
        }
    }

    fn register_value(
        &self,
        builder: &mut Builder,
        disasm: &Disassembly,
        address: u32,
        reg: u8,
    ) -> Result<NodeId> {
        if reg == PC {
            // the pipeline makes PC reads see two instructions ahead
            let offset = if disasm.is_thumb(address)? { 4 } else { 8 };
            return Ok(builder.constant(address.wrapping_add(offset)));
        }
        Ok(self.registers[usize::from(reg)])
    }

    #[allow(clippy::too_many_arguments)]
    fn set_register(
        &mut self,
        builder: &mut Builder,
        disasm: &Disassembly,
        limits: &AnalysisLimits,
        next_address: &mut u32,
        address: u32,
        reg: u8,
        node: NodeId,
    ) -> Result<Flow> {
        if reg == PC {
            return self.jump_to_node(builder, disasm, limits, next_address, address, node);
        }
        self.registers[usize::from(reg)] = node;
        Ok(Flow::Continue)
    }

    fn push_call_stack(&mut self, address: u32) {
        self.call_stack.push(address);
    }

    /// Truncates the call stack down to and including the given return
    /// address. Jump-based returns that bypass `LR` leave stale entries
    /// behind, which this scan discards.
    fn pop_call_stack(&mut self, address: u32) {
        if let Some(position) = self.call_stack.iter().rposition(|entry| *entry == address) {
            self.call_stack.truncate(position);
        }
    }

    /// Transfers control to a computed target.
    ///
    /// Constant targets inside the binary are inlined while the call depth
    /// allows it; otherwise the callee collapses into an opaque `CALL` node
    /// over `r0` and execution resumes at the return address. A target that
    /// is still the initial link register means the analyzed function itself
    /// returned.
    fn jump_to_node(
        &mut self,
        builder: &mut Builder,
        disasm: &Disassembly,
        limits: &AnalysisLimits,
        next_address: &mut u32,
        address: u32,
        target: NodeId,
    ) -> Result<Flow> {
        let kind = builder
            .graph()
            .node(target)
            .map(|node| (node.kind.clone(), node.inputs.clone()));
        let Some((kind, inputs)) = kind else {
            return Err(Error::SymbolicBranchTarget(u64::from(address)));
        };

        let resolved = match &kind {
            NodeKind::Constant(value) => Some(value & !1),
            NodeKind::Load => {
                let pointer = inputs
                    .first()
                    .and_then(|input| builder.graph().node(*input))
                    .and_then(Node::constant_value);
                match pointer {
                    Some(pointer) => disasm.read_word(pointer)?.map(|word| word & !1),
                    None => None,
                }
            }
            _ => None,
        };

        if let Some(jump_target) = resolved {
            self.pop_call_stack(jump_target);
            if disasm.is_internal(jump_target)? && self.call_stack.len() < limits.max_call_depth {
                *next_address = jump_target;
                return Ok(Flow::Continue);
            }
            let argument = self.registers[0];
            let call = builder.call(u64::from(jump_target), argument);
            if !disasm.function_returns(jump_target)? {
                return Ok(Flow::Done);
            }
            self.registers[0] = call;

            let lr = self.registers[usize::from(LR)];
            return match builder.graph().node(lr).map(|node| node.kind.clone()) {
                Some(NodeKind::Constant(return_address)) => {
                    let return_address = return_address & !1;
                    *next_address = return_address;
                    self.pop_call_stack(return_address);
                    Ok(Flow::Continue)
                }
                Some(NodeKind::Register(LR)) => Ok(Flow::Done),
                _ => Err(Error::SymbolicBranchTarget(u64::from(address))),
            };
        }

        if matches!(kind, NodeKind::Register(LR)) {
            return Ok(Flow::Done);
        }
        Err(Error::SymbolicBranchTarget(u64::from(address)))
    }

    fn operand_shift(
        &mut self,
        builder: &mut Builder,
        base: NodeId,
        mut amount: NodeId,
        kind: ShiftKind,
        set_flags: bool,
    ) -> NodeId {
        match kind {
            ShiftKind::Lsl => {}
            ShiftKind::Lsr | ShiftKind::Asr => {
                // right shifts are negative amounts; sign expansion of ASR
                // is not modeled
                let minus_one = builder.constant(0xffff_ffff);
                amount = builder.mult(amount, minus_one);
            }
            ShiftKind::Ror => {}
            ShiftKind::Rrx => {
                let carry = self
                    .carry
                    .as_ref()
                    .map(Arc::clone)
                    .and_then(|origin| origin.carry(builder));
                let amount = builder.constant(0xffff_ffff);
                let mut result = builder.shift(base, amount);
                if let Some(carry) = carry {
                    let carries_in = builder
                        .graph()
                        .node(carry)
                        .and_then(Node::constant_value)
                        != Some(0);
                    if carries_in {
                        let thirty_one = builder.constant(31);
                        let high_bit = builder.shift(carry, thirty_one);
                        result = builder.add(result, high_bit);
                    }
                }
                if set_flags {
                    self.set_flag(FlagKind::Shift, base, amount);
                }
                return result;
            }
        }
        if set_flags {
            self.set_flag(FlagKind::Shift, base, amount);
        }
        if kind == ShiftKind::Ror {
            builder.rotate(base, amount)
        } else {
            builder.shift(base, amount)
        }
    }

    fn operand_value(
        &mut self,
        builder: &mut Builder,
        disasm: &Disassembly,
        operand: &Operand,
        address: u32,
        set_flags: bool,
    ) -> Result<NodeId> {
        match operand {
            Operand::Register(reg) => {
                let node = self.register_value(builder, disasm, address, *reg)?;
                if set_flags {
                    let zero = builder.constant(0);
                    self.set_flag(FlagKind::Add, node, zero);
                }
                Ok(node)
            }
            Operand::Address(value) | Operand::Immediate(value) => Ok(builder.constant(*value)),
            Operand::Displacement { base, offset } => {
                let reg = self.register_value(builder, disasm, address, *base)?;
                let offset = builder.constant(*offset);
                if set_flags {
                    self.set_flag(FlagKind::Add, reg, offset);
                }
                Ok(builder.add(reg, offset))
            }
            Operand::Phrase {
                base,
                index,
                shift,
                amount,
            } => {
                let reg1 = self.register_value(builder, disasm, address, *base)?;
                let reg2 = self.register_value(builder, disasm, address, *index)?;
                if *amount == 0 {
                    if set_flags {
                        self.set_flag(FlagKind::Add, reg1, reg2);
                    }
                    Ok(builder.add(reg1, reg2))
                } else {
                    let amount = builder.constant(*amount);
                    let shifted = self.operand_shift(builder, reg2, amount, *shift, set_flags);
                    Ok(builder.add(reg1, shifted))
                }
            }
            Operand::Shifted {
                base,
                shift,
                amount,
            } => {
                let node = self.register_value(builder, disasm, address, *base)?;
                let amount = match amount {
                    ShiftAmount::Immediate(value) => builder.constant(*value),
                    ShiftAmount::Register(reg) => {
                        self.register_value(builder, disasm, address, *reg)?
                    }
                };
                Ok(self.operand_shift(builder, node, amount, *shift, set_flags))
            }
            Operand::None | Operand::RegisterList(_) => {
                Err(internal_error!("operand slot not evaluable as a value"))
            }
        }
    }
}

impl Default for Arm {
    fn default() -> Arm {
        Arm::new()
    }
}

/// Checks a freshly lowered condition for the stack-pointer comparison
/// idioms the obfuscator emits.
///
/// `CMP SP, #0` is a carry set, `CMN SP, #0` a carry clear, and null checks
/// of inlined stack-pointer parameters always fail. Forking on any of those
/// would double the path count for nothing, so the verdict is decided here
/// without touching the predicate.
fn sp_compare_override(builder: &Builder, condition: &Condition) -> Option<bool> {
    let Condition::Expr { lhs, op, rhs } = condition else {
        return None;
    };
    let target = builder.graph().node(*rhs).and_then(Node::constant_value)?;
    let lhs_node = builder.graph().node(*lhs)?;
    let sp_based = match &lhs_node.kind {
        NodeKind::Register(SP) => true,
        NodeKind::Add if lhs_node.inputs.len() == 2 => {
            let mut has_sp = false;
            let mut has_const = false;
            for input in &lhs_node.inputs {
                match builder.graph().node(*input).map(|node| &node.kind) {
                    Some(NodeKind::Register(SP)) => has_sp = true,
                    Some(NodeKind::Constant(_)) => has_const = true,
                    _ => {}
                }
            }
            has_sp && has_const
        }
        _ => false,
    };
    if !sp_based {
        return None;
    }
    match op {
        RelOp::Uge if target == 0 => Some(true),
        RelOp::Uge if target == 0xffff_ffff => Some(false),
        RelOp::Eq if target == 0 => Some(false),
        RelOp::Neq if target == 0 => Some(true),
        _ => None,
    }
}

impl Processor for Arm {
    fn initialize(&mut self, builder: &mut Builder) {
        self.registers = (0..16).map(|index| builder.register(index)).collect();
    }

    #[allow(clippy::too_many_lines)]
    fn step(
        &mut self,
        ctx: &mut PathContext,
        next_address: &mut u32,
        address: u32,
    ) -> Result<Step> {
        let disasm = ctx.disassembly();
        let limits = ctx.limits();
        let insn = disasm.decode(address)?;
        *next_address = insn.next_address();

        match insn.condition {
            ConditionCode::Al => {}
            ConditionCode::Nv => return Ok(Step::Continue),
            cc => {
                let origin = self.flag_origin_for(cc, address)?;
                let condition = origin.lower(ctx.builder_mut(), cc, address)?;
                match sp_compare_override(ctx.builder(), &condition) {
                    Some(true) => {}
                    Some(false) => return Ok(Step::Continue),
                    None => {
                        match ctx.introduce_condition(condition, *next_address, &*self)? {
                            Verdict::Continue => {}
                            Verdict::Skip => return Ok(Step::Continue),
                        }
                    }
                }
            }
        }

        match insn.mnemonic {
            Mnemonic::Ldr => {
                let destination = insn.op(0).register();
                let load = if let Operand::Displacement { base, offset } = *insn.op(1) {
                    let builder = ctx.builder_mut();
                    let reg = self.register_value(builder, &disasm, address, base)?;
                    let offset = builder.constant(offset);
                    if insn.flags.contains(InsnFlags::WRITEBACK) {
                        let indexed = builder.add(reg, offset);
                        let load = builder.load(indexed)?;
                        if let Flow::Done = self.set_register(
                            builder,
                            &disasm,
                            &limits,
                            next_address,
                            address,
                            base,
                            indexed,
                        )? {
                            return Ok(Step::Done);
                        }
                        load
                    } else if insn.flags.contains(InsnFlags::POST_INDEX) {
                        let load = builder.load(reg)?;
                        let indexed = builder.add(reg, offset);
                        if let Flow::Done = self.set_register(
                            builder,
                            &disasm,
                            &limits,
                            next_address,
                            address,
                            base,
                            indexed,
                        )? {
                            return Ok(Step::Done);
                        }
                        load
                    } else {
                        let indexed = builder.add(reg, offset);
                        builder.load(indexed)?
                    }
                } else {
                    let pointer = self.operand_value(
                        ctx.builder_mut(),
                        &disasm,
                        insn.op(1),
                        address,
                        false,
                    )?;
                    ctx.builder_mut().load(pointer)?
                };
                if let Flow::Done = self.set_register(
                    ctx.builder_mut(),
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    destination,
                    load,
                )? {
                    return Ok(Step::Done);
                }
            }
            Mnemonic::Str => {
                let builder = ctx.builder_mut();
                let data =
                    self.register_value(builder, &disasm, address, insn.op(0).register())?;
                if let Operand::Displacement { base, offset } = *insn.op(1) {
                    let reg = self.register_value(builder, &disasm, address, base)?;
                    let offset = builder.constant(offset);
                    if insn.flags.contains(InsnFlags::WRITEBACK) {
                        let indexed = builder.add(reg, offset);
                        builder.store(data, indexed);
                        if let Flow::Done = self.set_register(
                            builder,
                            &disasm,
                            &limits,
                            next_address,
                            address,
                            base,
                            indexed,
                        )? {
                            return Ok(Step::Done);
                        }
                    } else if insn.flags.contains(InsnFlags::POST_INDEX) {
                        builder.store(data, reg);
                        let indexed = builder.add(reg, offset);
                        if let Flow::Done = self.set_register(
                            builder,
                            &disasm,
                            &limits,
                            next_address,
                            address,
                            base,
                            indexed,
                        )? {
                            return Ok(Step::Done);
                        }
                    } else {
                        let indexed = builder.add(reg, offset);
                        builder.store(data, indexed);
                    }
                } else {
                    let pointer =
                        self.operand_value(builder, &disasm, insn.op(1), address, false)?;
                    let builder = ctx.builder_mut();
                    builder.store(data, pointer);
                }
            }
            Mnemonic::Mul => {
                let builder = ctx.builder_mut();
                let destination = insn.op(0).register();
                let (n1, n2) = if insn.op(2).is_none() {
                    (
                        self.operand_value(builder, &disasm, insn.op(0), address, false)?,
                        self.operand_value(builder, &disasm, insn.op(1), address, false)?,
                    )
                } else {
                    (
                        self.operand_value(builder, &disasm, insn.op(1), address, false)?,
                        self.operand_value(builder, &disasm, insn.op(2), address, false)?,
                    )
                };
                let product = builder.mult(n1, n2);
                if let Flow::Done = self.set_register(
                    builder,
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    destination,
                    product,
                )? {
                    return Ok(Step::Done);
                }
                if insn.flags.contains(InsnFlags::SETS_FLAGS) {
                    self.set_flag(FlagKind::Mult, n1, n2);
                }
            }
            Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::Cmp
            | Mnemonic::Cmn
            | Mnemonic::Adc
            | Mnemonic::Sbc
            | Mnemonic::Rsb => {
                let builder = ctx.builder_mut();
                let destination = insn.op(0).register();
                let (mut n1, mut n2) = if insn.op(2).is_none() {
                    (
                        self.operand_value(builder, &disasm, insn.op(0), address, false)?,
                        self.operand_value(builder, &disasm, insn.op(1), address, false)?,
                    )
                } else {
                    (
                        self.operand_value(builder, &disasm, insn.op(1), address, false)?,
                        self.operand_value(builder, &disasm, insn.op(2), address, false)?,
                    )
                };

                match insn.mnemonic {
                    Mnemonic::Adc | Mnemonic::Sbc => {
                        let carry = self
                            .carry
                            .as_ref()
                            .map(Arc::clone)
                            .and_then(|origin| origin.carry(builder))
                            .ok_or(Error::FlagOrigin(u64::from(address)))?;
                        n2 = builder.add(n2, carry);
                        if insn.mnemonic == Mnemonic::Sbc {
                            let minus_one = builder.constant(0xffff_ffff);
                            n2 = builder.mult(n2, minus_one);
                        }
                    }
                    Mnemonic::Sub | Mnemonic::Cmp => {
                        let minus_one = builder.constant(0xffff_ffff);
                        n2 = builder.mult(n2, minus_one);
                    }
                    Mnemonic::Cmn => {
                        let all_ones = builder.constant(0xffff_ffff);
                        let inverted = builder.xor(n2, all_ones);
                        let minus_one = builder.constant(0xffff_ffff);
                        n2 = builder.mult(inverted, minus_one);
                    }
                    Mnemonic::Rsb => {
                        let minus_one = builder.constant(0xffff_ffff);
                        n1 = builder.mult(n1, minus_one);
                    }
                    _ => {}
                }

                if insn.mnemonic != Mnemonic::Cmp && insn.mnemonic != Mnemonic::Cmn {
                    let sum = builder.add(n1, n2);
                    if let Flow::Done = self.set_register(
                        builder,
                        &disasm,
                        &limits,
                        next_address,
                        address,
                        destination,
                        sum,
                    )? {
                        return Ok(Step::Done);
                    }
                }
                if insn.mnemonic == Mnemonic::Cmp
                    || insn.mnemonic == Mnemonic::Cmn
                    || insn.flags.contains(InsnFlags::SETS_FLAGS)
                {
                    self.set_flag(FlagKind::Add, n1, n2);
                }
            }
            Mnemonic::Adr | Mnemonic::Mov => {
                let destination = insn.op(0).register();
                let node = self.operand_value(
                    ctx.builder_mut(),
                    &disasm,
                    insn.op(1),
                    address,
                    insn.flags.contains(InsnFlags::SETS_FLAGS),
                )?;
                if let Flow::Done = self.set_register(
                    ctx.builder_mut(),
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    destination,
                    node,
                )? {
                    return Ok(Step::Done);
                }
            }
            Mnemonic::Mvn => {
                let builder = ctx.builder_mut();
                let destination = insn.op(0).register();
                let operand = self.operand_value(
                    builder,
                    &disasm,
                    insn.op(1),
                    address,
                    insn.flags.contains(InsnFlags::SETS_FLAGS),
                )?;
                let all_ones = builder.constant(0xffff_ffff);
                let node = builder.xor(operand, all_ones);
                if let Flow::Done = self.set_register(
                    builder,
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    destination,
                    node,
                )? {
                    return Ok(Step::Done);
                }
            }
            Mnemonic::Neg => {
                let builder = ctx.builder_mut();
                let destination = insn.op(0).register();
                let operand = self.operand_value(
                    builder,
                    &disasm,
                    insn.op(1),
                    address,
                    insn.flags.contains(InsnFlags::SETS_FLAGS),
                )?;
                let minus_one = builder.constant(0xffff_ffff);
                let node = builder.mult(operand, minus_one);
                if let Flow::Done = self.set_register(
                    builder,
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    destination,
                    node,
                )? {
                    return Ok(Step::Done);
                }
            }
            Mnemonic::Ldrd => {
                let builder = ctx.builder_mut();
                let reg_a = insn.op(0).register();
                let reg_b = insn.op(1).register();
                let pointer = self.operand_value(builder, &disasm, insn.op(2), address, false)?;
                let load_a = builder.load(pointer)?;
                let four = builder.constant(4);
                let high_pointer = builder.add(pointer, four);
                let load_b = builder.load(high_pointer)?;
                if let Flow::Done = self.set_register(
                    builder, &disasm, &limits, next_address, address, reg_a, load_a,
                )? {
                    return Ok(Step::Done);
                }
                if let Flow::Done = self.set_register(
                    builder, &disasm, &limits, next_address, address, reg_b, load_b,
                )? {
                    return Ok(Step::Done);
                }
            }
            Mnemonic::Strd => {
                let builder = ctx.builder_mut();
                let reg_a = insn.op(0).register();
                let reg_b = insn.op(1).register();
                let pointer = self.operand_value(builder, &disasm, insn.op(2), address, false)?;
                let data_a = self.register_value(builder, &disasm, address, reg_a)?;
                let data_b = self.register_value(builder, &disasm, address, reg_b)?;
                builder.store(data_a, pointer);
                let four = builder.constant(4);
                let high_pointer = builder.add(pointer, four);
                builder.store(data_b, high_pointer);
            }
            Mnemonic::Push | Mnemonic::Stm => {
                let builder = ctx.builder_mut();
                let (base, list, post, increment, writeback) = if insn.mnemonic == Mnemonic::Push
                {
                    (SP, list_of(insn.op(0))?, false, false, true)
                } else {
                    (
                        insn.op(0).register(),
                        list_of(insn.op(1))?,
                        insn.flags.contains(InsnFlags::POST_INDEX),
                        !insn.flags.contains(InsnFlags::NEG_OFFSET),
                        insn.flags.contains(InsnFlags::WRITEBACK_MULTI),
                    )
                };
                let base_node = self.register_value(builder, &disasm, address, base)?;
                let mut displacement = 0u32;
                for reg in register_walk(increment) {
                    if list & (1 << reg) == 0 {
                        continue;
                    }
                    if !post {
                        displacement += 4;
                    }
                    let data = self.register_value(builder, &disasm, address, reg)?;
                    let offset = builder.constant(signed_walk_offset(increment, displacement));
                    let slot = builder.add(base_node, offset);
                    builder.store(data, slot);
                    if post {
                        displacement += 4;
                    }
                }
                if writeback {
                    let offset = builder.constant(signed_walk_offset(increment, displacement));
                    let updated = builder.add(base_node, offset);
                    if let Flow::Done = self.set_register(
                        builder,
                        &disasm,
                        &limits,
                        next_address,
                        address,
                        base,
                        updated,
                    )? {
                        return Ok(Step::Done);
                    }
                }
            }
            Mnemonic::Pop | Mnemonic::Ldm => {
                let builder = ctx.builder_mut();
                let (base, list, post, increment, writeback) = if insn.mnemonic == Mnemonic::Pop {
                    (SP, list_of(insn.op(0))?, true, true, true)
                } else {
                    (
                        insn.op(0).register(),
                        list_of(insn.op(1))?,
                        insn.flags.contains(InsnFlags::POST_INDEX),
                        !insn.flags.contains(InsnFlags::NEG_OFFSET),
                        insn.flags.contains(InsnFlags::WRITEBACK_MULTI),
                    )
                };
                let base_node = self.register_value(builder, &disasm, address, base)?;
                let mut displacement = 0u32;
                for reg in register_walk(increment) {
                    if list & (1 << reg) == 0 {
                        continue;
                    }
                    if !post {
                        displacement += 4;
                    }
                    let offset = builder.constant(signed_walk_offset(increment, displacement));
                    let slot = builder.add(base_node, offset);
                    let load = builder.load(slot)?;
                    if let Flow::Done = self.set_register(
                        builder, &disasm, &limits, next_address, address, reg, load,
                    )? {
                        return Ok(Step::Done);
                    }
                    if post {
                        displacement += 4;
                    }
                }
                if writeback {
                    let offset = builder.constant(signed_walk_offset(increment, displacement));
                    let updated = builder.add(base_node, offset);
                    if let Flow::Done = self.set_register(
                        builder,
                        &disasm,
                        &limits,
                        next_address,
                        address,
                        base,
                        updated,
                    )? {
                        return Ok(Step::Done);
                    }
                }
            }
            Mnemonic::Tst
            | Mnemonic::Teq
            | Mnemonic::And
            | Mnemonic::Orr
            | Mnemonic::Eor
            | Mnemonic::Bic
            | Mnemonic::Orn => {
                let builder = ctx.builder_mut();
                let destination = insn.op(0).register();
                let update_flags = insn.flags.contains(InsnFlags::SETS_FLAGS)
                    || insn.mnemonic == Mnemonic::Tst
                    || insn.mnemonic == Mnemonic::Teq;
                let (source_reg, mut n2) = if insn.op(2).is_none() {
                    (
                        destination,
                        self.operand_value(builder, &disasm, insn.op(1), address, update_flags)?,
                    )
                } else {
                    (
                        insn.op(1).register(),
                        self.operand_value(builder, &disasm, insn.op(2), address, update_flags)?,
                    )
                };
                let n1 = self.register_value(builder, &disasm, address, source_reg)?;
                let (result, flag_kind) = match insn.mnemonic {
                    Mnemonic::Tst => (None, FlagKind::And),
                    Mnemonic::Teq => (None, FlagKind::Xor),
                    Mnemonic::And => (Some(builder.and(n1, n2)), FlagKind::And),
                    Mnemonic::Orr => (Some(builder.or(n1, n2)), FlagKind::Or),
                    Mnemonic::Eor => (Some(builder.xor(n1, n2)), FlagKind::Xor),
                    Mnemonic::Bic => {
                        let all_ones = builder.constant(0xffff_ffff);
                        n2 = builder.xor(n2, all_ones);
                        (Some(builder.and(n1, n2)), FlagKind::And)
                    }
                    _ => {
                        let all_ones = builder.constant(0xffff_ffff);
                        n2 = builder.xor(n2, all_ones);
                        (Some(builder.or(n1, n2)), FlagKind::Or)
                    }
                };
                if let Some(result) = result {
                    if let Flow::Done = self.set_register(
                        builder,
                        &disasm,
                        &limits,
                        next_address,
                        address,
                        destination,
                        result,
                    )? {
                        return Ok(Step::Done);
                    }
                }
                if update_flags {
                    self.set_flag(flag_kind, n1, n2);
                }
            }
            Mnemonic::Lsl
            | Mnemonic::Lsr
            | Mnemonic::Asr
            | Mnemonic::Ror
            | Mnemonic::Uxth
            | Mnemonic::Uxtb => {
                let builder = ctx.builder_mut();
                let destination = insn.op(0).register();
                let sets_flags = insn.flags.contains(InsnFlags::SETS_FLAGS);
                let (source_reg, mut n2) = if insn.op(2).is_none() {
                    (
                        destination,
                        self.operand_value(builder, &disasm, insn.op(1), address, sets_flags)?,
                    )
                } else {
                    (
                        insn.op(1).register(),
                        self.operand_value(builder, &disasm, insn.op(2), address, sets_flags)?,
                    )
                };
                let n1 = self.register_value(builder, &disasm, address, source_reg)?;
                let result = match insn.mnemonic {
                    Mnemonic::Uxth => {
                        let mask = builder.constant(0xffff);
                        builder.and(n2, mask)
                    }
                    Mnemonic::Uxtb => {
                        let mask = builder.constant(0xff);
                        builder.and(n2, mask)
                    }
                    mnemonic => {
                        if mnemonic == Mnemonic::Lsr || mnemonic == Mnemonic::Asr {
                            let minus_one = builder.constant(0xffff_ffff);
                            n2 = builder.mult(n2, minus_one);
                        }
                        let result = if mnemonic == Mnemonic::Ror {
                            builder.rotate(n1, n2)
                        } else {
                            builder.shift(n1, n2)
                        };
                        if sets_flags {
                            self.set_flag(FlagKind::Shift, n1, n2);
                        }
                        result
                    }
                };
                if let Flow::Done = self.set_register(
                    builder,
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    destination,
                    result,
                )? {
                    return Ok(Step::Done);
                }
            }
            Mnemonic::B | Mnemonic::Bx => {
                let target =
                    self.operand_value(ctx.builder_mut(), &disasm, insn.op(0), address, false)?;
                return match self.jump_to_node(
                    ctx.builder_mut(),
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    target,
                )? {
                    Flow::Continue => Ok(Step::Continue),
                    Flow::Done => Ok(Step::Done),
                };
            }
            Mnemonic::Bl | Mnemonic::Blx => {
                let builder = ctx.builder_mut();
                let target = self.operand_value(builder, &disasm, insn.op(0), address, false)?;
                let return_address = builder.constant(insn.next_address());
                self.registers[usize::from(LR)] = return_address;
                self.push_call_stack(insn.next_address());
                return match self.jump_to_node(
                    builder,
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    target,
                )? {
                    Flow::Continue => Ok(Step::Continue),
                    Flow::Done => Ok(Step::Done),
                };
            }
            Mnemonic::Rev => {
                let builder = ctx.builder_mut();
                let destination = insn.op(0).register();
                let node = self.operand_value(builder, &disasm, insn.op(1), address, false)?;
                let shift_24r = builder.constant(24u32.wrapping_neg());
                let byte0 = builder.shift(node, shift_24r);
                let shift_8r = builder.constant(8u32.wrapping_neg());
                let shifted1 = builder.shift(node, shift_8r);
                let mask1 = builder.constant(0xff00);
                let byte1 = builder.and(shifted1, mask1);
                let shift_8l = builder.constant(8);
                let shifted2 = builder.shift(node, shift_8l);
                let mask2 = builder.constant(0x00ff_0000);
                let byte2 = builder.and(shifted2, mask2);
                let shift_24l = builder.constant(24);
                let shifted3 = builder.shift(node, shift_24l);
                let mask3 = builder.constant(0xff00_0000);
                let byte3 = builder.and(shifted3, mask3);
                let low = builder.or(byte0, byte1);
                let mid = builder.or(low, byte2);
                let reversed = builder.or(mid, byte3);
                if let Flow::Done = self.set_register(
                    builder,
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    destination,
                    reversed,
                )? {
                    return Ok(Step::Done);
                }
            }
            Mnemonic::Ubfx | Mnemonic::Sbfx => {
                let builder = ctx.builder_mut();
                let destination = insn.op(0).register();
                let low_bit = immediate_of(insn.op(2))?;
                let width = immediate_of(insn.op(3))?;
                let node = self.operand_value(builder, &disasm, insn.op(1), address, false)?;
                let down = builder.constant(low_bit.wrapping_neg());
                let shifted = builder.shift(node, down);
                let mask = builder.constant(1u32.wrapping_shl(width).wrapping_sub(1));
                let mut field = builder.and(shifted, mask);
                if insn.mnemonic == Mnemonic::Sbfx {
                    // sign extension is applied to constants only, extending
                    // a symbolic value would force a fork
                    let value = builder.graph().node(field).and_then(Node::constant_value);
                    if let Some(value) = value {
                        if width > 0 && value & 1u32.wrapping_shl(width - 1) != 0 {
                            field =
                                builder.constant(value | 0xffff_ffffu32.wrapping_shl(width));
                        }
                    }
                }
                if let Flow::Done = self.set_register(
                    builder,
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    destination,
                    field,
                )? {
                    return Ok(Step::Done);
                }
            }
            Mnemonic::Movt => {
                let builder = ctx.builder_mut();
                let destination = insn.op(0).register();
                let immediate = immediate_of(insn.op(1))?;
                let current = self.register_value(builder, &disasm, address, destination)?;
                let low_mask = builder.constant(0xffff);
                let low = builder.and(current, low_mask);
                let high = builder.constant(immediate << 16);
                let node = builder.or(low, high);
                if let Flow::Done = self.set_register(
                    builder,
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    destination,
                    node,
                )? {
                    return Ok(Step::Done);
                }
            }
            Mnemonic::Cbz | Mnemonic::Cbnz => {
                let builder = ctx.builder_mut();
                let register = insn.op(0).register();
                let node = self.register_value(builder, &disasm, address, register)?;
                let zero = builder.constant(0);
                let op = if insn.mnemonic == Mnemonic::Cbz {
                    RelOp::Eq
                } else {
                    RelOp::Neq
                };
                let condition = Condition::new(node, op, zero);
                match ctx.introduce_condition(condition, insn.next_address(), &*self)? {
                    Verdict::Continue => {
                        let target = self.operand_value(
                            ctx.builder_mut(),
                            &disasm,
                            insn.op(1),
                            address,
                            false,
                        )?;
                        return match self.jump_to_node(
                            ctx.builder_mut(),
                            &disasm,
                            &limits,
                            next_address,
                            address,
                            target,
                        )? {
                            Flow::Continue => Ok(Step::Continue),
                            Flow::Done => Ok(Step::Done),
                        };
                    }
                    Verdict::Skip => return Ok(Step::Continue),
                }
            }
            Mnemonic::Ret => {
                let builder = ctx.builder_mut();
                let target = self.register_value(builder, &disasm, address, LR)?;
                return match self.jump_to_node(
                    builder,
                    &disasm,
                    &limits,
                    next_address,
                    address,
                    target,
                )? {
                    Flow::Continue => Ok(Step::Continue),
                    Flow::Done => Ok(Step::Done),
                };
            }
            Mnemonic::Nop => {}
            mnemonic => {
                return Err(Error::UnsupportedInstruction {
                    mnemonic: mnemonic.to_string(),
                    address: u64::from(address),
                });
            }
        }

        Ok(Step::Continue)
    }

    fn should_retain(&self, graph: &Graph, node: &Node) -> bool {
        if self.registers.first() == Some(&node.id) {
            // current return value
            return true;
        }
        if matches!(node.kind, NodeKind::Store) {
            // stack stores are scratch space, anything else is an output
            let address = node.inputs.get(1).and_then(|input| graph.node(*input));
            let stack_store = match address.map(|node| (&node.kind, &node.inputs)) {
                Some((NodeKind::Register(SP), _)) => true,
                Some((NodeKind::Add, inputs)) => inputs.iter().any(|input| {
                    matches!(
                        graph.node(*input).map(|node| &node.kind),
                        Some(NodeKind::Register(SP))
                    )
                }),
                _ => false,
            };
            return !stack_store;
        }
        false
    }

    fn migrate(&self, graph: &Graph) -> Result<Box<dyn Processor>> {
        let mut registers = Vec::with_capacity(self.registers.len());
        for register in &self.registers {
            registers.push(graph.migrate(*register)?);
        }

        // flag objects are compared by pointer, so migration must keep
        // shared origins shared
        let carry = match &self.carry {
            Some(origin) => Some(Arc::new(origin.migrate(graph)?)),
            None => None,
        };
        let overflow = match (&self.overflow, &self.carry) {
            (Some(overflow), Some(old_carry)) if Arc::ptr_eq(overflow, old_carry) => {
                carry.clone()
            }
            (Some(overflow), _) => Some(Arc::new(overflow.migrate(graph)?)),
            (None, _) => None,
        };
        let zero = match &self.zero {
            Some(zero) if shares(zero, &self.carry) => carry.clone(),
            Some(zero) if shares(zero, &self.overflow) => overflow.clone(),
            Some(zero) => Some(Arc::new(zero.migrate(graph)?)),
            None => None,
        };
        let negative = match &self.negative {
            Some(negative) if shares(negative, &self.carry) => carry.clone(),
            Some(negative) if shares(negative, &self.overflow) => overflow.clone(),
            Some(negative) if shares(negative, &self.zero) => zero.clone(),
            Some(negative) => Some(Arc::new(negative.migrate(graph)?)),
            None => None,
        };

        Ok(Box::new(Arm {
            registers,
            call_stack: self.call_stack.clone(),
            carry,
            overflow,
            zero,
            negative,
        }))
    }
}

fn shares(origin: &Arc<FlagOrigin>, other: &Option<Arc<FlagOrigin>>) -> bool {
    other
        .as_ref()
        .is_some_and(|other| Arc::ptr_eq(origin, other))
}

fn register_walk(increment: bool) -> Box<dyn Iterator<Item = u8>> {
    if increment {
        Box::new(0..16)
    } else {
        Box::new((0..16).rev())
    }
}

fn signed_walk_offset(increment: bool, displacement: u32) -> u32 {
    if increment {
        displacement
    } else {
        displacement.wrapping_neg()
    }
}

fn list_of(operand: &Operand) -> Result<u16> {
    match operand {
        Operand::RegisterList(list) => Ok(*list),
        other => Err(internal_error!("expected a register list, found {:?}", other)),
    }
}

fn immediate_of(operand: &Operand) -> Result<u32> {
    match operand {
        Operand::Immediate(value) => Ok(*value),
        other => Err(internal_error!("expected an immediate, found {:?}", other)),
    }
}
