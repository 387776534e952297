//! Host disassembler abstraction
//!
//! The engine never touches binary images directly. Everything it knows about
//! the program under analysis, instruction encodings, segment properties,
//! literal pool contents, arrives through a [`DisassemblyService`]
//! implementation supplied by the embedding application. The
//! [`Disassembly`] wrapper serializes access to that service so worker
//! threads can share one instance.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::{Error, Result};

/// Barrel shifter modes of the ARM data processing operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    /// Logical shift left
    Lsl,
    /// Logical shift right
    Lsr,
    /// Arithmetic shift right
    Asr,
    /// Rotate right
    Ror,
    /// Rotate right by one through carry
    Rrx,
}

/// ARM condition codes, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionCode {
    /// Z set
    Eq,
    /// Z clear
    Ne,
    /// C set
    Cs,
    /// C clear
    Cc,
    /// N set
    Mi,
    /// N clear
    Pl,
    /// V set
    Vs,
    /// V clear
    Vc,
    /// C set and Z clear
    Hi,
    /// C clear or Z set
    Ls,
    /// N equals V
    Ge,
    /// N differs from V
    Lt,
    /// Z clear and N equals V
    Gt,
    /// Z set or N differs from V
    Le,
    /// Unconditional
    Al,
    /// Never
    Nv,
}

/// Shift amount of a shifted register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftAmount {
    /// Immediate shift count
    Immediate(u32),
    /// Shift count held in a register
    Register(u8),
}

/// One decoded instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Operand slot is unused
    None,
    /// Plain register
    Register(u8),
    /// Immediate value
    Immediate(u32),
    /// Direct memory or code address, already resolved by the decoder
    Address(u32),
    /// Base register plus immediate offset, `[Rn, #offset]`
    Displacement {
        /// Base register
        base: u8,
        /// Byte offset, already sign-applied by the decoder
        offset: u32,
    },
    /// Base register plus optionally shifted index register, `[Rn, Rm, LSL #n]`
    Phrase {
        /// Base register
        base: u8,
        /// Index register
        index: u8,
        /// Shift applied to the index register
        shift: ShiftKind,
        /// Immediate shift amount, 0 for a plain register offset
        amount: u32,
    },
    /// Register with barrel shifter applied, `Rm, LSL Rs` or `Rm, LSL #n`
    Shifted {
        /// Shifted register
        base: u8,
        /// Shift mode
        shift: ShiftKind,
        /// Shift count, immediate or register-held
        amount: ShiftAmount,
    },
    /// Register list of a load or store multiple, one bit per register
    RegisterList(u16),
}

impl Operand {
    /// True if this operand slot is unused.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }

    /// Register index of a [`Operand::Register`] operand, 0 otherwise.
    #[must_use]
    pub fn register(&self) -> u8 {
        match self {
            Operand::Register(index) => *index,
            _ => 0,
        }
    }
}

/// Decoded instruction mnemonics.
///
/// The decoder may report mnemonics the symbolic engine has no model for;
/// those surface as [`Error::UnsupportedInstruction`] when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[allow(missing_docs)]
pub enum Mnemonic {
    Ldr,
    Str,
    Ldrd,
    Strd,
    Mul,
    Add,
    Sub,
    Cmp,
    Cmn,
    Adc,
    Sbc,
    Rsb,
    Adr,
    Mov,
    Movt,
    Mvn,
    Neg,
    Push,
    Pop,
    Stm,
    Ldm,
    Tst,
    Teq,
    And,
    Orr,
    Eor,
    Bic,
    Orn,
    Lsl,
    Lsr,
    Asr,
    Ror,
    Uxth,
    Uxtb,
    B,
    Bx,
    Bl,
    Blx,
    Rev,
    Ubfx,
    Sbfx,
    Cbz,
    Cbnz,
    Ret,
    Nop,
    Udiv,
    Sdiv,
    Umull,
    Smull,
    Clz,
    Svc,
}

bitflags! {
    /// Auxiliary encoding bits of a decoded instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsnFlags: u16 {
        /// Instruction updates the condition flags (`S` suffix)
        const SETS_FLAGS = 0x0001;
        /// Pre-indexed addressing with base writeback (`!` suffix)
        const WRITEBACK = 0x0002;
        /// Post-indexed addressing
        const POST_INDEX = 0x0004;
        /// Memory offset or multi-transfer direction is negative
        const NEG_OFFSET = 0x0008;
        /// Base writeback of a load or store multiple
        const WRITEBACK_MULTI = 0x0010;
    }
}

/// One decoded machine instruction.
#[derive(Debug, Clone)]
pub struct Insn {
    /// Address the instruction was decoded at
    pub address: u32,
    /// Encoded size in bytes, 2 or 4
    pub size: u32,
    /// Operation
    pub mnemonic: Mnemonic,
    /// Condition code guarding execution
    pub condition: ConditionCode,
    /// Auxiliary encoding bits
    pub flags: InsnFlags,
    /// Up to four operands in encoding order
    pub operands: Vec<Operand>,
}

impl Insn {
    /// Creates an unconditional instruction with no auxiliary flags.
    #[must_use]
    pub fn new(address: u32, size: u32, mnemonic: Mnemonic, operands: Vec<Operand>) -> Insn {
        Insn {
            address,
            size,
            mnemonic,
            condition: ConditionCode::Al,
            flags: InsnFlags::empty(),
            operands,
        }
    }

    /// Sets the guarding condition code.
    #[must_use]
    pub fn with_condition(mut self, condition: ConditionCode) -> Insn {
        self.condition = condition;
        self
    }

    /// Sets auxiliary encoding bits.
    #[must_use]
    pub fn with_flags(mut self, flags: InsnFlags) -> Insn {
        self.flags = flags;
        self
    }

    /// Operand at the given slot, [`Operand::None`] when absent.
    #[must_use]
    pub fn op(&self, slot: usize) -> &Operand {
        self.operands.get(slot).unwrap_or(&Operand::None)
    }

    /// Address of the instruction following this one.
    #[must_use]
    pub fn next_address(&self) -> u32 {
        self.address.wrapping_add(self.size)
    }
}

/// Program knowledge the engine queries while reconstructing dataflow.
///
/// Implementations wrap whatever the embedding application uses as its source
/// of truth, typically an interactive disassembler database or a raw firmware
/// image with a symbol table. All methods take `&self`; the [`Disassembly`]
/// wrapper provides the cross-thread serialization.
pub trait DisassemblyService: Send {
    /// Decodes the instruction at the given address.
    fn decode(&self, address: u32) -> Result<Insn>;

    /// Reads a 32-bit little-endian word from the program image.
    fn read_word(&self, address: u32) -> Option<u32>;

    /// True if the address lies in a read-only mapped section.
    fn is_read_only(&self, address: u32) -> bool;

    /// True if the address lies in a section belonging to the program itself
    /// rather than an import stub.
    fn is_internal(&self, address: u32) -> bool;

    /// True if the address is decoded in Thumb mode.
    fn is_thumb(&self, address: u32) -> bool;

    /// Start address of the function containing `address`, if known.
    fn function_start(&self, address: u32) -> Option<u32>;

    /// False if the function at the given address is known not to return.
    fn function_returns(&self, address: u32) -> bool;

    /// Display name of the function at the given address.
    fn function_name(&self, address: u32) -> String {
        format!("sub_{address:x}")
    }
}

/// Shared, synchronized handle to a [`DisassemblyService`].
///
/// Cloning is cheap; all clones talk to the same underlying service through
/// one mutex, mirroring a host API that tolerates only one caller at a time.
#[derive(Clone)]
pub struct Disassembly {
    inner: Arc<Mutex<Box<dyn DisassemblyService>>>,
}

impl Disassembly {
    /// Wraps a service for shared use.
    #[must_use]
    pub fn new(service: Box<dyn DisassemblyService>) -> Disassembly {
        Disassembly {
            inner: Arc::new(Mutex::new(service)),
        }
    }

    /// Decodes the instruction at the given address.
    pub fn decode(&self, address: u32) -> Result<Insn> {
        self.inner.lock().map_err(|_| Error::LockError)?.decode(address)
    }

    /// Reads a 32-bit word from the program image.
    pub fn read_word(&self, address: u32) -> Result<Option<u32>> {
        Ok(self.inner.lock().map_err(|_| Error::LockError)?.read_word(address))
    }

    /// True if the address lies in a read-only section.
    pub fn is_read_only(&self, address: u32) -> Result<bool> {
        Ok(self.inner.lock().map_err(|_| Error::LockError)?.is_read_only(address))
    }

    /// True if the address belongs to the program image itself.
    pub fn is_internal(&self, address: u32) -> Result<bool> {
        Ok(self.inner.lock().map_err(|_| Error::LockError)?.is_internal(address))
    }

    /// True if the address is decoded in Thumb mode.
    pub fn is_thumb(&self, address: u32) -> Result<bool> {
        Ok(self.inner.lock().map_err(|_| Error::LockError)?.is_thumb(address))
    }

    /// Start address of the containing function, if known.
    pub fn function_start(&self, address: u32) -> Result<Option<u32>> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| Error::LockError)?
            .function_start(address))
    }

    /// False if the function at the address is known not to return.
    pub fn function_returns(&self, address: u32) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| Error::LockError)?
            .function_returns(address))
    }

    /// Display name of the function at the given address.
    pub fn function_name(&self, address: u32) -> Result<String> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| Error::LockError)?
            .function_name(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_slot_out_of_range_is_none() {
        let insn = Insn {
            address: 0x1000,
            size: 4,
            mnemonic: Mnemonic::Nop,
            condition: ConditionCode::Al,
            flags: InsnFlags::empty(),
            operands: vec![],
        };
        assert!(insn.op(0).is_none());
        assert!(insn.op(3).is_none());
        assert_eq!(insn.next_address(), 0x1004);
    }

    #[test]
    fn test_mnemonic_display_lowercase() {
        assert_eq!(Mnemonic::Ldr.to_string(), "ldr");
        assert_eq!(Mnemonic::Umull.to_string(), "umull");
    }
}
