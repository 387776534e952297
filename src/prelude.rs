//! # dfgscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the dfgscope library. Import this module to get quick access to the essential
//! types for symbolic dataflow graph reconstruction.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dfgscope operations
pub use crate::Error;

/// The result type used throughout dfgscope
pub use crate::Result;

/// Resource limits for graph construction
pub use crate::config::AnalysisLimits;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Driver for scheduling function analyses on the worker pool
pub use crate::analyzer::Analyzer;

/// Result of one finished execution path
pub use crate::analyzer::AnalysisOutcome;

// ================================================================================================
// Disassembly Service
// ================================================================================================

/// Host-implemented instruction source
pub use crate::disasm::DisassemblyService;

/// Lock-guarded handle wrapping a disassembly service
pub use crate::disasm::Disassembly;

/// Decoded instruction model
pub use crate::disasm::{ConditionCode, Insn, InsnFlags, Mnemonic, Operand};

// ================================================================================================
// Graph and Builder
// ================================================================================================

/// The hash-consed dataflow graph and its node handles
pub use crate::graph::{Graph, Node, NodeId, NodeKind};

/// Simplifying node constructor with symbolic memory
pub use crate::builder::Builder;

// ================================================================================================
// Path State
// ================================================================================================

/// Branch conditions and the accumulated path predicate
pub use crate::predicate::{Condition, Predicate, RelOp, Satisfied};

/// Execution strategies for concrete instruction sets
pub use crate::processor::{Arm, Processor, Step};

/// Per-path execution context
pub use crate::context::{PathContext, PathTask, Verdict};
