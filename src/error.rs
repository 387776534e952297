use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers all possible error conditions that can occur during symbolic graph
/// construction, condition solving, and instruction emulation. Each variant provides specific
/// context about the failure mode to enable appropriate error handling.
///
/// Errors are strictly per-path: a failing execution path yields its error through
/// [`AnalysisOutcome::Failed`](crate::AnalysisOutcome::Failed) without affecting sibling
/// paths of the same function.
///
/// # Error Categories
///
/// ## Instruction Decoding and Semantics
/// - [`Error::Decode`] - The host disassembler could not decode an instruction
/// - [`Error::UnsupportedInstruction`] - A decoded instruction has no symbolic model
/// - [`Error::SymbolicBranchTarget`] - A branch target did not resolve to a constant
/// - [`Error::FlagOrigin`] - A condition needs flags from two different instructions
///
/// ## Resource Ceilings
/// - [`Error::GraphSizeExceeded`] - The node count ceiling was hit
/// - [`Error::NoProgress`] - Too many consecutive instructions without graph growth
/// - [`Error::ConstructionTimeout`] - The per-path wall clock budget was exhausted
/// - [`Error::ConditionLimit`] - Too many path conditions were introduced
///
/// ## Structural Errors
/// - [`Error::Migration`] - A node handle could not be re-resolved in a forked graph
/// - [`Error::LockError`] - Thread synchronization failure
/// - [`Error::Internal`] - A structural invariant was violated
#[derive(Error, Debug)]
pub enum Error {
    /// The host disassembler could not decode the instruction at the given address.
    #[error("Failed to decode instruction @ {0:#x}")]
    Decode(u64),

    /// A decoded instruction is not modeled by the active processor.
    ///
    /// The fields carry the mnemonic as reported by the host disassembler and
    /// the address of the offending instruction.
    #[error("Unsupported instruction '{mnemonic}' @ {address:#x}")]
    UnsupportedInstruction {
        /// Mnemonic reported by the host disassembler
        mnemonic: String,
        /// Address of the instruction
        address: u64,
    },

    /// A control flow transfer target did not simplify to a constant.
    ///
    /// Indirect jumps through non-constant expressions cannot be followed
    /// by path-sensitive reconstruction.
    #[error("Branch target is not a constant expression @ {0:#x}")]
    SymbolicBranchTarget(u64),

    /// A conditional instruction requires flags produced by more than one
    /// preceding instruction.
    ///
    /// Conditions such as unsigned-higher combine the carry and zero flags;
    /// when those were set by different instructions no single symbolic
    /// comparison can be recovered.
    #[error("Condition requires flags from multiple origins @ {0:#x}")]
    FlagOrigin(u64),

    /// The graph node ceiling was exceeded while building a path.
    ///
    /// The associated field names the function whose path hit the ceiling.
    #[error("Maximum graph size exceeded while analyzing {0}")]
    GraphSizeExceeded(String),

    /// Too many consecutive instructions contributed no new nodes.
    ///
    /// This catches non-terminating loops that no longer make progress on
    /// the dataflow graph.
    #[error("{count} consecutive instructions without progress while analyzing {function}")]
    NoProgress {
        /// The no-progress streak length that was reached
        count: u32,
        /// Name of the function under analysis
        function: String,
    },

    /// The per-path wall clock construction budget was exhausted.
    #[error("Maximum construction time exceeded while analyzing {0}")]
    ConstructionTimeout(String),

    /// The number of introduced path conditions reached the configured ceiling.
    #[error("Maximum number of conditions exceeded @ {0:#x}")]
    ConditionLimit(u64),

    /// A node handle could not be re-resolved after a graph fork.
    ///
    /// Every node id present in the parent graph must resolve in the fork;
    /// failure indicates a structural defect in the forked state.
    #[error("Failed to migrate node {0} into forked graph")]
    Migration(u32),

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically
    /// when trying to acquire a mutex that is in an invalid state.
    #[error("Failed to lock target")]
    LockError,

    /// A structural invariant was violated.
    ///
    /// The error includes the source location where the violation was
    /// detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of the violated invariant
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Internal - {file}:{line}: {message}")]
    Internal {
        /// The message to be printed for the Internal error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },
}
