// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # dfgscope
//!
//! [![Crates.io](https://img.shields.io/crates/v/dfgscope.svg)](https://crates.io/crates/dfgscope)
//! [![Documentation](https://docs.rs/dfgscope/badge.svg)](https://docs.rs/dfgscope)
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/BinFlip/dfgscope/blob/main/LICENSE-APACHE)
//!
//! A multi-threaded symbolic execution engine that reconstructs dataflow graphs from
//! obfuscated 32-bit ARM/Thumb machine code. Built in pure Rust, `dfgscope` executes
//! functions over a hash-consed term graph instead of concrete values, simplifying
//! algebraically as it goes, so that the arithmetic a compiled function really performs
//! survives while the obfuscation around it folds away.
//!
//! ## Features
//!
//! - **🔗 Hash-consed term graph** - Structurally identical expressions share one node,
//!   across operand orderings of commutative operations
//! - **⚡ Simplifying construction** - Constant folding, flattening, distribution and
//!   shift/rotate merging happen while nodes are built, not in a separate pass
//! - **🔀 Bounded path exploration** - A per-function oracle decides which side of an
//!   undecidable branch to follow, with a fork budget and loop patience
//! - **🧮 Branch constraint solving** - Path predicates are normalized relational
//!   conditions; implied or contradicted branches never fork at all
//! - **🧵 Parallel by construction** - Every execution path is an isolated task on a
//!   worker pool, forked paths migrate their whole state to a private graph copy
//! - **🛡️ Resource ceilings** - Graph size, construction time, condition count and
//!   no-progress streaks all abort a single path without affecting its siblings
//!
//! ## Quick Start
//!
//! Add `dfgscope` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! dfgscope = "0.1"
//! ```
//!
//! Implement [`disasm::DisassemblyService`] for whatever gives you decoded
//! instructions (an IDA/Ghidra export, a standalone decoder, a test fixture) and
//! hand it to the [`Analyzer`]:
//!
//! ```rust,no_run
//! use dfgscope::prelude::*;
//! # fn service() -> Disassembly { unimplemented!() }
//!
//! let analyzer = Analyzer::new(service());
//! analyzer.schedule(0x1c_e4)?;
//!
//! while let Some(outcome) = analyzer.wait_result() {
//!     match outcome {
//!         AnalysisOutcome::Graph { name, graph, predicate, .. } => {
//!             println!("{name} under {}:", predicate.expression(&graph, 2));
//!             println!("{}", graph.export());
//!         }
//!         AnalysisOutcome::Failed { name, error, .. } => {
//!             eprintln!("{name}: {error}");
//!         }
//!     }
//! }
//! # Ok::<(), dfgscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! The engine is layered bottom-up:
//!
//! - [`graph`] - the hash-consed node store, fork and migration
//! - [`builder`] - simplifying node construction plus symbolic memory
//! - [`predicate`] - condition normalization and the path constraint solver
//! - [`oracle`] - fork policy, branch backlog and the per-function budget
//! - [`processor`] - the instruction-set strategy, with the builtin [`Arm`]
//! - [`context`] - per-path state, condition introduction and forking
//! - [`scheduler`] - the generic worker pool the paths run on
//! - [`analyzer`] - the driver that ties all of the above together
//!
//! ## Testing
//!
//! The test suite scripts small ARM programs directly against the engine:
//!
//! ```bash
//! cargo test
//! cargo bench  # builder micro-benchmarks
//! ```
#[macro_use]
pub(crate) mod macros;

pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// This module provides a curated selection of the most frequently used types
/// from across the dfgscope library, allowing for convenient glob imports.
///
/// # Example
///
/// ```rust,no_run
/// use dfgscope::prelude::*;
/// # fn service() -> Disassembly { unimplemented!() }
///
/// let analyzer = Analyzer::new(service());
/// analyzer.schedule(0x1000)?;
/// # Ok::<(), dfgscope::Error>(())
/// ```
pub mod prelude;

/// Resource limits for graph construction.
///
/// Every ceiling the engine honors lives in [`config::AnalysisLimits`]: call
/// inlining depth, graph size, wall-clock budgets, condition counts and the
/// per-function fork budget.
pub mod config;

/// The decoded-instruction model and the external disassembly service.
///
/// The engine does not decode machine code itself; a host (an interactive
/// disassembler, a standalone decoder, a test fixture) implements
/// [`disasm::DisassemblyService`] and the engine consumes decoded
/// [`disasm::Insn`] values through the lock-guarded [`disasm::Disassembly`]
/// wrapper.
pub mod disasm;

/// The hash-consed dataflow graph.
///
/// # Key Types
///
/// - [`graph::Graph`] - the node store, keyed for structural sharing
/// - [`graph::Node`] - one operation with inputs and consumer back-edges
/// - [`graph::NodeId`] - stable node handle, valid across graph forks
/// - [`graph::NodeKind`] - constants, registers, arithmetic, memory, calls
///
/// Graphs fork cheaply and node handles migrate across forks by id, which is
/// what makes whole execution paths transplantable to another worker thread.
pub mod graph;

/// Simplifying graph construction and symbolic memory.
///
/// [`builder::Builder`] is the only way nodes enter a graph. Algebraic
/// rewrites (folding, flattening, distribution, shift merging) run during
/// construction, and store-to-load forwarding gives each path a symbolic
/// memory map.
pub mod builder;

/// Branch conditions and the path constraint solver.
///
/// # Key Types
///
/// - [`predicate::Condition`] - one relational condition over graph nodes
/// - [`predicate::Predicate`] - the conjunction accumulated along a path
/// - [`predicate::Satisfied`] - the solver's three-valued answer
///
/// Conditions normalize to a canonical `expr OP constant` form so that the
/// merge rules can detect implication, contradiction and narrowing without
/// a general-purpose solver.
pub mod predicate;

/// Fork policy and the per-function path oracle.
pub mod oracle;

/// Generic worker pool for graph construction tasks.
pub mod scheduler;

/// Instruction-set strategies.
///
/// The [`processor::Processor`] trait is the seam between the engine and an
/// instruction set; [`processor::Arm`] is the builtin 32-bit ARM/Thumb
/// implementation.
pub mod processor;

/// Per-path execution state.
pub mod context;

/// The top-level driver.
pub mod analyzer;

/// Central error type for all analysis operations.
///
/// # Example
///
/// ```rust,no_run
/// use dfgscope::{Analyzer, Error};
/// # fn analyzer() -> Analyzer { unimplemented!() }
///
/// match analyzer().schedule(0x1000) {
///     Ok(()) => {}
///     Err(Error::Decode(address)) => eprintln!("no instruction at {address:#x}"),
///     Err(e) => eprintln!("error: {e}"),
/// }
/// ```
pub use error::Error;

/// The unified result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main entry point for scheduling analyses and collecting results.
///
/// See [`analyzer::Analyzer`] for the full driver API.
pub use analyzer::{AnalysisOutcome, Analyzer};

/// Resource limits applied to every scheduled function
pub use config::AnalysisLimits;

/// The builtin 32-bit ARM/Thumb execution strategy
pub use processor::Arm;
