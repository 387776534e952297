//! Resource limits for graph construction
//!
//! This module provides configuration options bounding a single symbolic
//! execution pass. The hard ceilings map to distinct [`crate::Error`]
//! variants so callers can tell which one a runaway function hit; the
//! remaining knobs steer inlining and fork policy.

use std::time::Duration;

/// Resource ceilings applied to a single graph construction pass
///
/// The defaults are tuned for obfuscated 32-bit ARM code, where a single
/// function can unroll into hundreds of thousands of instructions. Raising
/// them trades analysis time for coverage of larger functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisLimits {
    /// Maximum function call depth that is inlined before a call is treated
    /// as an opaque `CALL` node (default: 2)
    pub max_call_depth: usize,

    /// Maximum number of nodes a single graph may contain (default: 200 000)
    pub max_graph_size: usize,

    /// Maximum number of consecutive instructions that add no new nodes to
    /// the graph before the pass is aborted as non-productive (default: 1000)
    pub max_consecutive_noops: usize,

    /// Wall-clock budget for constructing one graph (default: 10s)
    pub max_construction_time: Duration,

    /// Maximum number of path conditions recorded on one path (default: 1000)
    pub max_conditions: usize,

    /// Wall-clock budget for evaluating a finished graph (default: 10s)
    pub max_evaluation_time: Duration,

    /// Number of conditional forks a single function may spend before the
    /// oracle stops splitting paths (default: 99)
    pub max_forks_per_function: u32,
}

impl Default for AnalysisLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 2,
            max_graph_size: 200_000,
            max_consecutive_noops: 1000,
            max_construction_time: Duration::from_secs(10),
            max_conditions: 1000,
            max_evaluation_time: Duration::from_secs(10),
            max_forks_per_function: 99,
        }
    }
}

impl AnalysisLimits {
    /// Creates a configuration with no inlining, for callers that only care
    /// about the dataflow of a single function body
    #[must_use]
    pub fn shallow() -> Self {
        Self {
            max_call_depth: 0,
            ..Self::default()
        }
    }
}
