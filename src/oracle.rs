//! Fork-policy decisions for conditional branches.
//!
//! When a path reaches a conditional branch it asks the function's
//! [`PathOracle`] whether to follow one side or fork and follow both. The
//! oracle shares a fork budget across every path of the function, so heavily
//! branching code degrades to single-sided exploration instead of exploding.
//! Each path carries its own [`Backlog`] of decisions already taken at each
//! branch address, which is how loops are walked a bounded number of times
//! and then exited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::config::AnalysisLimits;

/// Number of times a path revisits a branch before the oracle forces the
/// opposite side of its first decision.
const LOOP_PATIENCE: usize = 4;

/// Direction to take at a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPolicy {
    /// Follow only the path on which the condition holds
    TakeTrue,
    /// Follow only the path on which the condition fails
    TakeFalse,
    /// Fork and follow both sides
    TakeBoth,
}

impl ForkPolicy {
    fn single(decision: bool) -> ForkPolicy {
        if decision {
            ForkPolicy::TakeTrue
        } else {
            ForkPolicy::TakeFalse
        }
    }
}

/// Per-path record of branch decisions, keyed by branch address.
///
/// Forking a path clones the backlog, after which each side records its own
/// decision at the fork address.
#[derive(Debug, Clone, Default)]
pub struct Backlog {
    decisions: HashMap<u32, Vec<bool>>,
}

impl Backlog {
    /// Creates an empty backlog.
    #[must_use]
    pub fn new() -> Backlog {
        Backlog::default()
    }

    /// Records the decision taken at a branch address.
    pub fn record(&mut self, address: u32, decision: bool) {
        self.decisions.entry(address).or_default().push(decision);
    }

    /// Decisions previously taken at a branch address, oldest first.
    #[must_use]
    pub fn decisions(&self, address: u32) -> &[bool] {
        self.decisions
            .get(&address)
            .map_or(&[], |log| log.as_slice())
    }

    /// Whether the path has passed this branch before.
    #[must_use]
    pub fn contains(&self, address: u32) -> bool {
        self.decisions.contains_key(&address)
    }

    /// The first decision taken at a branch address.
    #[must_use]
    pub fn first(&self, address: u32) -> Option<bool> {
        self.decisions(address).first().copied()
    }

    /// The most recent decision taken at a branch address.
    #[must_use]
    pub fn last(&self, address: u32) -> Option<bool> {
        self.decisions(address).last().copied()
    }

    /// Number of times the path has passed a branch address.
    #[must_use]
    pub fn visits(&self, address: u32) -> usize {
        self.decisions(address).len()
    }
}

/// Shared fork-policy state for all paths of one analyzed function.
#[derive(Debug)]
pub struct PathOracle {
    sites: DashSet<u32>,
    primed: AtomicBool,
    budget: AtomicU32,
}

impl PathOracle {
    /// Creates an oracle with the fork budget from the given limits.
    #[must_use]
    pub fn new(limits: &AnalysisLimits) -> PathOracle {
        PathOracle {
            sites: DashSet::new(),
            primed: AtomicBool::new(false),
            budget: AtomicU32::new(limits.max_forks_per_function),
        }
    }

    /// Decides the fork policy for a branch.
    ///
    /// A branch the path has already passed is a loop: the first few
    /// revisits repeat the original decision, and once the revisit count
    /// reaches the patience threshold the opposite side is forced so the
    /// loop exits. A branch new to the path forks both sides while the
    /// shared budget lasts; the very first branch of the function is free.
    pub fn should_fork(&self, address: u32, backlog: &Backlog) -> ForkPolicy {
        let past = backlog.decisions(address);
        if let Some(first) = past.first() {
            return if past.len() >= LOOP_PATIENCE {
                ForkPolicy::single(!first)
            } else {
                ForkPolicy::single(*first)
            };
        }

        self.sites.insert(address);
        if !self.primed.swap(true, Ordering::Relaxed) {
            return ForkPolicy::TakeBoth;
        }
        if self.consume_budget() {
            ForkPolicy::TakeBoth
        } else {
            ForkPolicy::TakeFalse
        }
    }

    /// Number of distinct branch sites seen so far.
    #[must_use]
    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Remaining fork budget.
    #[must_use]
    pub fn remaining_budget(&self) -> u32 {
        self.budget.load(Ordering::Relaxed)
    }

    fn consume_budget(&self) -> bool {
        self.budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

/// Oracles for every function under analysis, keyed by function start.
///
/// All paths of one function, across worker threads, resolve to the same
/// oracle and therefore share its fork budget.
#[derive(Debug, Default)]
pub struct OracleRegistry {
    oracles: DashMap<u32, Arc<PathOracle>>,
}

impl OracleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> OracleRegistry {
        OracleRegistry::default()
    }

    /// The oracle for a function, created on first use.
    #[must_use]
    pub fn oracle(&self, function: u32, limits: &AnalysisLimits) -> Arc<PathOracle> {
        self.oracles
            .entry(function)
            .or_insert_with(|| Arc::new(PathOracle::new(limits)))
            .clone()
    }
}
