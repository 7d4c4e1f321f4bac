// src/core/strategy.rs

//! Placement strategies: pick a node for a process.
//!
//! Candidates are the RUNNING nodes allowed by the process rules, presented
//! in declared configuration order with their current loading. A node only
//! qualifies when the process's expected loading still fits its 100-point
//! budget; when none does, the strategy yields nothing and the caller
//! decides what the refusal means.

use crate::core::rules::StartStrategy;

/// One eligible node with its current loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node: String,
    pub loading: u32,
}

/// Applies the strategy over candidates in declared order.
pub fn choose_node(
    strategy: StartStrategy,
    candidates: &[Candidate],
    expected_loading: u32,
) -> Option<String> {
    let fits = |c: &&Candidate| c.loading + expected_loading <= 100;
    match strategy {
        StartStrategy::Config => candidates.iter().find(fits).map(|c| c.node.clone()),
        StartStrategy::LessLoaded => candidates
            .iter()
            .filter(fits)
            // Strict comparison keeps the first declared node on ties.
            .reduce(|best, c| if c.loading < best.loading { c } else { best })
            .map(|c| c.node.clone()),
        StartStrategy::MostLoaded => candidates
            .iter()
            .filter(fits)
            .reduce(|best, c| if c.loading > best.loading { c } else { best })
            .map(|c| c.node.clone()),
    }
}
