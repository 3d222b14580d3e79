//! Analysis configuration.
//!
//! Every field has a default, so a partial JSON document (or none at all)
//! yields a usable configuration.

use labtrace_core::DeckTopology;
use serde::{Deserialize, Serialize};

/// Limits on how far the tracer expands a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerLimits {
    /// Nested undecidable branches traced before marking the rest
    /// unanalyzed.
    pub max_branch_depth: usize,
    /// Nested helper-function expansions.
    pub max_call_depth: usize,
}

impl Default for TracerLimits {
    fn default() -> Self {
        TracerLimits {
            max_branch_depth: 4,
            max_call_depth: 8,
        }
    }
}

/// Failure-mode search settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureSearchConfig {
    /// Candidates simulated at most; 4096 covers 12 boolean variables.
    pub max_candidates: usize,
    /// Skip candidates whose outcome is already determined by the read
    /// footprint of an earlier candidate.
    pub pruning: bool,
}

impl Default for FailureSearchConfig {
    fn default() -> Self {
        FailureSearchConfig {
            max_candidates: 4096,
            pruning: true,
        }
    }
}

/// Exact-tier sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExactConfig {
    /// Concrete assignments tried per analysis, boundaries included.
    pub samples: usize,
    /// PRNG seed; fixed so repeated analyses agree.
    pub seed: u64,
}

impl Default for ExactConfig {
    fn default() -> Self {
        ExactConfig {
            samples: 16,
            seed: 0x1AB7_12AC,
        }
    }
}

/// Top-level analysis configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub topology: DeckTopology,
    pub tracer: TracerLimits,
    pub failure: FailureSearchConfig,
    pub exact: ExactConfig,
    /// Loop iterations replayed before scaling quantities to the full count.
    pub loop_replays: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            topology: DeckTopology::default(),
            tracer: TracerLimits::default(),
            failure: FailureSearchConfig::default(),
            exact: ExactConfig::default(),
            loop_replays: 2,
        }
    }
}

impl AnalysisConfig {
    pub fn with_topology(mut self, topology: DeckTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Replays used for a loop; at least one.
    pub(crate) fn replays(&self) -> u64 {
        self.loop_replays.max(1)
    }
}
