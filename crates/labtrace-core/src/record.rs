//! The serializable analysis record handed to the persistence layer.
//!
//! Only summaries survive here: the computation graph, inferred
//! requirements, failure-mode summaries, violations and warnings. Simulation
//! states never leave a single analysis run.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::fact::StateFact;
use crate::graph::ProtocolComputationGraph;
use crate::hierarchy::ResourceChain;
use crate::id::OperationId;
use crate::kind::ResourceKind;
use crate::node::SourcePosition;

/// Unit of an inferred quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantityUnit {
    Microliters,
    Items,
}

/// A minimum quantity a resource must start with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub amount: f64,
    pub unit: QuantityUnit,
}

/// What one placement root must satisfy before the procedure runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredRequirement {
    /// Name of the placement root (usually a parameter name).
    pub resource: String,
    pub kind: Option<ResourceKind>,
    /// Required ancestor chain, nearest first.
    pub required_chain: ResourceChain,
    /// Facts the physical setup must provide, sorted.
    pub facts: Vec<StateFact>,
    /// Minimum starting content per item, when derivable.
    pub quantity: Option<Quantity>,
    /// Derived resources the facts were inferred on (`source["A1"]`).
    pub details: Vec<String>,
}

/// A machine's required starting state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRequirement {
    pub machine: String,
    /// The procedure picks up tips before any other tip use, so the
    /// machine must start with its channels empty.
    pub tips_empty: bool,
}

/// Precision level a result was produced at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationLevel {
    Structural,
    Boolean,
    Symbolic,
    Exact,
}

impl std::fmt::Display for SimulationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SimulationLevel::Structural => "structural",
            SimulationLevel::Boolean => "boolean",
            SimulationLevel::Symbolic => "symbolic",
            SimulationLevel::Exact => "exact",
        };
        f.write_str(s)
    }
}

/// A precondition violation found by the main simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationSummary {
    pub level: SimulationLevel,
    pub operation: OperationId,
    pub operation_name: String,
    pub position: SourcePosition,
    pub message: String,
    pub suggested_fix: String,
}

/// One deduplicated failure mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureModeSummary {
    /// Which initial-state deviations trigger it.
    pub condition: String,
    pub failing_operation: OperationId,
    pub operation_name: String,
    pub position: SourcePosition,
    pub message: String,
    pub suggested_fix: String,
}

/// The call that made the procedure unanalyzable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralFailure {
    pub message: String,
    /// Source text of the offending call.
    pub call: String,
    pub position: SourcePosition,
}

/// Overall outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Analyzable {
        failure_conditions: usize,
        /// Highest level the main run reached without violations.
        verified_level: Option<SimulationLevel>,
    },
    CannotAnalyze { errors: Vec<StructuralFailure> },
}

/// Category of a non-fatal analysis warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    UnboundedLoop,
    UnanalyzedBranch,
    UnmodeledOperation,
    SkippedConstruct,
    CandidateCap,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnalysisWarning {
    pub kind: WarningKind,
    pub message: String,
    pub position: Option<SourcePosition>,
}

/// Everything the analysis produces for one procedure version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub procedure: String,
    pub content_hash: String,
    pub simulation_version: String,
    pub outcome: AnalysisOutcome,
    pub computation_graph: ProtocolComputationGraph,
    pub inferred_requirements: Vec<InferredRequirement>,
    pub machine_requirements: Vec<MachineRequirement>,
    pub failure_modes: Vec<FailureModeSummary>,
    pub violations: Vec<ViolationSummary>,
    pub warnings: Vec<AnalysisWarning>,
}

impl AnalysisRecord {
    pub fn is_analyzable(&self) -> bool {
        matches!(self.outcome, AnalysisOutcome::Analyzable { .. })
    }

    /// User-facing summary text.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        match &self.outcome {
            AnalysisOutcome::CannotAnalyze { errors } => {
                let _ = writeln!(out, "{}: cannot be analyzed", self.procedure);
                for e in errors {
                    let _ = writeln!(out, "  structural error at {}: {} (in `{}`)", e.position, e.message, e.call);
                }
            }
            AnalysisOutcome::Analyzable { failure_conditions, .. } => {
                let _ = writeln!(
                    out,
                    "{}: analyzable, {} potential failure condition{} found",
                    self.procedure,
                    failure_conditions,
                    if *failure_conditions == 1 { "" } else { "s" }
                );
                for v in &self.violations {
                    let _ = writeln!(
                        out,
                        "  [{}] {} at {}: {} (fix: {})",
                        v.level, v.operation_name, v.position, v.message, v.suggested_fix
                    );
                }
                for m in &self.failure_modes {
                    let _ = writeln!(
                        out,
                        "  if {}: {} at {} fails: {} (fix: {})",
                        m.condition, m.operation_name, m.position, m.message, m.suggested_fix
                    );
                }
            }
        }
        for w in &self.warnings {
            let _ = writeln!(out, "  warning: {}", w.message);
        }
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
