//! Failure-mode search over deviating initial states.
//!
//! Each boolean variable is an initial fact the main presence run read:
//! whether a placement root is on the deck, whether a source has content,
//! whether a machine starts with tips. The baseline is the assumed-ready
//! setup; candidates flip variables away from it, fewest flips first, and
//! each candidate replays the presence level until the first violation.
//!
//! A replay depends only on the initial facts it reads, so a candidate
//! that agrees with an earlier one on every fact that run read reuses its
//! result without simulating.

use std::collections::{BTreeMap, BTreeSet};

use labtrace_core::{
    AnalysisWarning, FailureModeSummary, OperationId, ProtocolComputationGraph, ResourceKind, StateFact, WarningKind,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::FailureSearchConfig;
use crate::contracts::Subject;
use crate::simulator::{FactKey, HierarchicalSimulator, SimulationReport, StateViolation};

/// Initial facts that differ from the baseline.
pub type Deviation = BTreeMap<FactKey, bool>;

/// One candidate and the operation it fails at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailurePair {
    pub deviation: Deviation,
    pub operation: OperationId,
    pub fact: StateFact,
}

/// A deduplicated failure: the first candidate reaching a given
/// (operation, fact) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureMode {
    pub condition: String,
    pub deviation: Deviation,
    pub violation: StateViolation,
}

impl FailureMode {
    pub fn summary(&self, graph: &ProtocolComputationGraph) -> FailureModeSummary {
        let violation = self.violation.summary(graph);
        FailureModeSummary {
            condition: self.condition.clone(),
            failing_operation: violation.operation,
            operation_name: violation.operation_name,
            position: violation.position,
            message: violation.message,
            suggested_fix: violation.suggested_fix,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureSearch {
    pub pairs: Vec<FailurePair>,
    pub modes: Vec<FailureMode>,
    pub simulated: usize,
    pub pruned: usize,
    /// The candidate cap cut the enumeration short.
    pub truncated: bool,
    pub warnings: Vec<AnalysisWarning>,
}

impl FailureSearch {
    /// The set of (candidate, failing operation) pairs.
    pub fn pair_set(&self) -> BTreeSet<(Vec<(FactKey, bool)>, OperationId)> {
        self.pairs
            .iter()
            .map(|p| (p.deviation.iter().map(|(k, v)| (*k, *v)).collect(), p.operation))
            .collect()
    }
}

pub struct FailureModeDetector<'a> {
    simulator: &'a HierarchicalSimulator<'a>,
    config: FailureSearchConfig,
}

struct Outcome {
    reads: BTreeMap<FactKey, bool>,
    first: Option<StateViolation>,
}

impl<'a> FailureModeDetector<'a> {
    pub fn new(simulator: &'a HierarchicalSimulator<'a>, config: FailureSearchConfig) -> Self {
        FailureModeDetector { simulator, config }
    }

    /// Searchable variables: facts the main presence run read from the
    /// initial state.
    pub fn variables(report: &SimulationReport) -> Vec<FactKey> {
        report
            .footprint
            .keys()
            .copied()
            .filter(|k| matches!(k, FactKey::OnDeck(_) | FactKey::Content(_) | FactKey::TipsLoaded(_)))
            .collect()
    }

    pub fn search(&self, graph: &ProtocolComputationGraph, report: &SimulationReport) -> FailureSearch {
        let variables = Self::variables(report);
        let main: BTreeSet<(OperationId, StateFact)> = report.violations().map(|v| (v.operation, v.fact)).collect();

        let mut out = FailureSearch::default();
        let mut done: Vec<Outcome> = Vec::new();
        let mut seen = BTreeSet::new();

        let (candidates, truncated) = candidates(&variables, self.config.max_candidates);
        if truncated {
            out.truncated = true;
            out.warnings.push(AnalysisWarning {
                kind: WarningKind::CandidateCap,
                message: format!(
                    "{} initial facts give more than {} candidate states; only the first were searched",
                    variables.len(),
                    self.config.max_candidates
                ),
                position: None,
            });
        }

        for flipped in candidates {
            let deviation: Deviation = flipped.iter().map(|k| (*k, !k.default_value())).collect();
            let value = |k: &FactKey| deviation.get(k).copied().unwrap_or_else(|| k.default_value());

            let reused = if self.config.pruning {
                done.iter().position(|o| o.reads.iter().all(|(k, v)| value(k) == *v))
            } else {
                None
            };
            let index = match reused {
                Some(i) => {
                    out.pruned += 1;
                    i
                }
                None => {
                    let run = self.simulator.search(graph, &deviation);
                    out.simulated += 1;
                    done.push(Outcome { reads: run.reads, first: run.first });
                    done.len() - 1
                }
            };

            let Some(violation) = &done[index].first else {
                continue;
            };
            out.pairs.push(FailurePair {
                deviation: deviation.clone(),
                operation: violation.operation,
                fact: violation.fact,
            });
            let key = (violation.operation, violation.fact);
            if main.contains(&key) || !seen.insert(key) {
                continue;
            }
            out.modes.push(FailureMode {
                condition: describe(graph, &deviation),
                deviation,
                violation: violation.clone(),
            });
        }

        info!(
            procedure = %graph.procedure,
            variables = variables.len(),
            simulated = out.simulated,
            pruned = out.pruned,
            modes = out.modes.len(),
            "failure search finished"
        );
        out
    }
}

/// Subsets of `variables` in order of size, then lexicographically, at
/// most `cap` of them. The flag is set when the cap cut enumeration short.
fn candidates(variables: &[FactKey], cap: usize) -> (Vec<Vec<FactKey>>, bool) {
    let n = variables.len();
    let mut out = Vec::new();
    for size in 0..=n {
        let mut idx: Vec<usize> = (0..size).collect();
        loop {
            if out.len() == cap {
                debug!(cap, "candidate cap reached");
                return (out, true);
            }
            out.push(idx.iter().map(|i| variables[*i]).collect());
            // Advance to the next combination of `size` indices.
            let Some(pos) = (0..size).rev().find(|&i| idx[i] != i + n - size) else {
                break;
            };
            idx[pos] += 1;
            for j in pos + 1..size {
                idx[j] = idx[j - 1] + 1;
            }
        }
    }
    (out, false)
}

/// Human-readable candidate condition.
fn describe(graph: &ProtocolComputationGraph, deviation: &Deviation) -> String {
    if deviation.is_empty() {
        return "the assumed initial setup".to_string();
    }
    deviation
        .iter()
        .map(|(key, value)| {
            let subject = Subject::of(graph, key.resource());
            match (key, value) {
                (FactKey::OnDeck(_), false) => format!("{subject} is not on the deck"),
                (FactKey::Content(_), false) if holds_tips(&subject) => format!("{subject} has no tips"),
                (FactKey::Content(_), false) => format!("{subject} is empty"),
                (FactKey::Capacity(_), false) => format!("{subject} is full"),
                (FactKey::TipsLoaded(_), true) => format!("{subject} starts with tips loaded"),
                (FactKey::Holding(_), true) => format!("{subject} starts holding liquid"),
                (key, value) => format!("{subject} {key:?} = {value}"),
            }
        })
        .collect::<Vec<_>>()
        .join(" and ")
}

fn holds_tips(subject: &Subject) -> bool {
    matches!(subject.kind, Some(ResourceKind::TipRack | ResourceKind::TipSpot | ResourceKind::Tip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use labtrace_core::ResourceId;

    fn vars(n: u32) -> Vec<FactKey> {
        (0..n).map(|i| FactKey::OnDeck(ResourceId(i))).collect()
    }

    #[test]
    fn candidates_grow_by_deviation_count() {
        let (all, truncated) = candidates(&vars(3), 100);
        assert!(!truncated);
        assert_eq!(all.len(), 8);
        assert!(all[0].is_empty());
        assert_eq!(all[1..4].iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 1, 1]);
        assert_eq!(all[7].len(), 3);
        let sizes: Vec<usize> = all.iter().map(Vec::len).collect();
        let mut sorted = sizes.clone();
        sorted.sort();
        assert_eq!(sizes, sorted);
    }

    #[test]
    fn candidates_are_distinct() {
        let (all, _) = candidates(&vars(5), 1000);
        let unique: BTreeSet<_> = all.iter().cloned().collect();
        assert_eq!(unique.len(), 32);
    }

    #[test]
    fn cap_truncates() {
        let (all, truncated) = candidates(&vars(4), 5);
        assert!(truncated);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn no_variables_gives_only_the_baseline() {
        let (all, truncated) = candidates(&[], 10);
        assert!(!truncated);
        assert_eq!(all, vec![Vec::<FactKey>::new()]);
    }
}
