//! Hierarchical state simulator.
//!
//! Replays a computation graph at increasing precision: a structural pass
//! against the contract table, then presence flags, then linear symbolic
//! quantities, then concrete values for the edge cases the symbolic pass
//! flags. Each level runs only if the previous one found nothing, and the
//! structural pass short-circuits everything on failure.
//!
//! All three replay levels share one [`Replayer`]; they differ only in the
//! [`AbstractState`] they carry. Presence facts live in a [`BooleanState`]
//! embedded in every state, so promoting a state never loses them.

mod boolean;
mod exact;
mod replay;
mod structural;
mod symbolic;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use labtrace_core::{
    AnalysisWarning, OperationId, ProtocolComputationGraph, ResourceCatalog, ResourceId, ResourceKind,
    ResourceOrigin, SimulationLevel, StateFact, StatePrecondition, StructuralFailure, ViolationSummary,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::bounds::{BoundsAnalyzer, LoopBound};
use crate::config::{AnalysisConfig, ExactConfig};
use crate::contracts::{ContractDatabase, MethodEntry, Subject};
use crate::error::CheckError;

pub use boolean::{Assumption, BooleanState, FactKey};
pub use exact::{Assignment, ExactState};
pub use structural::check_structure;
pub use symbolic::{ConstraintOrigin, Domain, Interval, LinExpr, SymbolKey, SymbolicState};

pub(crate) use replay::{Replayer, RunMode};

// ---------------------------------------------------------------------------
// Violations and reports
// ---------------------------------------------------------------------------

/// One precondition that did not hold during a replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateViolation {
    pub level: SimulationLevel,
    pub operation: OperationId,
    pub fact: StateFact,
    pub resource: ResourceId,
    pub message: String,
    pub suggested_fix: String,
}

impl StateViolation {
    pub fn summary(&self, graph: &ProtocolComputationGraph) -> ViolationSummary {
        let op = graph.operation(self.operation);
        ViolationSummary {
            level: self.level,
            operation: self.operation,
            operation_name: op.map(|o| o.name.clone()).unwrap_or_default(),
            position: op.map(|o| o.position).unwrap_or_default(),
            message: self.message.clone(),
            suggested_fix: self.suggested_fix.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelReport {
    pub level: SimulationLevel,
    pub violations: Vec<StateViolation>,
}

/// Everything one simulation produces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub structural: Vec<StructuralFailure>,
    /// Levels that ran, in order; the first is always structural.
    pub levels: Vec<LevelReport>,
    /// Preconditions checked by the presence run, deduplicated.
    pub preconditions: Vec<StatePrecondition>,
    /// Environment facts the presence run took from the initial state.
    pub assumptions: BTreeSet<Assumption>,
    /// Initial-state facts the presence run read, with the values seen.
    pub footprint: BTreeMap<FactKey, bool>,
    /// Least per-item starting quantity, by placement root.
    pub minimum_quantities: BTreeMap<ResourceId, f64>,
    pub edge_cases: Vec<ConstraintOrigin>,
    pub warnings: Vec<AnalysisWarning>,
}

impl SimulationReport {
    pub fn violations(&self) -> impl Iterator<Item = &StateViolation> {
        self.levels.iter().flat_map(|l| l.violations.iter())
    }

    pub fn is_structurally_valid(&self) -> bool {
        self.structural.is_empty()
    }

    /// Highest level reached with no violations at it or below.
    pub fn verified_level(&self) -> Option<SimulationLevel> {
        if !self.is_structurally_valid() {
            return None;
        }
        let mut verified = None;
        for level in &self.levels {
            if !level.violations.is_empty() {
                break;
            }
            verified = Some(level.level);
        }
        verified
    }
}

// ---------------------------------------------------------------------------
// Shared replay context
// ---------------------------------------------------------------------------

/// Read-only inputs of one replay.
pub(crate) struct Context<'a> {
    pub graph: &'a ProtocolComputationGraph,
    pub catalog: &'a ResourceCatalog,
    pub contracts: &'a ContractDatabase,
    pub bounds: BoundsAnalyzer<'a>,
    pub replays: u64,
}

impl<'a> Context<'a> {
    pub fn new(
        graph: &'a ProtocolComputationGraph,
        catalog: &'a ResourceCatalog,
        contracts: &'a ContractDatabase,
        replays: u64,
    ) -> Self {
        Context { graph, catalog, contracts, bounds: BoundsAnalyzer::new(graph, catalog), replays }
    }

    /// The top of a resource's lineage.
    pub fn top(&self, id: ResourceId) -> ResourceId {
        self.graph.lineage(id).last().copied().unwrap_or(id)
    }

    /// Grouped values expand to their members; everything else is itself.
    pub fn members(&self, id: ResourceId) -> Vec<ResourceId> {
        match self.graph.resource(id).map(|r| &r.origin) {
            Some(ResourceOrigin::Grouped { members }) => {
                members.iter().flat_map(|m| self.members(*m)).collect()
            }
            _ => vec![id],
        }
    }

    /// Placement roots that must be physically placed: parameters other
    /// than machines and decks.
    pub fn placeable_roots(&self, id: ResourceId) -> Vec<ResourceId> {
        self.graph
            .placement_roots(id)
            .into_iter()
            .filter(|root| {
                self.graph.resource(*root).is_some_and(|node| {
                    matches!(node.origin, ResourceOrigin::Parameter { .. })
                        && !node
                            .placement_kind()
                            .is_some_and(|k| k.is_machine() || k == ResourceKind::Deck)
                })
            })
            .collect()
    }

    /// Per-item volume of the labware a resource lives in.
    pub fn capacity(&self, id: ResourceId) -> Option<f64> {
        let top = self.top(id);
        let node = self.graph.resource(top)?;
        let labware = match node.kind() {
            Some(kind) if kind.item_kind().is_some() => Some(kind),
            _ => node.chain.first().copied(),
        };
        self.catalog.item_volume(labware, Some(node.name.as_str()))
    }

    /// True when the resource is reached through a runtime subscript, so
    /// each loop iteration may address a different item.
    pub fn is_indeterminate(&self, id: ResourceId) -> bool {
        self.graph.lineage(id).into_iter().any(|r| {
            matches!(
                self.graph.resource(r).map(|n| &n.origin),
                Some(ResourceOrigin::Derived {
                    access: labtrace_core::Access::Subscript { key: labtrace_core::AccessKey::Dynamic(_) },
                    ..
                })
            )
        })
    }

    /// Resources whose state does not carry across iterations of `op`.
    pub fn iteration_locals(&self, scoped: &[ResourceId]) -> BTreeSet<ResourceId> {
        let mut locals: BTreeSet<ResourceId> = scoped.iter().copied().collect();
        for node in self.graph.resources() {
            if self.is_indeterminate(node.id) {
                locals.insert(node.id);
            }
        }
        locals
    }

    pub fn entry(&self, op: OperationId) -> Option<&'a MethodEntry> {
        let node = self.graph.operation(op)?;
        let receiver = self.graph.resource(node.receiver?)?;
        self.contracts.resolve(&receiver.declared, &node.name)
    }

    pub fn subject(&self, id: ResourceId) -> Subject {
        Subject::of(self.graph, id)
    }

    pub fn loop_bound(&self, op: OperationId) -> LoopBound {
        self.bounds.loop_bound(op)
    }
}

// ---------------------------------------------------------------------------
// Abstract states
// ---------------------------------------------------------------------------

/// A volume argument as bound in the graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum VolumeValue {
    Known(f64),
    Runtime,
    Absent,
}

/// A quantity precondition to check.
#[derive(Debug, Clone)]
pub(crate) enum QuantityCheck<A> {
    Content { resource: ResourceId, amount: A },
    Capacity { resource: ResourceId, amount: A },
    TipVolume { machine: ResourceId, amount: A },
    Held { machine: ResourceId, amount: A },
}

impl<A> QuantityCheck<A> {
    pub fn fact(&self) -> StateFact {
        match self {
            QuantityCheck::Content { .. } => StateFact::SufficientContent,
            QuantityCheck::Capacity { .. } => StateFact::WithinCapacity,
            QuantityCheck::TipVolume { .. } => StateFact::WithinTipVolume,
            QuantityCheck::Held { .. } => StateFact::SufficientHeld,
        }
    }

    pub fn resource(&self) -> ResourceId {
        match self {
            QuantityCheck::Content { resource, .. } | QuantityCheck::Capacity { resource, .. } => *resource,
            QuantityCheck::TipVolume { machine, .. } | QuantityCheck::Held { machine, .. } => *machine,
        }
    }
}

/// A quantity state change.
#[derive(Debug, Clone)]
pub(crate) enum QuantityChange<A> {
    Withdraw { resource: ResourceId, amount: A },
    Deposit { resource: ResourceId, amount: A },
    /// Liquid enters the machine's tips.
    Draw { machine: ResourceId, amount: A },
    /// Liquid leaves the machine's tips.
    Release { machine: ResourceId, amount: A },
    LoadTips { machine: ResourceId, capacity: Option<f64> },
    ClearTips { machine: ResourceId },
}

/// A quantity precondition that cannot hold.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QuantityFailure {
    pub operation: OperationId,
    pub fact: StateFact,
    pub resource: ResourceId,
    pub detail: String,
}

/// One simulation level's state.
pub(crate) trait AbstractState: Clone + fmt::Debug {
    type Amount: Clone + fmt::Debug;
    const LEVEL: SimulationLevel;

    fn presence(&self) -> &BooleanState;
    fn presence_mut(&mut self) -> &mut BooleanState;

    fn volume(&mut self, ctx: &Context<'_>, op: OperationId, value: VolumeValue) -> Option<Self::Amount>;
    fn check(&mut self, ctx: &Context<'_>, op: OperationId, check: QuantityCheck<Self::Amount>) -> Option<QuantityFailure>;
    fn apply(&mut self, ctx: &Context<'_>, op: OperationId, change: QuantityChange<Self::Amount>);

    /// Forgets everything known about `resources`.
    fn reset(&mut self, resources: &BTreeSet<ResourceId>);

    /// Carries a loop element's final state onto its collection.
    fn merge_element(&mut self, element: ResourceId, collection: ResourceId);

    /// Extrapolates per-iteration quantity changes over the iterations
    /// that were not replayed. Resources in `unscaled` keep their value.
    fn scale_loop(
        &mut self,
        ctx: &Context<'_>,
        op: OperationId,
        previous: &Self,
        bound: &LoopBound,
        replayed: u64,
        unscaled: &BTreeSet<ResourceId>,
    ) -> Vec<QuantityFailure>;

    /// Merges the states at the end of both arms of a branch.
    fn join(self, other: Self, ctx: &Context<'_>, op: OperationId) -> (Self, Vec<QuantityFailure>);
}

/// A state at any level, for callers that move between levels.
#[derive(Debug, Clone)]
pub enum SimulationState {
    Boolean(BooleanState),
    Symbolic(SymbolicState),
    Exact(ExactState),
}

impl SimulationState {
    pub fn level(&self) -> SimulationLevel {
        match self {
            SimulationState::Boolean(_) => SimulationLevel::Boolean,
            SimulationState::Symbolic(_) => SimulationLevel::Symbolic,
            SimulationState::Exact(_) => SimulationLevel::Exact,
        }
    }

    /// Lifts the state to a more precise level without losing presence
    /// facts. Moving down the ladder is an error.
    pub fn promote(&self, to: SimulationLevel) -> Result<SimulationState, CheckError> {
        let from = self.level();
        if to < from || to == SimulationLevel::Structural {
            return Err(CheckError::InvalidPromotion { from, to });
        }
        let promoted = match (self, to) {
            (state, level) if level == from => state.clone(),
            (SimulationState::Boolean(b), SimulationLevel::Symbolic) => {
                SimulationState::Symbolic(SymbolicState::from_presence(b.clone()))
            }
            (SimulationState::Boolean(b), _) => {
                let symbolic = SymbolicState::from_presence(b.clone());
                SimulationState::Exact(ExactState::from_symbolic(&symbolic))
            }
            (SimulationState::Symbolic(s), _) => SimulationState::Exact(ExactState::from_symbolic(s)),
            (SimulationState::Exact(_), level) => {
                return Err(CheckError::InvalidPromotion { from, to: level });
            }
        };
        Ok(promoted)
    }

    /// The presence facts of the state.
    pub fn to_boolean(&self) -> BooleanState {
        match self {
            SimulationState::Boolean(b) => b.clone(),
            SimulationState::Symbolic(s) => s.presence().clone(),
            SimulationState::Exact(e) => e.presence().clone(),
        }
    }
}

/// The final state and violations of one main-mode replay.
#[derive(Debug, Clone)]
pub struct LevelRun {
    pub state: SimulationState,
    pub violations: Vec<StateViolation>,
}

/// Result of one failure-search replay.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SearchRun {
    pub first: Option<StateViolation>,
    pub reads: BTreeMap<FactKey, bool>,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct HierarchicalSimulator<'a> {
    contracts: &'a ContractDatabase,
    catalog: &'a ResourceCatalog,
    config: &'a AnalysisConfig,
}

impl<'a> HierarchicalSimulator<'a> {
    pub fn new(contracts: &'a ContractDatabase, catalog: &'a ResourceCatalog, config: &'a AnalysisConfig) -> Self {
        HierarchicalSimulator { contracts, catalog, config }
    }

    fn context<'g>(&'g self, graph: &'g ProtocolComputationGraph) -> Context<'g> {
        Context::new(graph, self.catalog, self.contracts, self.config.replays())
    }

    pub fn simulate(&self, graph: &ProtocolComputationGraph) -> SimulationReport {
        let mut report = SimulationReport::default();

        let structural = check_structure(graph, self.contracts);
        report.levels.push(LevelReport { level: SimulationLevel::Structural, violations: Vec::new() });
        if !structural.is_empty() {
            info!(procedure = %graph.procedure, errors = structural.len(), "structural check failed");
            report.structural = structural;
            return report;
        }

        let ctx = self.context(graph);

        // Presence flags.
        let mut replayer = Replayer::new(&ctx, RunMode::Main);
        let mut boolean = BooleanState::new();
        replayer.run(&mut boolean);
        let outcome = replayer.finish();
        report.preconditions = outcome.preconditions;
        report.assumptions = outcome.assumptions;
        report.footprint = boolean.reads().clone();
        report.warnings.extend(outcome.warnings);
        let failed = !outcome.violations.is_empty();
        report.levels.push(LevelReport { level: SimulationLevel::Boolean, violations: outcome.violations });
        if failed {
            debug!(procedure = %graph.procedure, "presence violations; stopping before symbolic level");
            return finish(report);
        }

        // Linear quantities.
        let mut replayer = Replayer::new(&ctx, RunMode::Main);
        let mut symbolic = SymbolicState::from_presence(BooleanState::new());
        replayer.run(&mut symbolic);
        let outcome = replayer.finish();
        report.minimum_quantities = symbolic.minimum_initial_quantities();
        report.edge_cases = symbolic.edge_cases();
        let failed = !outcome.violations.is_empty();
        report.levels.push(LevelReport { level: SimulationLevel::Symbolic, violations: outcome.violations });
        if failed || report.edge_cases.is_empty() {
            return finish(report);
        }

        // Concrete values for flagged edge cases.
        let violations = self.exact_search(&ctx, &symbolic);
        report.levels.push(LevelReport { level: SimulationLevel::Exact, violations });
        finish(report)
    }

    /// Replays the graph once in main mode from `initial`.
    pub fn run_level(&self, graph: &ProtocolComputationGraph, initial: SimulationState) -> LevelRun {
        let ctx = self.context(graph);
        let mut replayer = Replayer::new(&ctx, RunMode::Main);
        let state = match initial {
            SimulationState::Boolean(mut s) => {
                replayer.run(&mut s);
                SimulationState::Boolean(s)
            }
            SimulationState::Symbolic(mut s) => {
                replayer.run(&mut s);
                SimulationState::Symbolic(s)
            }
            SimulationState::Exact(mut s) => {
                replayer.run(&mut s);
                SimulationState::Exact(s)
            }
        };
        LevelRun { state, violations: replayer.finish().violations }
    }

    /// Presence replay from the given initial facts, stopping at the first
    /// violation.
    pub(crate) fn search(&self, graph: &ProtocolComputationGraph, initial: &BTreeMap<FactKey, bool>) -> SearchRun {
        let ctx = self.context(graph);
        let mut replayer = Replayer::new(&ctx, RunMode::Search);
        let mut state = BooleanState::with_initial(initial.clone());
        replayer.run(&mut state);
        let first = replayer.finish().violations.into_iter().next();
        SearchRun { first, reads: state.reads().clone() }
    }

    fn exact_search(&self, ctx: &Context<'_>, symbolic: &SymbolicState) -> Vec<StateViolation> {
        let uncontrolled = symbolic.sampled_domains();
        for sample in sample_assignments(&uncontrolled, &self.config.exact) {
            let assignment = symbolic.minimal_assignment(&sample);
            let mut replayer = Replayer::new(ctx, RunMode::Main);
            let mut state = ExactState::new(BooleanState::new(), assignment);
            replayer.run(&mut state);
            let mut violations = replayer.finish().violations;
            if violations.is_empty() {
                continue;
            }
            if !sample.is_empty() {
                let when = sample
                    .iter()
                    .map(|(k, v)| format!("{k} = {v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                for v in &mut violations {
                    v.message = format!("{} when {when}", v.message);
                }
            }
            return violations;
        }
        Vec::new()
    }
}

fn finish(mut report: SimulationReport) -> SimulationReport {
    report.warnings.sort();
    report.warnings.dedup();
    report
}

/// Boundary assignments first (all low, all high, midpoint), then seeded
/// random points inside the domains.
fn sample_assignments(domains: &BTreeMap<SymbolKey, Interval>, config: &ExactConfig) -> Vec<Assignment> {
    if domains.is_empty() {
        return vec![Assignment::new()];
    }
    let finite = |i: &Interval| {
        let lo = if i.lo.is_finite() { i.lo } else { 0.0 };
        let hi = if i.hi.is_finite() { i.hi } else { lo + 1000.0 };
        (lo, hi.max(lo))
    };
    let settle = |key: &SymbolKey, v: f64| if key.is_count() { v.round() } else { v };

    let mut out = Vec::new();
    for pick in [0.0, 1.0, 0.5] {
        let sample = domains
            .iter()
            .map(|(k, i)| {
                let (lo, hi) = finite(i);
                (*k, settle(k, lo + (hi - lo) * pick))
            })
            .collect();
        out.push(sample);
    }
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    for _ in 3..config.samples.max(3) {
        let sample = domains
            .iter()
            .map(|(k, i)| {
                let (lo, hi) = finite(i);
                let v = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
                (*k, settle(k, v))
            })
            .collect();
        out.push(sample);
    }
    out
}
