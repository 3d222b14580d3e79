//! Graph replay shared by every simulation level.

use std::collections::BTreeSet;

use labtrace_core::{
    AnalysisWarning, BindingValue, NodeKind, OperationId, OperationNode, ResourceId, StateFact, StatePrecondition,
    WarningKind,
};
use tracing::{debug, trace};

use super::boolean::{Assumption, FactKey};
use super::{AbstractState, Context, QuantityChange, QuantityCheck, QuantityFailure, StateViolation, VolumeValue};
use crate::bounds::LoopBound;
use crate::contracts::{ArgRef, Effect, MethodContract, Precondition, Subject, TipSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunMode {
    /// Report every violation, repair the state and keep going.
    Main,
    /// Stop at the first violation.
    Search,
}

/// Raised to unwind the replay once a search run has its answer.
struct Halt;

pub(crate) struct RunOutcome {
    pub violations: Vec<StateViolation>,
    pub preconditions: Vec<StatePrecondition>,
    pub assumptions: BTreeSet<Assumption>,
    pub warnings: Vec<AnalysisWarning>,
}

pub(crate) struct Replayer<'c, 'g> {
    ctx: &'c Context<'g>,
    mode: RunMode,
    violations: Vec<StateViolation>,
    preconditions: BTreeSet<StatePrecondition>,
    assumptions: BTreeSet<Assumption>,
    warnings: BTreeSet<AnalysisWarning>,
}

impl<'c, 'g> Replayer<'c, 'g> {
    pub fn new(ctx: &'c Context<'g>, mode: RunMode) -> Self {
        Replayer {
            ctx,
            mode,
            violations: Vec::new(),
            preconditions: BTreeSet::new(),
            assumptions: BTreeSet::new(),
            warnings: BTreeSet::new(),
        }
    }

    pub fn run<S: AbstractState>(&mut self, state: &mut S) {
        let roots = self.ctx.graph.roots();
        if self.block(&roots, state).is_err() {
            trace!("replay halted at first violation");
        }
    }

    pub fn finish(self) -> RunOutcome {
        RunOutcome {
            violations: self.violations,
            preconditions: self.preconditions.into_iter().collect(),
            assumptions: self.assumptions,
            warnings: self.warnings.into_iter().collect(),
        }
    }

    fn block<S: AbstractState>(&mut self, ops: &[OperationId], state: &mut S) -> Result<(), Halt> {
        for id in ops {
            self.operation(*id, state)?;
        }
        Ok(())
    }

    fn operation<S: AbstractState>(&mut self, id: OperationId, state: &mut S) -> Result<(), Halt> {
        let Some(op) = self.ctx.graph.operation(id) else {
            return Ok(());
        };
        match &op.kind {
            NodeKind::Static | NodeKind::Dynamic => self.call(op, state),
            NodeKind::Foreach { collection, element, scoped, children, .. } => {
                self.foreach(op, *collection, *element, scoped, children, state)
            }
            NodeKind::Conditional { then_branch, else_branch, .. } => {
                // A halted arm still contributes its initial-fact reads.
                let mut then_state = state.clone();
                if let Err(halt) = self.block(then_branch, &mut then_state) {
                    state.presence_mut().absorb_reads(then_state.presence());
                    return Err(halt);
                }
                let mut else_state = state.clone();
                if let Err(halt) = self.block(else_branch, &mut else_state) {
                    state.presence_mut().absorb_reads(then_state.presence());
                    state.presence_mut().absorb_reads(else_state.presence());
                    return Err(halt);
                }
                let (joined, failures) = then_state.join(else_state, self.ctx, op.id);
                *state = joined;
                self.quantity_failures::<S>(failures)
            }
            NodeKind::Unanalyzed { reason } => {
                if self.mode == RunMode::Main {
                    self.warnings.insert(AnalysisWarning {
                        kind: WarningKind::UnanalyzedBranch,
                        message: reason.clone(),
                        position: Some(op.position),
                    });
                }
                Ok(())
            }
        }
    }

    fn foreach<S: AbstractState>(
        &mut self,
        op: &OperationNode,
        collection: Option<ResourceId>,
        element: Option<ResourceId>,
        scoped: &[ResourceId],
        children: &[OperationId],
        state: &mut S,
    ) -> Result<(), Halt> {
        let bound = self.ctx.loop_bound(op.id);
        let iterations = match &bound {
            LoopBound::Exact(0) => {
                debug!(op = %op.id, "loop body never runs");
                return Ok(());
            }
            LoopBound::Exact(n) => (*n).min(self.ctx.replays),
            LoopBound::Unbounded { reason } => {
                if self.mode == RunMode::Main {
                    self.warnings.insert(AnalysisWarning {
                        kind: WarningKind::UnboundedLoop,
                        message: format!("{reason}; every element is assumed to be touched"),
                        position: Some(op.position),
                    });
                }
                self.ctx.replays
            }
        };

        let locals = self.ctx.iteration_locals(scoped);
        let mut previous = state.clone();
        for i in 0..iterations {
            if i > 0 {
                state.reset(&locals);
            }
            previous = state.clone();
            self.block(children, state)?;
        }
        // Every item of the collection takes one iteration's change only.
        let mut unscaled = locals.clone();
        if let (Some(c), Some(e)) = (collection, element) {
            state.merge_element(e, c);
            unscaled.insert(c);
        }
        let failures = state.scale_loop(self.ctx, op.id, &previous, &bound, iterations, &unscaled);
        state.reset(&locals);
        self.quantity_failures::<S>(failures)
    }

    fn call<S: AbstractState>(&mut self, op: &OperationNode, state: &mut S) -> Result<(), Halt> {
        let Some(entry) = self.ctx.entry(op.id) else {
            return Ok(());
        };
        let Some(contract) = &entry.contract else {
            if self.mode == RunMode::Main {
                self.warnings.insert(AnalysisWarning {
                    kind: WarningKind::UnmodeledOperation,
                    message: format!("`{}` on {} is not modeled; treated as a no-op", op.name, entry.receiver),
                    position: Some(op.position),
                });
            }
            return Ok(());
        };
        let Some(machine) = op.receiver else {
            return Ok(());
        };

        for pre in &contract.preconditions {
            if pre.is_presence() {
                self.presence(op, machine, contract, pre, state)?;
            } else {
                self.quantity(op, machine, contract, pre, state)?;
            }
        }
        for effect in &contract.effects {
            self.effect(op, machine, effect, state);
        }
        Ok(())
    }

    fn resource_arg(op: &OperationNode, arg: ArgRef) -> Option<ResourceId> {
        match op.argument(arg.name, arg.index)?.value {
            BindingValue::Resource(id) => Some(id),
            _ => None,
        }
    }

    fn volume_arg(op: &OperationNode, arg: ArgRef) -> VolumeValue {
        let Some(binding) = op.argument(arg.name, arg.index) else {
            return VolumeValue::Absent;
        };
        match &binding.value {
            BindingValue::Literal(lit) => match lit.as_volumes() {
                Some(vols) if !vols.is_empty() => VolumeValue::Known(vols.into_iter().fold(0.0, f64::max)),
                _ => VolumeValue::Absent,
            },
            BindingValue::Resource(_) | BindingValue::Dynamic { .. } => VolumeValue::Runtime,
        }
    }

    fn presence<S: AbstractState>(
        &mut self,
        op: &OperationNode,
        machine: ResourceId,
        contract: &MethodContract,
        pre: &Precondition,
        state: &mut S,
    ) -> Result<(), Halt> {
        let (key, resource, expected) = match pre {
            Precondition::TipsLoaded { expected } => (FactKey::TipsLoaded(machine), machine, *expected),
            Precondition::HoldingContent => (FactKey::Holding(machine), machine, true),
            Precondition::OnDeck { arg } => match Self::resource_arg(op, *arg) {
                Some(r) => (FactKey::OnDeck(r), r, true),
                None => return Ok(()),
            },
            Precondition::HasContent { arg } => match Self::resource_arg(op, *arg) {
                Some(r) => (FactKey::Content(r), r, true),
                None => return Ok(()),
            },
            Precondition::HasCapacity { arg } => match Self::resource_arg(op, *arg) {
                Some(r) => (FactKey::Capacity(r), r, true),
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        if let FactKey::OnDeck(r) = key {
            if self.ctx.placeable_roots(r).is_empty() {
                return Ok(());
            }
        }

        let fact = pre.fact();
        let look = state.presence_mut().lookup(self.ctx, key);
        let holds = look.value == Some(expected);
        self.preconditions.insert(StatePrecondition {
            resource,
            fact,
            required_by: op.id,
            satisfied_by: if holds { look.by } else { None },
        });
        if holds {
            if look.from_initial && look.by.is_none() {
                self.assumptions.insert(Assumption { resource, fact });
            }
            return Ok(());
        }

        let subject = match key {
            FactKey::OnDeck(r) => self.root_subject(r),
            _ => self.ctx.subject(resource),
        };
        let unknown = look.value.is_none();
        let mut message = format!("{subject} {fact}");
        if unknown {
            message.push_str(" on every branch");
        }
        self.report(StateViolation {
            level: S::LEVEL,
            operation: op.id,
            fact,
            resource,
            message,
            suggested_fix: contract.suggested_fix(pre, &subject),
        })?;
        state.presence_mut().set(self.ctx, key, Some(expected), None);
        Ok(())
    }

    fn quantity<S: AbstractState>(
        &mut self,
        op: &OperationNode,
        machine: ResourceId,
        contract: &MethodContract,
        pre: &Precondition,
        state: &mut S,
    ) -> Result<(), Halt> {
        let check = match pre {
            Precondition::SufficientContent { arg, volume } => {
                let (Some(resource), Some(amount)) = (Self::resource_arg(op, *arg), self.amount(op, *volume, state))
                else {
                    return Ok(());
                };
                QuantityCheck::Content { resource, amount }
            }
            Precondition::WithinCapacity { arg, volume } => {
                let (Some(resource), Some(amount)) = (Self::resource_arg(op, *arg), self.amount(op, *volume, state))
                else {
                    return Ok(());
                };
                QuantityCheck::Capacity { resource, amount }
            }
            Precondition::WithinTipVolume { volume } => {
                let Some(amount) = self.amount(op, *volume, state) else {
                    return Ok(());
                };
                QuantityCheck::TipVolume { machine, amount }
            }
            Precondition::SufficientHeld { volume } => {
                let Some(amount) = self.amount(op, *volume, state) else {
                    return Ok(());
                };
                QuantityCheck::Held { machine, amount }
            }
            _ => return Ok(()),
        };
        self.preconditions.insert(StatePrecondition {
            resource: check.resource(),
            fact: check.fact(),
            required_by: op.id,
            satisfied_by: None,
        });
        let Some(failure) = state.check(self.ctx, op.id, check) else {
            return Ok(());
        };
        let subject = self.ctx.subject(failure.resource);
        let violation = StateViolation {
            level: S::LEVEL,
            operation: op.id,
            fact: failure.fact,
            resource: failure.resource,
            message: format!("{subject} {} ({})", failure.fact, failure.detail),
            suggested_fix: contract.suggested_fix(pre, &subject),
        };
        self.report(violation)
    }

    fn amount<S: AbstractState>(&self, op: &OperationNode, arg: ArgRef, state: &mut S) -> Option<S::Amount> {
        state.volume(self.ctx, op.id, Self::volume_arg(op, arg))
    }

    fn effect<S: AbstractState>(&mut self, op: &OperationNode, machine: ResourceId, effect: &Effect, state: &mut S) {
        let ctx = self.ctx;
        let by = Some(op.id);
        match effect {
            Effect::LoadTips { from } => {
                let source = Self::resource_arg(op, *from);
                if let Some(s) = source {
                    state.presence_mut().set(ctx, FactKey::Content(s), Some(false), by);
                }
                let presence = state.presence_mut();
                presence.set_tip_origin(machine, source);
                presence.set(ctx, FactKey::TipsLoaded(machine), Some(true), by);
                presence.set(ctx, FactKey::Holding(machine), Some(false), by);
                let capacity = source.and_then(|s| ctx.capacity(s));
                state.apply(ctx, op.id, QuantityChange::LoadTips { machine, capacity });
            }
            Effect::DropTips { to } => {
                let target = match to {
                    TipSink::Arg(arg) => Self::resource_arg(op, *arg),
                    TipSink::Origin => state.presence().tip_origin(machine),
                    TipSink::Trash => None,
                };
                let presence = state.presence_mut();
                if let Some(t) = target {
                    presence.set(ctx, FactKey::Content(t), Some(true), by);
                }
                presence.set_tip_origin(machine, None);
                presence.set(ctx, FactKey::TipsLoaded(machine), Some(false), by);
                presence.set(ctx, FactKey::Holding(machine), Some(false), by);
                state.apply(ctx, op.id, QuantityChange::ClearTips { machine });
            }
            Effect::Aspirate { from, volume } => {
                state.presence_mut().set(ctx, FactKey::Holding(machine), Some(true), by);
                let (Some(resource), Some(amount)) = (Self::resource_arg(op, *from), self.amount(op, *volume, state))
                else {
                    return;
                };
                state.apply(ctx, op.id, QuantityChange::Withdraw { resource, amount: amount.clone() });
                state.apply(ctx, op.id, QuantityChange::Draw { machine, amount });
            }
            Effect::Dispense { to, volume } => {
                let Some(resource) = Self::resource_arg(op, *to) else {
                    return;
                };
                state.presence_mut().set(ctx, FactKey::Content(resource), Some(true), by);
                if let Some(amount) = self.amount(op, *volume, state) {
                    state.apply(ctx, op.id, QuantityChange::Deposit { resource, amount: amount.clone() });
                    state.apply(ctx, op.id, QuantityChange::Release { machine, amount });
                }
            }
            Effect::Transfer { from, to, volume } => {
                let source = Self::resource_arg(op, *from);
                let target = Self::resource_arg(op, *to);
                if let Some(t) = target {
                    state.presence_mut().set(ctx, FactKey::Content(t), Some(true), by);
                }
                let Some(amount) = self.amount(op, *volume, state) else {
                    return;
                };
                if let Some(s) = source {
                    state.apply(ctx, op.id, QuantityChange::Withdraw { resource: s, amount: amount.clone() });
                }
                if let Some(t) = target {
                    state.apply(ctx, op.id, QuantityChange::Deposit { resource: t, amount });
                }
            }
            Effect::Place { arg } | Effect::Move { arg } => {
                if let Some(r) = Self::resource_arg(op, *arg) {
                    state.presence_mut().set(ctx, FactKey::OnDeck(r), Some(true), by);
                }
            }
            Effect::Remove { arg } => {
                if let Some(r) = Self::resource_arg(op, *arg) {
                    state.presence_mut().set(ctx, FactKey::OnDeck(r), Some(false), by);
                }
            }
        }
    }

    /// Subject naming the placement root a resource must be placed with.
    fn root_subject(&self, id: ResourceId) -> Subject {
        match self.ctx.placeable_roots(id).first() {
            Some(root) => self.ctx.subject(*root),
            None => self.ctx.subject(id),
        }
    }

    fn quantity_failures<S: AbstractState>(&mut self, failures: Vec<QuantityFailure>) -> Result<(), Halt> {
        for failure in failures {
            let subject = self.ctx.subject(failure.resource);
            let suggested_fix = self.fix_for(failure.operation, failure.fact, &subject);
            self.report(StateViolation {
                level: S::LEVEL,
                operation: failure.operation,
                fact: failure.fact,
                resource: failure.resource,
                message: format!("{subject} {} ({})", failure.fact, failure.detail),
                suggested_fix,
            })?;
        }
        Ok(())
    }

    /// Fix text for a failure found away from its call site.
    fn fix_for(&self, op: OperationId, fact: StateFact, subject: &Subject) -> String {
        if let Some(contract) = self.ctx.entry(op).and_then(|e| e.contract.as_ref()) {
            if let Some(pre) = contract.preconditions.iter().find(|p| p.fact() == fact) {
                return contract.suggested_fix(pre, subject);
            }
        }
        match fact {
            StateFact::SufficientContent => format!("add more liquid to {subject} or run fewer iterations"),
            StateFact::WithinCapacity => format!("use a larger container than {subject} or run fewer iterations"),
            _ => format!("make sure {subject} {fact}"),
        }
    }

    fn report(&mut self, violation: StateViolation) -> Result<(), Halt> {
        debug!(
            level = %violation.level,
            op = %violation.operation,
            fact = ?violation.fact,
            "{}",
            violation.message
        );
        let duplicate = self.violations.iter().any(|v| {
            v.operation == violation.operation && v.fact == violation.fact && v.resource == violation.resource
        });
        if !duplicate {
            self.violations.push(violation);
        }
        match self.mode {
            RunMode::Main => Ok(()),
            RunMode::Search => Err(Halt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ContractDatabase;
    use crate::simulator::BooleanState;
    use labtrace_core::{DeckTopology, HierarchyRegistry, ProtocolComputationGraph, ResourceCatalog, SimulationLevel};
    use labtrace_extract::{extract_procedure, ParsedModule};
    use std::collections::BTreeMap;

    fn extract(source: &str) -> ProtocolComputationGraph {
        let module = ParsedModule::parse(source).unwrap();
        extract_procedure(&module, "protocol", &HierarchyRegistry::standard(), DeckTopology::SlotBased)
            .unwrap()
            .graph
    }

    fn resource(graph: &ProtocolComputationGraph, name: &str) -> ResourceId {
        graph.resources().iter().find(|r| r.name == name).unwrap().id
    }

    #[test]
    fn presence_replay_runs_on_the_boolean_state() {
        let graph = extract(
            r#"
async def protocol(lh: LiquidHandler, source: Plate, dest: Plate):
    await lh.aspirate(source["A1"], vols=[50])
    await lh.dispense(dest["A1"], vols=[50])
"#,
        );
        let catalog = ResourceCatalog::standard();
        let contracts = ContractDatabase::standard();
        let ctx = Context::new(&graph, &catalog, &contracts, 2);

        let mut state = BooleanState::new();
        let mut replayer = Replayer::new(&ctx, RunMode::Main);
        replayer.run(&mut state);
        let outcome = replayer.finish();
        assert_eq!(outcome.violations.len(), 1, "{:?}", outcome.violations);
        assert_eq!(outcome.violations[0].level, SimulationLevel::Boolean);
        assert_eq!(outcome.violations[0].fact, StateFact::TipsLoaded);
    }

    #[test]
    fn halted_branch_keeps_its_initial_reads() {
        let graph = extract(
            r#"
async def protocol(lh: LiquidHandler, tips: TipRack, source: Plate, dest: Plate, fast: bool):
    await lh.pick_up_tips(tips["A1"])
    if fast:
        await lh.aspirate(source["A1"], vols=[50])
    else:
        await lh.aspirate(dest["A1"], vols=[50])
    await lh.dispense(dest["B1"], vols=[50])
"#,
        );
        let catalog = ResourceCatalog::standard();
        let contracts = ContractDatabase::standard();
        let ctx = Context::new(&graph, &catalog, &contracts, 2);
        let source = resource(&graph, "source");

        let mut initial = BTreeMap::new();
        initial.insert(FactKey::Content(source), false);
        let mut state = BooleanState::with_initial(initial);
        let mut replayer = Replayer::new(&ctx, RunMode::Search);
        replayer.run(&mut state);
        let outcome = replayer.finish();

        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].fact, StateFact::HasContent);
        assert_eq!(state.reads().get(&FactKey::Content(source)), Some(&false));
    }

    #[test]
    fn halted_else_branch_keeps_reads_of_both_arms() {
        let graph = extract(
            r#"
async def protocol(lh: LiquidHandler, tips: TipRack, source: Plate, dest: Plate, fast: bool):
    await lh.pick_up_tips(tips["A1"])
    if fast:
        await lh.aspirate(source["A1"], vols=[50])
    else:
        await lh.aspirate(dest["A1"], vols=[50])
"#,
        );
        let catalog = ResourceCatalog::standard();
        let contracts = ContractDatabase::standard();
        let ctx = Context::new(&graph, &catalog, &contracts, 2);
        let (source, dest) = (resource(&graph, "source"), resource(&graph, "dest"));

        let mut initial = BTreeMap::new();
        initial.insert(FactKey::Content(dest), false);
        let mut state = BooleanState::with_initial(initial);
        let mut replayer = Replayer::new(&ctx, RunMode::Search);
        replayer.run(&mut state);

        assert_eq!(replayer.finish().violations.len(), 1);
        assert_eq!(state.reads().get(&FactKey::Content(source)), Some(&true));
        assert_eq!(state.reads().get(&FactKey::Content(dest)), Some(&false));
    }
}
