//! Concrete quantities under one assignment of every symbol.

use std::collections::{BTreeMap, BTreeSet};

use labtrace_core::{OperationId, ResourceId, SimulationLevel};

use super::boolean::BooleanState;
use super::symbolic::{SymbolKey, SymbolicState};
use super::{AbstractState, Context, QuantityChange, QuantityCheck, QuantityFailure, VolumeValue};
use crate::bounds::LoopBound;

const EPS: f64 = 1e-9;

/// Value of each symbol.
pub type Assignment = BTreeMap<SymbolKey, f64>;

#[derive(Debug, Clone, Default)]
pub struct ExactState {
    presence: BooleanState,
    assignment: Assignment,
    /// (low, high) content per resource.
    amounts: BTreeMap<ResourceId, (f64, f64)>,
    held: BTreeMap<ResourceId, f64>,
    tip_capacity: BTreeMap<ResourceId, f64>,
}

impl ExactState {
    pub fn new(presence: BooleanState, assignment: Assignment) -> Self {
        ExactState { presence, assignment, ..ExactState::default() }
    }

    /// Evaluates a symbolic state at its least feasible point.
    pub fn from_symbolic(state: &SymbolicState) -> Self {
        let assignment = state.feasible_point();
        let (amounts, held) = state.evaluate(&assignment);
        ExactState {
            presence: state.presence().clone(),
            assignment,
            amounts,
            held,
            tip_capacity: BTreeMap::new(),
        }
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub(crate) fn content(&self, ctx: &Context<'_>, id: ResourceId) -> (f64, f64) {
        let lineage = ctx.graph.lineage(id);
        for r in &lineage {
            if let Some(a) = self.amounts.get(r) {
                return *a;
            }
        }
        let top = lineage.last().copied().unwrap_or(id);
        let v = self.assignment.get(&SymbolKey::Initial(top)).copied().unwrap_or(0.0);
        (v, v)
    }

    fn held(&self, machine: ResourceId) -> f64 {
        self.held.get(&machine).copied().unwrap_or(0.0)
    }
}

fn fmt_ul(v: f64) -> String {
    format!("{} µL", (v * 1000.0).round() / 1000.0)
}

impl AbstractState for ExactState {
    type Amount = f64;
    const LEVEL: SimulationLevel = SimulationLevel::Exact;

    fn presence(&self) -> &BooleanState {
        &self.presence
    }

    fn presence_mut(&mut self) -> &mut BooleanState {
        &mut self.presence
    }

    fn volume(&mut self, _ctx: &Context<'_>, op: OperationId, value: VolumeValue) -> Option<f64> {
        match value {
            VolumeValue::Known(v) => Some(v),
            VolumeValue::Runtime => Some(self.assignment.get(&SymbolKey::Volume(op)).copied().unwrap_or(0.0)),
            VolumeValue::Absent => None,
        }
    }

    fn check(&mut self, ctx: &Context<'_>, op: OperationId, check: QuantityCheck<f64>) -> Option<QuantityFailure> {
        let fact = check.fact();
        let resource = check.resource();
        let detail = match check {
            QuantityCheck::Content { resource, amount } => {
                let (low, _) = self.content(ctx, resource);
                (low - amount < -EPS).then(|| format!("has {}, needs {}", fmt_ul(low), fmt_ul(amount)))
            }
            QuantityCheck::Capacity { resource, amount } => {
                let cap = ctx.capacity(resource)?;
                let (_, high) = self.content(ctx, resource);
                (cap - (high + amount) < -EPS)
                    .then(|| format!("holds {} of {}, adding {}", fmt_ul(high), fmt_ul(cap), fmt_ul(amount)))
            }
            QuantityCheck::TipVolume { machine, amount } => {
                let cap = self.tip_capacity.get(&machine).copied()?;
                let held = self.held(machine);
                (cap - (held + amount) < -EPS)
                    .then(|| format!("tips hold {}, need {}", fmt_ul(cap), fmt_ul(held + amount)))
            }
            QuantityCheck::Held { machine, amount } => {
                let held = self.held(machine);
                (held - amount < -EPS).then(|| format!("holds {}, dispensing {}", fmt_ul(held), fmt_ul(amount)))
            }
        }?;
        Some(QuantityFailure { operation: op, fact, resource, detail })
    }

    fn apply(&mut self, ctx: &Context<'_>, _op: OperationId, change: QuantityChange<f64>) {
        match change {
            QuantityChange::Withdraw { resource, amount } => {
                let (low, high) = self.content(ctx, resource);
                self.amounts.insert(resource, (low - amount, high - amount));
            }
            QuantityChange::Deposit { resource, amount } => {
                let (low, high) = self.content(ctx, resource);
                self.amounts.insert(resource, (low + amount, high + amount));
            }
            QuantityChange::Draw { machine, amount } => {
                let held = self.held(machine) + amount;
                self.held.insert(machine, held);
            }
            QuantityChange::Release { machine, amount } => {
                let held = self.held(machine) - amount;
                self.held.insert(machine, held);
            }
            QuantityChange::LoadTips { machine, capacity } => {
                match capacity {
                    Some(c) => self.tip_capacity.insert(machine, c),
                    None => self.tip_capacity.remove(&machine),
                };
                self.held.remove(&machine);
            }
            QuantityChange::ClearTips { machine } => {
                self.tip_capacity.remove(&machine);
                self.held.remove(&machine);
            }
        }
    }

    fn reset(&mut self, resources: &BTreeSet<ResourceId>) {
        self.presence.reset(resources);
        self.amounts.retain(|r, _| !resources.contains(r));
    }

    fn merge_element(&mut self, element: ResourceId, collection: ResourceId) {
        self.presence.merge_element(element, collection);
        if let Some(a) = self.amounts.get(&element).copied() {
            self.amounts.insert(collection, a);
        }
    }

    fn scale_loop(
        &mut self,
        ctx: &Context<'_>,
        op: OperationId,
        previous: &Self,
        bound: &LoopBound,
        replayed: u64,
        unscaled: &BTreeSet<ResourceId>,
    ) -> Vec<QuantityFailure> {
        let remaining = match bound {
            LoopBound::Exact(n) => n.saturating_sub(replayed) as f64,
            LoopBound::Unbounded { .. } => self.assignment.get(&SymbolKey::LoopCount(op)).copied().unwrap_or(0.0),
        };
        if remaining <= 0.0 {
            return Vec::new();
        }
        let resources: Vec<ResourceId> = self.amounts.keys().copied().filter(|r| !unscaled.contains(r)).collect();
        let mut failures = Vec::new();
        for r in resources {
            let (low, high) = self.content(ctx, r);
            let (prev_low, prev_high) = previous.content(ctx, r);
            let (d_low, d_high) = (low - prev_low, high - prev_high);
            if d_low.abs() <= EPS && d_high.abs() <= EPS {
                continue;
            }
            let (low, high) = (low + d_low * remaining, high + d_high * remaining);
            self.amounts.insert(r, (low, high));
            if d_low < 0.0 && low < -EPS {
                failures.push(QuantityFailure {
                    operation: op,
                    fact: labtrace_core::StateFact::SufficientContent,
                    resource: r,
                    detail: format!("runs short by {} over the loop", fmt_ul(-low)),
                });
            }
            if let Some(cap) = ctx.capacity(r) {
                if d_high > 0.0 && high - cap > EPS {
                    failures.push(QuantityFailure {
                        operation: op,
                        fact: labtrace_core::StateFact::WithinCapacity,
                        resource: r,
                        detail: format!("overflows by {} over the loop", fmt_ul(high - cap)),
                    });
                }
            }
        }
        failures
    }

    fn join(self, other: Self, ctx: &Context<'_>, _op: OperationId) -> (Self, Vec<QuantityFailure>) {
        let presence = self.presence.join_with(ctx, &other.presence);
        let keys: BTreeSet<ResourceId> = self.amounts.keys().chain(other.amounts.keys()).copied().collect();
        let amounts = keys
            .into_iter()
            .map(|r| {
                let (a_low, a_high) = self.content(ctx, r);
                let (b_low, b_high) = other.content(ctx, r);
                (r, (a_low.min(b_low), a_high.max(b_high)))
            })
            .collect();
        let machines: BTreeSet<ResourceId> = self.held.keys().chain(other.held.keys()).copied().collect();
        let held = machines.into_iter().map(|m| (m, self.held(m).min(other.held(m)))).collect();
        let tip_capacity = self
            .tip_capacity
            .iter()
            .filter_map(|(m, c)| other.tip_capacity.get(m).map(|o| (*m, c.min(*o))))
            .collect();
        let joined = ExactState { presence, assignment: self.assignment.clone(), amounts, held, tip_capacity };
        (joined, Vec::new())
    }
}
