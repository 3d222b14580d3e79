//! Linear symbolic quantities.
//!
//! Volumes are linear expressions over symbols: the initial per-item
//! content of each placement root (chosen by whoever sets up the deck) and
//! the values only known at runtime (volumes, loop counts). Every quantity
//! precondition becomes a constraint `expr >= 0`. Interval propagation over
//! the constraint set detects infeasibility and reports which constraints
//! conflict; it is sound for what it reports but does not find every
//! infeasible system.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use labtrace_core::{OperationId, ResourceId, SimulationLevel, StateFact};
use serde::Serialize;

use super::boolean::BooleanState;
use super::exact::Assignment;
use super::{AbstractState, Context, QuantityChange, QuantityCheck, QuantityFailure, VolumeValue};
use crate::bounds::LoopBound;

const EPS: f64 = 1e-9;
const MAX_PASSES: usize = 64;

// ---------------------------------------------------------------------------
// Symbols and expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SymbolKey {
    /// Starting per-item content of a placement root.
    Initial(ResourceId),
    /// Runtime volume argument of a call.
    Volume(OperationId),
    /// Iterations of an unbounded loop beyond those replayed.
    LoopCount(OperationId),
    /// Value after a branch join that neither arm's expression bounds.
    Merge(OperationId, u32),
}

impl SymbolKey {
    /// Controlled symbols are chosen by the setup; the rest are not.
    pub fn is_controlled(&self) -> bool {
        matches!(self, SymbolKey::Initial(_))
    }

    pub fn is_count(&self) -> bool {
        matches!(self, SymbolKey::LoopCount(_))
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKey::Initial(r) => write!(f, "initial({r})"),
            SymbolKey::Volume(op) => write!(f, "volume({op})"),
            SymbolKey::LoopCount(op) => write!(f, "iterations({op})"),
            SymbolKey::Merge(op, n) => write!(f, "merge({op}#{n})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Interval {
    pub lo: f64,
    pub hi: f64,
}

impl Interval {
    pub fn new(lo: f64, hi: f64) -> Self {
        Interval { lo, hi }
    }

    pub fn point(v: f64) -> Self {
        Interval { lo: v, hi: v }
    }

    pub fn unbounded() -> Self {
        Interval { lo: f64::NEG_INFINITY, hi: f64::INFINITY }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Domain {
    pub interval: Interval,
    pub controlled: bool,
}

/// `constant + sum(coefficient * symbol)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinExpr {
    pub constant: f64,
    pub terms: BTreeMap<SymbolKey, f64>,
}

impl LinExpr {
    pub fn constant(value: f64) -> Self {
        LinExpr { constant: value, terms: BTreeMap::new() }
    }

    pub fn symbol(key: SymbolKey) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(key, 1.0);
        LinExpr { constant: 0.0, terms }
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn plus(&self, other: &LinExpr) -> LinExpr {
        let mut out = self.clone();
        out.constant += other.constant;
        for (k, c) in &other.terms {
            *out.terms.entry(*k).or_insert(0.0) += c;
        }
        out.normalized()
    }

    pub fn minus(&self, other: &LinExpr) -> LinExpr {
        self.plus(&other.times(-1.0))
    }

    pub fn times(&self, factor: f64) -> LinExpr {
        LinExpr {
            constant: self.constant * factor,
            terms: self.terms.iter().map(|(k, c)| (*k, c * factor)).collect(),
        }
        .normalized()
    }

    fn normalized(mut self) -> LinExpr {
        self.terms.retain(|_, c| c.abs() > EPS);
        self
    }

    pub fn symbols(&self) -> impl Iterator<Item = SymbolKey> + '_ {
        self.terms.keys().copied()
    }

    /// Missing symbols evaluate to zero.
    pub fn eval(&self, assignment: &Assignment) -> f64 {
        self.constant + self.terms.iter().map(|(k, c)| c * assignment.get(k).copied().unwrap_or(0.0)).sum::<f64>()
    }

    /// Range of the expression when each symbol ranges over `bounds`.
    pub fn interval(&self, bounds: &BTreeMap<SymbolKey, Interval>) -> Interval {
        let mut lo = self.constant;
        let mut hi = self.constant;
        for (k, c) in &self.terms {
            let b = bounds.get(k).copied().unwrap_or_else(Interval::unbounded);
            let (a, z) = (mul(*c, b.lo), mul(*c, b.hi));
            lo += a.min(z);
            hi += a.max(z);
        }
        Interval { lo, hi }
    }
}

/// Coefficient times bound, with `0 * inf = 0`.
fn mul(c: f64, v: f64) -> f64 {
    if c == 0.0 || v == 0.0 {
        0.0
    } else {
        c * v
    }
}

impl fmt::Display for LinExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for (k, c) in &self.terms {
            let mag = c.abs();
            let term = if (mag - 1.0).abs() < EPS { k.to_string() } else { format!("{mag}*{k}") };
            match (out.is_empty(), *c < 0.0) {
                (true, true) => out.push('-'),
                (true, false) => {}
                (false, true) => out.push_str(" - "),
                (false, false) => out.push_str(" + "),
            }
            out.push_str(&term);
        }
        if out.is_empty() {
            return write!(f, "{}", self.constant);
        }
        if self.constant.abs() > EPS {
            let sign = if self.constant < 0.0 { " - " } else { " + " };
            out.push_str(sign);
            out.push_str(&self.constant.abs().to_string());
        }
        f.write_str(&out)
    }
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// The operation and fact a constraint was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ConstraintOrigin {
    pub operation: OperationId,
    pub fact: StateFact,
    pub resource: ResourceId,
}

/// `expr >= 0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Constraint {
    pub expr: LinExpr,
    pub origin: ConstraintOrigin,
}

struct Propagation {
    bounds: BTreeMap<SymbolKey, Interval>,
    /// Indices of constraints that together cannot hold.
    conflict: Option<BTreeSet<usize>>,
}

/// Tightens symbol bounds until a fixpoint, or until a symbol's bounds
/// cross. Symbols in `fixed` are pinned to the given value.
fn propagate(
    domains: &BTreeMap<SymbolKey, Domain>,
    constraints: &[Constraint],
    fixed: &Assignment,
) -> Propagation {
    let mut bounds: BTreeMap<SymbolKey, Interval> = domains
        .iter()
        .map(|(k, d)| (*k, fixed.get(k).map_or(d.interval, |v| Interval::point(*v))))
        .collect();
    let mut lo_src: BTreeMap<SymbolKey, BTreeSet<usize>> = BTreeMap::new();
    let mut hi_src: BTreeMap<SymbolKey, BTreeSet<usize>> = BTreeMap::new();

    for _ in 0..MAX_PASSES {
        let mut changed = false;
        for (ci, c) in constraints.iter().enumerate() {
            // Largest value each term can take, and which bound gives it.
            let mut finite_max = c.expr.constant;
            let mut infinite = 0usize;
            let mut contributions = Vec::with_capacity(c.expr.terms.len());
            for (k, coef) in &c.expr.terms {
                let b = bounds.get(k).copied().unwrap_or_else(Interval::unbounded);
                let uses_hi = *coef > 0.0;
                let v = mul(*coef, if uses_hi { b.hi } else { b.lo });
                if v.is_infinite() {
                    infinite += 1;
                } else {
                    finite_max += v;
                }
                contributions.push((*k, *coef, v, uses_hi));
            }

            let provenance = |skip: Option<SymbolKey>| {
                let mut out = BTreeSet::from([ci]);
                for (k, _, _, uses_hi) in &contributions {
                    if Some(*k) == skip {
                        continue;
                    }
                    let src = if *uses_hi { hi_src.get(k) } else { lo_src.get(k) };
                    out.extend(src.into_iter().flatten().copied());
                }
                out
            };

            if infinite == 0 && finite_max < -EPS {
                return Propagation { bounds, conflict: Some(provenance(None)) };
            }

            let mut updates = Vec::new();
            for (k, coef, v, _) in &contributions {
                let others_infinite = infinite - usize::from(v.is_infinite());
                if others_infinite > 0 {
                    continue;
                }
                let rest = if v.is_infinite() { finite_max } else { finite_max - v };
                let b = bounds.get(k).copied().unwrap_or_else(Interval::unbounded);
                if *coef > 0.0 {
                    let lo = -rest / coef;
                    if lo > b.lo + EPS {
                        updates.push((*k, true, lo, provenance(Some(*k))));
                    }
                } else {
                    let hi = rest / -coef;
                    if hi < b.hi - EPS {
                        updates.push((*k, false, hi, provenance(Some(*k))));
                    }
                }
            }

            for (k, is_lo, value, src) in updates {
                let b = bounds.entry(k).or_insert_with(Interval::unbounded);
                if is_lo {
                    b.lo = value;
                    lo_src.insert(k, src);
                } else {
                    b.hi = value;
                    hi_src.insert(k, src);
                }
                changed = true;
                if b.lo > b.hi + EPS {
                    let mut conflict = lo_src.get(&k).cloned().unwrap_or_default();
                    conflict.extend(hi_src.get(&k).into_iter().flatten().copied());
                    return Propagation { bounds, conflict: Some(conflict) };
                }
            }
        }
        if !changed {
            break;
        }
    }
    Propagation { bounds, conflict: None }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Bounds on the content of one resource: `low` for withdrawals, `high`
/// for capacity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Range {
    pub low: LinExpr,
    pub high: LinExpr,
}

impl Range {
    fn exact(expr: LinExpr) -> Self {
        Range { low: expr.clone(), high: expr }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SymbolicState {
    presence: BooleanState,
    amounts: BTreeMap<ResourceId, Range>,
    held: BTreeMap<ResourceId, LinExpr>,
    tip_capacity: BTreeMap<ResourceId, f64>,
    domains: BTreeMap<SymbolKey, Domain>,
    constraints: Vec<Constraint>,
    withdrawn_by: BTreeMap<ResourceId, OperationId>,
    deposited_by: BTreeMap<ResourceId, OperationId>,
    merges: u32,
}

impl SymbolicState {
    pub fn from_presence(presence: BooleanState) -> Self {
        SymbolicState { presence, ..SymbolicState::default() }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn domains(&self) -> &BTreeMap<SymbolKey, Domain> {
        &self.domains
    }

    pub(crate) fn held(&self, machine: ResourceId) -> LinExpr {
        self.held.get(&machine).cloned().unwrap_or_default()
    }

    pub(crate) fn tip_capacity(&self, machine: ResourceId) -> Option<f64> {
        self.tip_capacity.get(&machine).copied()
    }

    /// Content of a resource: the nearest explicit amount in its lineage,
    /// else its placement root's initial-content symbol.
    fn amount(&mut self, ctx: &Context<'_>, id: ResourceId) -> Range {
        let lineage = ctx.graph.lineage(id);
        for r in &lineage {
            if let Some(range) = self.amounts.get(r) {
                return range.clone();
            }
        }
        let top = lineage.last().copied().unwrap_or(id);
        let key = SymbolKey::Initial(top);
        let cap = ctx.capacity(top).unwrap_or(f64::INFINITY);
        self.domains.entry(key).or_insert(Domain { interval: Interval::new(0.0, cap), controlled: true });
        Range::exact(LinExpr::symbol(key))
    }

    fn peek_amount(&self, ctx: &Context<'_>, id: ResourceId) -> Range {
        let lineage = ctx.graph.lineage(id);
        for r in &lineage {
            if let Some(range) = self.amounts.get(r) {
                return range.clone();
            }
        }
        let top = lineage.last().copied().unwrap_or(id);
        Range::exact(LinExpr::symbol(SymbolKey::Initial(top)))
    }

    fn fresh_merge(&mut self, op: OperationId, interval: Interval) -> LinExpr {
        self.merges += 1;
        let key = SymbolKey::Merge(op, self.merges);
        self.domains.insert(key, Domain { interval, controlled: false });
        LinExpr::symbol(key)
    }

    /// Adds `expr >= 0`. A constraint that cannot hold together with the
    /// ones already present is reported and left out.
    fn add_constraint(&mut self, ctx: &Context<'_>, expr: LinExpr, origin: ConstraintOrigin) -> Option<QuantityFailure> {
        let failure = |detail: String| QuantityFailure {
            operation: origin.operation,
            fact: origin.fact,
            resource: origin.resource,
            detail,
        };
        if expr.is_constant() {
            if expr.constant < -EPS {
                return Some(failure(format!("short by {} µL", round(-expr.constant))));
            }
            self.constraints.push(Constraint { expr, origin });
            return None;
        }

        self.constraints.push(Constraint { expr, origin });
        let prop = propagate(&self.domains, &self.constraints, &Assignment::new());
        let Some(conflict) = prop.conflict else {
            return None;
        };
        let own = self.constraints.len() - 1;
        self.constraints.pop();
        let mut others: Vec<String> = conflict
            .into_iter()
            .filter(|i| *i != own)
            .filter_map(|i| self.constraints.get(i))
            .map(|c| describe_origin(ctx, &c.origin))
            .collect();
        others.sort();
        others.dedup();
        let detail = if others.is_empty() {
            "no starting amount within capacity satisfies it".to_string()
        } else {
            format!("conflicts with {}", others.join(", "))
        };
        Some(failure(detail))
    }

    fn add_constraints(&mut self, ctx: &Context<'_>, constraints: Vec<Constraint>) -> Vec<QuantityFailure> {
        constraints
            .into_iter()
            .filter_map(|c| self.add_constraint(ctx, c.expr, c.origin))
            .collect()
    }

    /// Least per-item starting amount of each placement root that keeps
    /// every constraint satisfiable.
    pub fn minimum_initial_quantities(&self) -> BTreeMap<ResourceId, f64> {
        let prop = propagate(&self.domains, &self.constraints, &Assignment::new());
        prop.bounds
            .iter()
            .filter_map(|(k, b)| match k {
                SymbolKey::Initial(r) if b.lo > EPS && b.lo.is_finite() => Some((*r, round(b.lo))),
                _ => None,
            })
            .collect()
    }

    /// Constraints that runtime values could break, and constraints that
    /// hold with no slack.
    pub fn edge_cases(&self) -> Vec<ConstraintOrigin> {
        let prop = propagate(&self.domains, &self.constraints, &Assignment::new());
        let mut bounds = prop.bounds;
        for (k, d) in &self.domains {
            if !d.controlled {
                bounds.insert(*k, d.interval);
            }
        }
        let mut out: Vec<ConstraintOrigin> = self
            .constraints
            .iter()
            .filter(|c| {
                if c.expr.is_constant() {
                    c.expr.constant.abs() <= EPS
                } else {
                    c.expr.symbols().any(|k| !k.is_controlled()) && c.expr.interval(&bounds).lo < -EPS
                }
            })
            .map(|c| c.origin)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Domains of the runtime symbols the concrete level samples.
    pub fn sampled_domains(&self) -> BTreeMap<SymbolKey, Interval> {
        self.domains
            .iter()
            .filter(|(k, d)| !d.controlled && !matches!(k, SymbolKey::Merge(..)))
            .map(|(k, d)| (*k, d.interval))
            .collect()
    }

    /// Completes a sample of runtime symbols with the least starting
    /// amounts the constraints allow for it.
    pub fn minimal_assignment(&self, sample: &Assignment) -> Assignment {
        let prop = propagate(&self.domains, &self.constraints, sample);
        let mut out = sample.clone();
        for (k, d) in &self.domains {
            if d.controlled {
                let lo = prop.bounds.get(k).map_or(d.interval.lo, |b| b.lo);
                out.insert(*k, if lo.is_finite() { lo.max(0.0) } else { 0.0 });
            }
        }
        out
    }

    /// The least starting amounts with every runtime symbol at its lower
    /// bound.
    pub fn feasible_point(&self) -> Assignment {
        let sample = self
            .sampled_domains()
            .into_iter()
            .map(|(k, i)| (k, if i.lo.is_finite() { i.lo } else { 0.0 }))
            .collect();
        self.minimal_assignment(&sample)
    }

    /// Explicit amounts and held volumes evaluated at `assignment`.
    pub(crate) fn evaluate(&self, assignment: &Assignment) -> (BTreeMap<ResourceId, (f64, f64)>, BTreeMap<ResourceId, f64>) {
        let amounts = self
            .amounts
            .iter()
            .map(|(r, range)| (*r, (range.low.eval(assignment), range.high.eval(assignment))))
            .collect();
        let held = self.held.iter().map(|(m, e)| (*m, e.eval(assignment))).collect();
        (amounts, held)
    }
}

fn describe_origin(ctx: &Context<'_>, origin: &ConstraintOrigin) -> String {
    match ctx.graph.operation(origin.operation) {
        Some(op) => format!("`{}` at {}", op.name, op.position),
        None => origin.operation.to_string(),
    }
}

fn round(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Smaller of two expressions when their difference is constant; a fresh
/// symbol otherwise.
fn min_expr(state: &mut SymbolicState, op: OperationId, a: &LinExpr, b: &LinExpr, pick_min: bool) -> LinExpr {
    if a == b {
        return a.clone();
    }
    let diff = a.minus(b);
    if diff.is_constant() {
        let a_smaller = diff.constant < 0.0;
        return if a_smaller == pick_min { a.clone() } else { b.clone() };
    }
    let bounds: BTreeMap<SymbolKey, Interval> = state.domains.iter().map(|(k, d)| (*k, d.interval)).collect();
    let (ia, ib) = (a.interval(&bounds), b.interval(&bounds));
    let interval = if pick_min {
        Interval::new(ia.lo.min(ib.lo), ia.hi.min(ib.hi))
    } else {
        Interval::new(ia.lo.max(ib.lo), ia.hi.max(ib.hi))
    };
    state.fresh_merge(op, interval)
}

impl AbstractState for SymbolicState {
    type Amount = LinExpr;
    const LEVEL: SimulationLevel = SimulationLevel::Symbolic;

    fn presence(&self) -> &BooleanState {
        &self.presence
    }

    fn presence_mut(&mut self) -> &mut BooleanState {
        &mut self.presence
    }

    fn volume(&mut self, ctx: &Context<'_>, op: OperationId, value: VolumeValue) -> Option<LinExpr> {
        match value {
            VolumeValue::Known(v) => Some(LinExpr::constant(v)),
            VolumeValue::Runtime => {
                let key = SymbolKey::Volume(op);
                let cap = ctx.catalog.max_item_volume().unwrap_or(f64::INFINITY);
                self.domains.entry(key).or_insert(Domain { interval: Interval::new(0.0, cap), controlled: false });
                Some(LinExpr::symbol(key))
            }
            VolumeValue::Absent => None,
        }
    }

    fn check(&mut self, ctx: &Context<'_>, op: OperationId, check: QuantityCheck<LinExpr>) -> Option<QuantityFailure> {
        let origin = ConstraintOrigin { operation: op, fact: check.fact(), resource: check.resource() };
        let expr = match check {
            QuantityCheck::Content { resource, amount } => self.amount(ctx, resource).low.minus(&amount),
            QuantityCheck::Capacity { resource, amount } => {
                let cap = ctx.capacity(resource)?;
                LinExpr::constant(cap).minus(&self.amount(ctx, resource).high.plus(&amount))
            }
            QuantityCheck::TipVolume { machine, amount } => {
                let cap = self.tip_capacity(machine)?;
                LinExpr::constant(cap).minus(&self.held(machine).plus(&amount))
            }
            QuantityCheck::Held { machine, amount } => self.held(machine).minus(&amount),
        };
        self.add_constraint(ctx, expr, origin)
    }

    fn apply(&mut self, ctx: &Context<'_>, op: OperationId, change: QuantityChange<LinExpr>) {
        match change {
            QuantityChange::Withdraw { resource, amount } => {
                let range = self.amount(ctx, resource);
                self.amounts.insert(
                    resource,
                    Range { low: range.low.minus(&amount), high: range.high.minus(&amount) },
                );
                self.withdrawn_by.insert(resource, op);
            }
            QuantityChange::Deposit { resource, amount } => {
                let range = self.amount(ctx, resource);
                self.amounts.insert(
                    resource,
                    Range { low: range.low.plus(&amount), high: range.high.plus(&amount) },
                );
                self.deposited_by.insert(resource, op);
            }
            QuantityChange::Draw { machine, amount } => {
                let held = self.held(machine).plus(&amount);
                self.held.insert(machine, held);
            }
            QuantityChange::Release { machine, amount } => {
                let held = self.held(machine).minus(&amount);
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
        if let Some(range) = self.amounts.get(&element).cloned() {
            self.amounts.insert(collection, range);
        }
        if let Some(op) = self.withdrawn_by.get(&element).copied() {
            self.withdrawn_by.insert(collection, op);
        }
        if let Some(op) = self.deposited_by.get(&element).copied() {
            self.deposited_by.insert(collection, op);
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
        enum Remaining {
            Count(f64),
            Symbol(SymbolKey),
        }
        let remaining = match bound {
            LoopBound::Exact(n) => {
                let left = n.saturating_sub(replayed);
                if left == 0 {
                    return Vec::new();
                }
                Remaining::Count(left as f64)
            }
            LoopBound::Unbounded { .. } => {
                let key = SymbolKey::LoopCount(op);
                let cap = ctx.catalog.max_item_count().map_or(f64::INFINITY, |c| c as f64);
                self.domains.entry(key).or_insert(Domain { interval: Interval::new(0.0, cap), controlled: false });
                Remaining::Symbol(key)
            }
        };

        let resources: Vec<ResourceId> = self.amounts.keys().copied().filter(|r| !unscaled.contains(r)).collect();
        let mut pending = Vec::new();
        for r in resources {
            let current = self.peek_amount(ctx, r);
            let before = previous.peek_amount(ctx, r);
            let scale = |state: &mut SymbolicState, now: &LinExpr, delta: LinExpr| -> LinExpr {
                match &remaining {
                    Remaining::Count(n) => now.plus(&delta.times(*n)),
                    Remaining::Symbol(key) if delta.is_constant() => {
                        let mut step = LinExpr::symbol(*key);
                        step = step.times(delta.constant);
                        now.plus(&step)
                    }
                    Remaining::Symbol(_) => state.fresh_merge(op, Interval::unbounded()),
                }
            };
            let delta_low = current.low.minus(&before.low);
            let delta_high = current.high.minus(&before.high);
            if delta_low == LinExpr::default() && delta_high == LinExpr::default() {
                continue;
            }
            let low = scale(self, &current.low, delta_low.clone());
            let high = scale(self, &current.high, delta_high.clone());

            let shrinking = !delta_low.is_constant() || delta_low.constant < 0.0;
            if shrinking {
                if let Some(by) = self.withdrawn_by.get(&r) {
                    pending.push(Constraint {
                        expr: low.clone(),
                        origin: ConstraintOrigin { operation: *by, fact: StateFact::SufficientContent, resource: r },
                    });
                }
            }
            let growing = !delta_high.is_constant() || delta_high.constant > 0.0;
            if growing {
                if let (Some(by), Some(cap)) = (self.deposited_by.get(&r), ctx.capacity(r)) {
                    pending.push(Constraint {
                        expr: LinExpr::constant(cap).minus(&high),
                        origin: ConstraintOrigin { operation: *by, fact: StateFact::WithinCapacity, resource: r },
                    });
                }
            }
            self.amounts.insert(r, Range { low, high });
        }
        self.add_constraints(ctx, pending)
    }

    fn join(self, other: Self, ctx: &Context<'_>, op: OperationId) -> (Self, Vec<QuantityFailure>) {
        let presence = self.presence.join_with(ctx, &other.presence);
        let mut joined = SymbolicState {
            presence,
            amounts: BTreeMap::new(),
            held: BTreeMap::new(),
            tip_capacity: BTreeMap::new(),
            domains: self.domains.clone(),
            constraints: self.constraints.clone(),
            withdrawn_by: self.withdrawn_by.clone(),
            deposited_by: self.deposited_by.clone(),
            merges: self.merges.max(other.merges),
        };
        for (k, d) in &other.domains {
            joined.domains.entry(*k).or_insert(*d);
        }
        for (r, op_id) in &other.withdrawn_by {
            joined.withdrawn_by.entry(*r).or_insert(*op_id);
        }
        for (r, op_id) in &other.deposited_by {
            joined.deposited_by.entry(*r).or_insert(*op_id);
        }

        let keys: BTreeSet<ResourceId> = self.amounts.keys().chain(other.amounts.keys()).copied().collect();
        for r in keys {
            let a = self.peek_amount(ctx, r);
            let b = other.peek_amount(ctx, r);
            let low = min_expr(&mut joined, op, &a.low, &b.low, true);
            let high = min_expr(&mut joined, op, &a.high, &b.high, false);
            joined.amounts.insert(r, Range { low, high });
        }
        let machines: BTreeSet<ResourceId> = self.held.keys().chain(other.held.keys()).copied().collect();
        for m in machines {
            let held = min_expr(&mut joined, op, &self.held(m), &other.held(m), true);
            joined.held.insert(m, held);
        }
        for (m, cap) in &self.tip_capacity {
            if let Some(other_cap) = other.tip_capacity.get(m) {
                joined.tip_capacity.insert(*m, cap.min(*other_cap));
            }
        }

        let extra: Vec<Constraint> = other
            .constraints
            .into_iter()
            .filter(|c| !self.constraints.contains(c))
            .collect();
        let failures = joined.add_constraints(ctx, extra);
        (joined, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(op: u32) -> ConstraintOrigin {
        ConstraintOrigin { operation: OperationId(op), fact: StateFact::SufficientContent, resource: ResourceId(0) }
    }

    fn initial(r: u32) -> LinExpr {
        LinExpr::symbol(SymbolKey::Initial(ResourceId(r)))
    }

    fn domains(cap: f64) -> BTreeMap<SymbolKey, Domain> {
        let mut d = BTreeMap::new();
        d.insert(SymbolKey::Initial(ResourceId(0)), Domain { interval: Interval::new(0.0, cap), controlled: true });
        d
    }

    #[test]
    fn expression_arithmetic() {
        let a = initial(0).minus(&LinExpr::constant(50.0));
        let b = a.plus(&LinExpr::constant(50.0));
        assert_eq!(b, initial(0));
        assert!(a.minus(&a).is_constant());
        let mut assignment = Assignment::new();
        assignment.insert(SymbolKey::Initial(ResourceId(0)), 80.0);
        assert_eq!(a.eval(&assignment), 30.0);
        assert_eq!(a.to_string(), "initial(r0) - 50");
    }

    #[test]
    fn propagation_finds_lower_bound() {
        let constraints = vec![Constraint { expr: initial(0).minus(&LinExpr::constant(50.0)), origin: origin(1) }];
        let prop = propagate(&domains(360.0), &constraints, &Assignment::new());
        assert!(prop.conflict.is_none());
        assert_eq!(prop.bounds[&SymbolKey::Initial(ResourceId(0))].lo, 50.0);
    }

    #[test]
    fn propagation_reports_conflicting_constraints() {
        let constraints = vec![
            Constraint { expr: initial(0).minus(&LinExpr::constant(50.0)), origin: origin(1) },
            Constraint { expr: initial(0).minus(&LinExpr::constant(400.0)), origin: origin(2) },
        ];
        let prop = propagate(&domains(360.0), &constraints, &Assignment::new());
        let conflict = prop.conflict.unwrap();
        assert!(conflict.contains(&1));
        assert!(!conflict.contains(&0));
    }

    #[test]
    fn pinned_symbols_are_respected() {
        let v = LinExpr::symbol(SymbolKey::Volume(OperationId(3)));
        let constraints = vec![Constraint { expr: initial(0).minus(&v), origin: origin(3) }];
        let mut d = domains(360.0);
        d.insert(SymbolKey::Volume(OperationId(3)), Domain { interval: Interval::new(0.0, 1000.0), controlled: false });
        let mut fixed = Assignment::new();
        fixed.insert(SymbolKey::Volume(OperationId(3)), 500.0);
        let prop = propagate(&d, &constraints, &fixed);
        assert!(prop.conflict.is_some());
        fixed.insert(SymbolKey::Volume(OperationId(3)), 120.0);
        let prop = propagate(&d, &constraints, &fixed);
        assert!(prop.conflict.is_none());
        assert_eq!(prop.bounds[&SymbolKey::Initial(ResourceId(0))].lo, 120.0);
    }

    #[test]
    fn runtime_symbols_make_edge_cases() {
        let mut state = SymbolicState::default();
        state.domains = domains(360.0);
        state
            .domains
            .insert(SymbolKey::Volume(OperationId(3)), Domain { interval: Interval::new(0.0, 1000.0), controlled: false });
        state.constraints.push(Constraint {
            expr: initial(0).minus(&LinExpr::symbol(SymbolKey::Volume(OperationId(3)))),
            origin: origin(3),
        });
        state.constraints.push(Constraint { expr: LinExpr::constant(10.0), origin: origin(4) });
        state.constraints.push(Constraint { expr: LinExpr::constant(0.0), origin: origin(5) });
        let edges: Vec<OperationId> = state.edge_cases().into_iter().map(|o| o.operation).collect();
        assert_eq!(edges, vec![OperationId(3), OperationId(5)]);
        assert_eq!(state.sampled_domains().len(), 1);
    }
}
