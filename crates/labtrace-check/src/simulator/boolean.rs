//! Presence flags: on deck, has content, has tips.
//!
//! Facts are three-valued. A fact set on a resource holds for everything
//! derived from it until overwritten closer to the leaf; a fact nobody set
//! comes from the initial state, and every such read is recorded so the
//! failure search can tell which initial facts a run depended on.

use std::collections::{BTreeMap, BTreeSet};

use labtrace_core::{OperationId, ResourceId, SimulationLevel, StateFact};
use serde::Serialize;

use super::{AbstractState, Context, QuantityChange, QuantityCheck, QuantityFailure, VolumeValue};
use crate::bounds::LoopBound;

/// A presence fact about one resource or machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FactKey {
    /// Keyed by placement root.
    OnDeck(ResourceId),
    Content(ResourceId),
    Capacity(ResourceId),
    TipsLoaded(ResourceId),
    Holding(ResourceId),
}

impl FactKey {
    pub fn resource(&self) -> ResourceId {
        match self {
            FactKey::OnDeck(r)
            | FactKey::Content(r)
            | FactKey::Capacity(r)
            | FactKey::TipsLoaded(r)
            | FactKey::Holding(r) => *r,
        }
    }

    fn with_resource(&self, r: ResourceId) -> FactKey {
        match self {
            FactKey::OnDeck(_) => FactKey::OnDeck(r),
            FactKey::Content(_) => FactKey::Content(r),
            FactKey::Capacity(_) => FactKey::Capacity(r),
            FactKey::TipsLoaded(_) => FactKey::TipsLoaded(r),
            FactKey::Holding(_) => FactKey::Holding(r),
        }
    }

    /// Value when the initial state says nothing: the environment is
    /// assumed ready, machines start idle.
    pub fn default_value(&self) -> bool {
        matches!(self, FactKey::OnDeck(_) | FactKey::Content(_) | FactKey::Capacity(_))
    }

    pub fn is_machine(&self) -> bool {
        matches!(self, FactKey::TipsLoaded(_) | FactKey::Holding(_))
    }
}

/// An environment or machine fact taken from the initial state and relied
/// on by some operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Assumption {
    pub resource: ResourceId,
    pub fact: StateFact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    value: Option<bool>,
    by: Option<OperationId>,
}

/// The value of a fact and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lookup {
    pub value: Option<bool>,
    /// Operation that last set it.
    pub by: Option<OperationId>,
    /// At least part of the value came from the initial state.
    pub from_initial: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BooleanState {
    facts: BTreeMap<FactKey, Entry>,
    initial: BTreeMap<FactKey, bool>,
    reads: BTreeMap<FactKey, bool>,
    /// Where each machine's current tips came from.
    tip_origin: BTreeMap<ResourceId, ResourceId>,
}

impl BooleanState {
    pub fn new() -> Self {
        BooleanState::default()
    }

    /// A state whose initial facts deviate from the defaults.
    pub fn with_initial(initial: BTreeMap<FactKey, bool>) -> Self {
        BooleanState { initial, ..BooleanState::default() }
    }

    /// Facts set during the run.
    pub fn facts(&self) -> BTreeMap<FactKey, Option<bool>> {
        self.facts.iter().map(|(k, e)| (*k, e.value)).collect()
    }

    pub fn initial(&self) -> &BTreeMap<FactKey, bool> {
        &self.initial
    }

    /// Initial-state facts read so far, with the values seen.
    pub fn reads(&self) -> &BTreeMap<FactKey, bool> {
        &self.reads
    }

    pub(crate) fn tip_origin(&self, machine: ResourceId) -> Option<ResourceId> {
        self.tip_origin.get(&machine).copied()
    }

    pub(crate) fn set_tip_origin(&mut self, machine: ResourceId, source: Option<ResourceId>) {
        match source {
            Some(s) => self.tip_origin.insert(machine, s),
            None => self.tip_origin.remove(&machine),
        };
    }

    /// Keys a fact about `key.resource()` is stored under.
    fn targets(ctx: &Context<'_>, key: FactKey) -> Vec<FactKey> {
        let r = key.resource();
        match key {
            FactKey::OnDeck(_) => ctx.placeable_roots(r).into_iter().map(FactKey::OnDeck).collect(),
            FactKey::Content(_) | FactKey::Capacity(_) => {
                ctx.members(r).into_iter().map(|m| key.with_resource(m)).collect()
            }
            FactKey::TipsLoaded(_) | FactKey::Holding(_) => vec![key],
        }
    }

    /// Resolves one stored key through the lineage, falling back to the
    /// initial state. Returns the initial key read, if any.
    fn resolve_one(&self, ctx: &Context<'_>, key: FactKey) -> (Entry, Option<(FactKey, bool)>) {
        let lineage = match key {
            FactKey::Content(r) | FactKey::Capacity(r) => ctx.graph.lineage(r),
            _ => vec![key.resource()],
        };
        for r in &lineage {
            if let Some(entry) = self.facts.get(&key.with_resource(*r)) {
                return (*entry, None);
            }
        }
        let top = key.with_resource(lineage.last().copied().unwrap_or(key.resource()));
        let value = self.initial.get(&top).copied().unwrap_or_else(|| top.default_value());
        (Entry { value: Some(value), by: None }, Some((top, value)))
    }

    fn resolve(&self, ctx: &Context<'_>, key: FactKey) -> (Lookup, Vec<(FactKey, bool)>) {
        let mut lookup = Lookup { value: Some(true), by: None, from_initial: false };
        let mut reads = Vec::new();
        for target in Self::targets(ctx, key) {
            let (entry, read) = self.resolve_one(ctx, target);
            lookup.value = match (lookup.value, entry.value) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            };
            lookup.by = lookup.by.or(entry.by);
            if let Some(read) = read {
                lookup.from_initial = true;
                reads.push(read);
            }
        }
        (lookup, reads)
    }

    /// Reads a fact, recording any initial-state dependency.
    pub(crate) fn lookup(&mut self, ctx: &Context<'_>, key: FactKey) -> Lookup {
        let (lookup, reads) = self.resolve(ctx, key);
        self.reads.extend(reads);
        lookup
    }

    pub(crate) fn set(&mut self, ctx: &Context<'_>, key: FactKey, value: Option<bool>, by: Option<OperationId>) {
        for target in Self::targets(ctx, key) {
            self.facts.insert(target, Entry { value, by });
        }
    }

    /// Drops facts stored on `resources`.
    pub(crate) fn reset(&mut self, resources: &BTreeSet<ResourceId>) {
        self.facts.retain(|k, _| k.is_machine() || !resources.contains(&k.resource()));
    }

    /// Copies content facts of a loop element onto its collection.
    pub(crate) fn merge_element(&mut self, element: ResourceId, collection: ResourceId) {
        for key in [FactKey::Content(element), FactKey::Capacity(element)] {
            if let Some(entry) = self.facts.get(&key).copied() {
                self.facts.insert(key.with_resource(collection), entry);
            }
        }
    }

    /// Keeps the initial-fact reads of a branch that halted before joining.
    pub(crate) fn absorb_reads(&mut self, other: &BooleanState) {
        self.reads.extend(other.reads.iter().map(|(k, v)| (*k, *v)));
    }

    /// Facts that agree in both states keep their value; the rest become
    /// unknown.
    pub(crate) fn join_with(&self, ctx: &Context<'_>, other: &BooleanState) -> BooleanState {
        let keys: BTreeSet<FactKey> = self.facts.keys().chain(other.facts.keys()).copied().collect();
        let mut facts = BTreeMap::new();
        let mut reads = self.reads.clone();
        reads.extend(other.reads.iter().map(|(k, v)| (*k, *v)));
        let mut side = |state: &BooleanState, key: FactKey| match state.facts.get(&key) {
            Some(entry) => *entry,
            None => {
                let (lookup, read) = state.resolve(ctx, key);
                reads.extend(read);
                Entry { value: lookup.value, by: None }
            }
        };
        for key in keys {
            let a = side(self, key);
            let b = side(other, key);
            let value = if a.value == b.value { a.value } else { None };
            let by = if a.by == b.by { a.by } else { None };
            facts.insert(key, Entry { value, by });
        }
        let tip_origin = self
            .tip_origin
            .iter()
            .filter(|(m, s)| other.tip_origin.get(m) == Some(s))
            .map(|(m, s)| (*m, *s))
            .collect();
        BooleanState { facts, initial: self.initial.clone(), reads, tip_origin }
    }
}

/// The presence-only level: no quantities are tracked.
impl AbstractState for BooleanState {
    type Amount = ();
    const LEVEL: SimulationLevel = SimulationLevel::Boolean;

    fn presence(&self) -> &BooleanState {
        self
    }

    fn presence_mut(&mut self) -> &mut BooleanState {
        self
    }

    fn volume(&mut self, _ctx: &Context<'_>, _op: OperationId, _value: VolumeValue) -> Option<()> {
        None
    }

    fn check(&mut self, _ctx: &Context<'_>, _op: OperationId, _check: QuantityCheck<()>) -> Option<QuantityFailure> {
        None
    }

    fn apply(&mut self, _ctx: &Context<'_>, _op: OperationId, _change: QuantityChange<()>) {}

    fn reset(&mut self, resources: &BTreeSet<ResourceId>) {
        BooleanState::reset(self, resources);
    }

    fn merge_element(&mut self, element: ResourceId, collection: ResourceId) {
        BooleanState::merge_element(self, element, collection);
    }

    fn scale_loop(
        &mut self,
        _ctx: &Context<'_>,
        _op: OperationId,
        _previous: &Self,
        _bound: &LoopBound,
        _replayed: u64,
        _unscaled: &BTreeSet<ResourceId>,
    ) -> Vec<QuantityFailure> {
        Vec::new()
    }

    fn join(self, other: Self, ctx: &Context<'_>, _op: OperationId) -> (Self, Vec<QuantityFailure>) {
        (self.join_with(ctx, &other), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ContractDatabase;
    use labtrace_core::{
        Access, AccessKey, DeclaredType, DeckTopology, HierarchyRegistry, ProtocolComputationGraph, ResourceCatalog,
        ResourceOrigin,
    };

    fn graph() -> (ProtocolComputationGraph, ResourceId, ResourceId, ResourceId) {
        let hierarchy = HierarchyRegistry::standard();
        let mut graph = ProtocolComputationGraph::new("p");
        let declared = DeclaredType::parse("LiquidHandler");
        let chain = hierarchy.chain_for_opt(declared.placement_kind(), DeckTopology::SlotBased);
        let lh = graph.add_resource("lh", declared, chain, ResourceOrigin::Parameter { index: 0 }).unwrap();
        let declared = DeclaredType::parse("Plate");
        let chain = hierarchy.chain_for_opt(declared.placement_kind(), DeckTopology::SlotBased);
        let plate = graph.add_resource("plate", declared, chain, ResourceOrigin::Parameter { index: 1 }).unwrap();
        let access = Access::Subscript { key: AccessKey::Label("A1".into()) };
        let well = graph
            .add_resource(
                "plate[\"A1\"]",
                DeclaredType::parse("list[Well]"),
                Default::default(),
                ResourceOrigin::Derived { from: plate, access },
            )
            .unwrap();
        (graph, lh, plate, well)
    }

    #[test]
    fn defaults_are_read_from_lineage_top() {
        let (graph, lh, plate, well) = graph();
        let catalog = ResourceCatalog::standard();
        let contracts = ContractDatabase::standard();
        let ctx = Context::new(&graph, &catalog, &contracts, 2);

        let mut state = BooleanState::new();
        let content = state.lookup(&ctx, FactKey::Content(well));
        assert_eq!(content.value, Some(true));
        assert!(content.from_initial);
        let tips = state.lookup(&ctx, FactKey::TipsLoaded(lh));
        assert_eq!(tips.value, Some(false));
        assert_eq!(state.reads()[&FactKey::Content(plate)], true);
        assert_eq!(state.reads()[&FactKey::TipsLoaded(lh)], false);
    }

    #[test]
    fn set_facts_shadow_initial_values() {
        let (graph, _, plate, well) = graph();
        let catalog = ResourceCatalog::standard();
        let contracts = ContractDatabase::standard();
        let ctx = Context::new(&graph, &catalog, &contracts, 2);

        let mut initial = BTreeMap::new();
        initial.insert(FactKey::Content(plate), false);
        let mut state = BooleanState::with_initial(initial);
        assert_eq!(state.lookup(&ctx, FactKey::Content(well)).value, Some(false));

        state.set(&ctx, FactKey::Content(well), Some(true), Some(OperationId(4)));
        let look = state.lookup(&ctx, FactKey::Content(well));
        assert_eq!(look.value, Some(true));
        assert_eq!(look.by, Some(OperationId(4)));
        assert!(!look.from_initial);
    }

    #[test]
    fn on_deck_keys_by_placement_root_and_skips_machines() {
        let (graph, lh, plate, well) = graph();
        let catalog = ResourceCatalog::standard();
        let contracts = ContractDatabase::standard();
        let ctx = Context::new(&graph, &catalog, &contracts, 2);

        let mut state = BooleanState::new();
        state.set(&ctx, FactKey::OnDeck(well), Some(false), None);
        assert_eq!(state.facts()[&FactKey::OnDeck(plate)], Some(false));
        let look = state.lookup(&ctx, FactKey::OnDeck(lh));
        assert_eq!(look.value, Some(true));
        assert!(!look.from_initial);
    }

    #[test]
    fn join_makes_disagreements_unknown() {
        let (graph, lh, _, well) = graph();
        let catalog = ResourceCatalog::standard();
        let contracts = ContractDatabase::standard();
        let ctx = Context::new(&graph, &catalog, &contracts, 2);

        let base = BooleanState::new();
        let mut a = base.clone();
        a.set(&ctx, FactKey::TipsLoaded(lh), Some(true), Some(OperationId(1)));
        a.set(&ctx, FactKey::Content(well), Some(true), Some(OperationId(1)));
        let mut b = base;
        b.set(&ctx, FactKey::Content(well), Some(true), Some(OperationId(2)));

        let joined = a.join_with(&ctx, &b);
        let facts = joined.facts();
        assert_eq!(facts[&FactKey::TipsLoaded(lh)], None);
        assert_eq!(facts[&FactKey::Content(well)], Some(true));
    }
}
