//! Inferred setup requirements.
//!
//! Environment facts the presence run assumed become requirements on the
//! placement roots they reach: the parameter that must be placed, with the
//! ancestor chain its kind needs and, where derivable, how much it must
//! start with.

use std::collections::{BTreeMap, BTreeSet};

use labtrace_core::{
    InferredRequirement, MachineRequirement, ProtocolComputationGraph, Quantity, QuantityUnit, ResourceCatalog,
    ResourceId, ResourceKind, StateFact,
};

use crate::contracts::{ContractDatabase, Effect};
use crate::simulator::{Context, SimulationReport};

#[derive(Default)]
struct Gathered {
    facts: BTreeSet<StateFact>,
    details: BTreeSet<String>,
}

/// Requirements per placement root, in resource order.
pub fn infer_requirements(
    graph: &ProtocolComputationGraph,
    report: &SimulationReport,
    catalog: &ResourceCatalog,
    contracts: &ContractDatabase,
) -> Vec<InferredRequirement> {
    let ctx = Context::new(graph, catalog, contracts, 1);
    let mut roots: BTreeMap<ResourceId, Gathered> = BTreeMap::new();
    for assumption in &report.assumptions {
        if !assumption.fact.is_environmental() {
            continue;
        }
        for root in ctx.placeable_roots(assumption.resource) {
            let gathered = roots.entry(root).or_default();
            gathered.facts.insert(assumption.fact);
            if assumption.resource != root {
                if let Some(node) = graph.resource(assumption.resource) {
                    gathered.details.insert(node.name.clone());
                }
            }
        }
    }

    roots
        .into_iter()
        .filter_map(|(root, gathered)| {
            let node = graph.resource(root)?;
            let kind = node.placement_kind();
            let quantity = match kind {
                Some(k) if holds_tips(k) => tip_count(&ctx, root).map(|n| Quantity {
                    amount: n as f64,
                    unit: QuantityUnit::Items,
                }),
                _ => report
                    .minimum_quantities
                    .get(&root)
                    .filter(|v| **v > 0.0)
                    .map(|v| Quantity { amount: *v, unit: QuantityUnit::Microliters }),
            };
            Some(InferredRequirement {
                resource: node.name.clone(),
                kind,
                required_chain: node.chain.clone(),
                facts: gathered.facts.into_iter().collect(),
                quantity,
                details: gathered.details.into_iter().collect(),
            })
        })
        .collect()
}

/// Machines whose starting state the run relied on.
pub fn machine_requirements(graph: &ProtocolComputationGraph, report: &SimulationReport) -> Vec<MachineRequirement> {
    let machines: BTreeSet<ResourceId> = report
        .assumptions
        .iter()
        .filter(|a| a.fact == StateFact::TipsEmpty)
        .map(|a| a.resource)
        .collect();
    machines
        .into_iter()
        .filter_map(|m| {
            let node = graph.resource(m)?;
            Some(MachineRequirement { machine: node.name.clone(), tips_empty: true })
        })
        .collect()
}

fn holds_tips(kind: ResourceKind) -> bool {
    matches!(kind, ResourceKind::TipRack | ResourceKind::TipSpot | ResourceKind::Tip)
}

/// Tips picked up from `root` over the whole run; `None` when a pick-up
/// sits in an unbounded loop or takes an uncountable selection.
fn tip_count(ctx: &Context<'_>, root: ResourceId) -> Option<u64> {
    let mut total = 0u64;
    for op in ctx.graph.calls() {
        let Some(contract) = ctx.entry(op.id).and_then(|e| e.contract.as_ref()) else {
            continue;
        };
        for effect in &contract.effects {
            let Effect::LoadTips { from } = effect else {
                continue;
            };
            let Some(labtrace_core::BindingValue::Resource(source)) =
                op.argument(from.name, from.index).map(|b| &b.value)
            else {
                continue;
            };
            if !ctx.placeable_roots(*source).contains(&root) {
                continue;
            }
            let node = ctx.graph.resource(*source)?;
            let picked = if node.is_collection() || node.kind().is_some_and(|k| k.item_kind().is_some()) {
                ctx.bounds.collection_size(*source)?
            } else {
                1
            };
            total += picked * ctx.bounds.enclosing_multiplier(op.id)?;
        }
    }
    (total > 0).then_some(total)
}
