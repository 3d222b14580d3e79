//! End-to-end analysis scenarios: source text in, records and reports out.

use labtrace_check::simulator::{BooleanState, SymbolicState};
use labtrace_check::{
    trace_procedure, AnalysisConfig, Analyzer, BoundsAnalyzer, ContractDatabase, FailureModeDetector,
    FailureSearchConfig, HierarchicalSimulator, SimulationState,
};
use labtrace_core::{
    AnalysisOutcome, AnalysisRecord, BindingValue, DeckTopology, HierarchyRegistry, OperationId,
    ProtocolComputationGraph, ResourceCatalog, SimulationLevel, StateFact,
};
use labtrace_extract::{extract_procedure, ParsedModule, ProcedureSource};
use labtrace_storage::InMemoryCache;
use proptest::prelude::*;

const LINEAR: &str = r#"
async def protocol(lh: LiquidHandler, tips: TipRack, source: Plate, dest: Plate):
    await lh.pick_up_tips(tips["A1"])
    await lh.aspirate(source["A1"], vols=[50])
    await lh.dispense(dest["A1"], vols=[50])
    await lh.drop_tips(tips["A1"])
"#;

const WITH_HELPER: &str = r#"
async def move(lh, src, dst, vol):
    await lh.aspirate(src, vols=[vol])
    await lh.dispense(dst, vols=[vol])

async def protocol(lh: LiquidHandler, tips: TipRack, source: Plate, dest: Plate):
    await lh.pick_up_tips(tips["A1"])
    await move(lh, source["A1"], dest["A1"], 50)
    await lh.drop_tips(tips["A1"])
"#;

const BRANCHED: &str = r#"
async def protocol(lh: LiquidHandler, tips: TipRack, source: Plate, dest: Plate, fast: bool):
    await lh.pick_up_tips(tips["A1"])
    if fast:
        await lh.aspirate(source["A1"], vols=[50])
        await lh.dispense(dest["A1"], vols=[50])
    else:
        await lh.aspirate(dest["A1"], vols=[50])
        await lh.dispense(source["A1"], vols=[50])
    await lh.drop_tips(tips["A1"])
"#;

const LOOPED: &str = r#"
async def protocol(lh: LiquidHandler, tips: TipRack, plate: Plate, dest: Plate):
    await lh.pick_up_tips(tips["A1"])
    for well in plate["A1:H1"]:
        await lh.aspirate(well, vols=[40])
        await lh.dispense(dest["A1"], vols=[40])
    await lh.drop_tips(tips["A1"])
"#;

const MULTI_HOP: &str = r#"
async def protocol(lh: LiquidHandler, tips: TipRack, source: Plate, mid: Plate, dest: Plate):
    await lh.pick_up_tips(tips["A1"])
    await lh.aspirate(source["A1"], vols=[50])
    await lh.dispense(mid["A1"], vols=[50])
    await lh.aspirate(mid["A1"], vols=[50])
    await lh.dispense(dest["A1"], vols=[50])
    await lh.drop_tips(tips["A1"])
"#;

const NO_TIPS: &str = r#"
async def protocol(lh: LiquidHandler, source: Plate, dest: Plate):
    await lh.aspirate(source["A1"], vols=[50])
    await lh.dispense(dest["A1"], vols=[50])
"#;

fn analyze(source: &str) -> AnalysisRecord {
    let analyzer = Analyzer::standard(AnalysisConfig::default()).unwrap();
    analyzer.analyze(&ProcedureSource::new("protocol", source), &InMemoryCache::new()).unwrap()
}

fn extract(source: &str) -> ProtocolComputationGraph {
    let module = ParsedModule::parse(source).unwrap();
    extract_procedure(&module, "protocol", &HierarchyRegistry::standard(), DeckTopology::SlotBased)
        .unwrap()
        .graph
}

fn op_names(graph: &ProtocolComputationGraph) -> Vec<&str> {
    graph.operations().iter().map(|o| o.name.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Requirements
// ---------------------------------------------------------------------------

#[test]
fn linear_transfer_needs_its_labware_placed() {
    let record = analyze(LINEAR);
    assert!(record.is_analyzable());
    assert!(record.violations.is_empty(), "unexpected violations: {:?}", record.violations);

    let names: Vec<&str> = record.inferred_requirements.iter().map(|r| r.resource.as_str()).collect();
    assert_eq!(names, vec!["tips", "source", "dest"]);
    assert!(record.inferred_requirements.iter().all(|r| r.facts.contains(&StateFact::OnDeck)));

    let source = &record.inferred_requirements[1];
    assert!(source.facts.contains(&StateFact::HasContent));
    assert!(source.details.contains(&"source[\"A1\"]".to_string()));
}

#[test]
fn preconditions_are_attached_to_the_accessed_well() {
    let record = analyze(LINEAR);
    let graph = &record.computation_graph;
    let found = graph.preconditions().iter().any(|p| {
        p.fact == StateFact::HasContent && graph.resource(p.resource).is_some_and(|r| r.name == "source[\"A1\"]")
    });
    assert!(found, "no content precondition on source[\"A1\"]: {:?}", graph.preconditions());
}

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

#[test]
fn aspirating_without_tips_is_reported_once() {
    let record = analyze(NO_TIPS);
    assert!(record.is_analyzable());
    assert_eq!(record.violations.len(), 1, "{:?}", record.violations);
    let violation = &record.violations[0];
    assert_eq!(violation.operation_name, "aspirate");
    assert_eq!(violation.level, SimulationLevel::Boolean);
    assert_eq!(violation.suggested_fix, "pick up tips before aspirating");
}

#[test]
fn unknown_methods_stop_at_the_structural_level() {
    let source = r#"
async def protocol(lh: LiquidHandler):
    await lh.fly()
"#;
    let record = analyze(source);
    match &record.outcome {
        AnalysisOutcome::CannotAnalyze { errors } => assert!(!errors.is_empty()),
        other => panic!("expected a structural failure, got {other:?}"),
    }

    let contracts = ContractDatabase::standard();
    let catalog = ResourceCatalog::standard();
    let config = AnalysisConfig::default();
    let report = HierarchicalSimulator::new(&contracts, &catalog, &config).simulate(&extract(source));
    assert!(!report.is_structurally_valid());
    assert_eq!(report.levels.len(), 1);
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

#[test]
fn loop_over_plate_wells_is_bounded_by_the_catalog() {
    let graph = extract(
        r#"
async def protocol(lh: LiquidHandler, plate: Plate):
    for well in plate.children:
        await lh.aspirate(well, vols=[5])
"#,
    );
    assert_eq!(op_names(&graph)[0], "for");
    let catalog = ResourceCatalog::standard();
    let bounds = BoundsAnalyzer::new(&graph, &catalog);
    assert_eq!(bounds.loop_bound(OperationId(0)).count(), Some(96));
    assert_eq!(bounds.enclosing_multiplier(OperationId(1)), Some(96));
}

proptest! {
    #[test]
    fn nested_range_loops_multiply(outer in 0u64..20, inner in 0u64..20) {
        let graph = extract(&format!(
            "async def protocol(lh: LiquidHandler, plate: Plate):\n    for i in range({outer}):\n        for j in range({inner}):\n            await lh.aspirate(plate[\"A1\"], vols=[5])\n"
        ));
        let catalog = ResourceCatalog::standard();
        let bounds = BoundsAnalyzer::new(&graph, &catalog);
        prop_assert_eq!(bounds.loop_bound(OperationId(1)).count(), Some(inner));
        prop_assert_eq!(bounds.enclosing_multiplier(OperationId(2)), Some(outer * inner));
    }
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

#[test]
fn fresh_analyses_agree() {
    let first = analyze(NO_TIPS);
    let second = analyze(NO_TIPS);
    assert_eq!(
        serde_json::to_string(&first.inferred_requirements).unwrap(),
        serde_json::to_string(&second.inferred_requirements).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&first.failure_modes).unwrap(),
        serde_json::to_string(&second.failure_modes).unwrap()
    );
    assert_eq!(first.content_hash, second.content_hash);
}

#[test]
fn pruning_finds_the_same_failures_as_exhaustive_search() {
    let contracts = ContractDatabase::standard();
    let catalog = ResourceCatalog::standard();
    let config = AnalysisConfig::default();
    let simulator = HierarchicalSimulator::new(&contracts, &catalog, &config);

    for (name, source) in [("linear", LINEAR), ("branched", BRANCHED), ("looped", LOOPED), ("multi-hop", MULTI_HOP)] {
        let graph = extract(source);
        let report = simulator.simulate(&graph);
        let pruned = FailureModeDetector::new(&simulator, FailureSearchConfig { pruning: true, ..Default::default() })
            .search(&graph, &report);
        let exhaustive =
            FailureModeDetector::new(&simulator, FailureSearchConfig { pruning: false, ..Default::default() })
                .search(&graph, &report);
        assert!(!exhaustive.truncated, "{name}");
        assert!(!exhaustive.pair_set().is_empty(), "{name}: no failing candidates");
        assert_eq!(pruned.pair_set(), exhaustive.pair_set(), "{name}");
        assert!(pruned.simulated <= exhaustive.simulated, "{name}");
    }
}

#[test]
fn either_arm_of_a_branch_can_fail() {
    let graph = extract(BRANCHED);
    let contracts = ContractDatabase::standard();
    let catalog = ResourceCatalog::standard();
    let config = AnalysisConfig::default();
    let simulator = HierarchicalSimulator::new(&contracts, &catalog, &config);
    let report = simulator.simulate(&graph);
    let search = FailureModeDetector::new(&simulator, FailureSearchConfig::default()).search(&graph, &report);

    let failing: Vec<&str> = search
        .modes
        .iter()
        .filter(|m| m.violation.fact == StateFact::HasContent)
        .filter_map(|m| graph.resource(m.violation.resource).map(|r| r.name.as_str()))
        .collect();
    assert!(failing.contains(&"source[\"A1\"]"), "{failing:?}");
    assert!(failing.contains(&"dest[\"A1\"]"), "{failing:?}");
}

// ---------------------------------------------------------------------------
// Loop quantities
// ---------------------------------------------------------------------------

fn plate_quantity(record: &AnalysisRecord, name: &str) -> Option<f64> {
    record
        .inferred_requirements
        .iter()
        .find(|r| r.resource == name)
        .and_then(|r| r.quantity.as_ref())
        .map(|q| q.amount)
}

#[test]
fn each_loop_element_is_drawn_from_once() {
    let record = analyze(LOOPED);
    assert!(record.violations.is_empty(), "{:?}", record.violations);
    assert_eq!(plate_quantity(&record, "plate"), Some(40.0));
}

#[test]
fn large_per_well_withdrawals_fit_each_well() {
    let record = analyze(
        r#"
async def protocol(lh: LiquidHandler, tips: TipRack, plate: Plate, waste: Trough):
    await lh.pick_up_tips(tips["A1"])
    for well in plate["A1:H1"]:
        await lh.aspirate(well, vols=[200])
        await lh.dispense(waste["A1"], vols=[200])
    await lh.drop_tips(tips["A1"])
"#,
    );
    assert!(record.is_analyzable());
    assert!(record.violations.is_empty(), "{:?}", record.violations);
    assert_eq!(plate_quantity(&record, "plate"), Some(200.0));
}

#[test]
fn fixed_targets_inside_loops_still_accumulate() {
    let record = analyze(
        r#"
async def protocol(lh: LiquidHandler, tips: TipRack, plate: Plate, dest: Plate):
    await lh.pick_up_tips(tips["A1"])
    for well in plate["A1:H1"]:
        await lh.aspirate(well, vols=[100])
        await lh.dispense(dest["A1"], vols=[100])
    await lh.drop_tips(tips["A1"])
"#,
    );
    assert_eq!(record.violations.len(), 1, "{:?}", record.violations);
    let overflow = &record.violations[0];
    assert_eq!(overflow.operation_name, "dispense");
    assert_eq!(overflow.level, SimulationLevel::Symbolic);
    assert_eq!(plate_quantity(&record, "plate"), Some(100.0));
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

#[test]
fn promotion_keeps_presence_facts() {
    let graph = extract(LINEAR);
    let contracts = ContractDatabase::standard();
    let catalog = ResourceCatalog::standard();
    let config = AnalysisConfig::default();
    let simulator = HierarchicalSimulator::new(&contracts, &catalog, &config);

    let run = simulator.run_level(&graph, SimulationState::Boolean(BooleanState::new()));
    assert!(run.violations.is_empty());
    let presence = run.state.to_boolean();
    for level in [SimulationLevel::Symbolic, SimulationLevel::Exact] {
        let promoted = run.state.promote(level).unwrap();
        assert_eq!(promoted.level(), level);
        assert_eq!(promoted.to_boolean(), presence);
    }
}

fn presence_violations(violations: &[labtrace_check::StateViolation]) -> Vec<(OperationId, StateFact)> {
    violations
        .iter()
        .filter(|v| !QUANTITY_FACTS.contains(&v.fact))
        .map(|v| (v.operation, v.fact))
        .collect()
}

const QUANTITY_FACTS: [StateFact; 4] = [
    StateFact::SufficientContent,
    StateFact::WithinCapacity,
    StateFact::WithinTipVolume,
    StateFact::SufficientHeld,
];

#[test]
fn promoted_levels_agree_on_presence() {
    let contracts = ContractDatabase::standard();
    let catalog = ResourceCatalog::standard();
    let config = AnalysisConfig::default();
    let simulator = HierarchicalSimulator::new(&contracts, &catalog, &config);

    for (name, source) in [("linear", LINEAR), ("branched", BRANCHED), ("looped", LOOPED), ("no tips", NO_TIPS)] {
        let graph = extract(source);
        let boolean = simulator.run_level(&graph, SimulationState::Boolean(BooleanState::new()));
        let facts = boolean.state.to_boolean().facts();
        for level in [SimulationLevel::Symbolic, SimulationLevel::Exact] {
            let start = SimulationState::Boolean(BooleanState::new()).promote(level).unwrap();
            let run = simulator.run_level(&graph, start);
            assert_eq!(run.state.level(), level, "{name}");
            assert_eq!(run.state.to_boolean().facts(), facts, "{name} at {level:?}");
            assert_eq!(
                presence_violations(&run.violations),
                presence_violations(&boolean.violations),
                "{name} at {level:?}"
            );
        }
    }
}

#[test]
fn symbolic_replay_from_bare_presence_matches_promotion() {
    let graph = extract(MULTI_HOP);
    let contracts = ContractDatabase::standard();
    let catalog = ResourceCatalog::standard();
    let config = AnalysisConfig::default();
    let simulator = HierarchicalSimulator::new(&contracts, &catalog, &config);

    let direct = simulator.run_level(
        &graph,
        SimulationState::Symbolic(SymbolicState::from_presence(BooleanState::new())),
    );
    let promoted = simulator.run_level(
        &graph,
        SimulationState::Boolean(BooleanState::new()).promote(SimulationLevel::Symbolic).unwrap(),
    );
    assert!(direct.violations.is_empty(), "{:?}", direct.violations);
    assert_eq!(direct.state.to_boolean(), promoted.state.to_boolean());
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

#[test]
fn traced_helpers_match_the_inlined_procedure() {
    let inlined = extract(LINEAR);
    let module = ParsedModule::parse(WITH_HELPER).unwrap();
    let trace = trace_procedure(
        &module,
        "protocol",
        &HierarchyRegistry::standard(),
        DeckTopology::SlotBased,
        AnalysisConfig::default().tracer,
    )
    .unwrap();

    assert_eq!(op_names(&trace.graph), op_names(&inlined));
    for (traced, direct) in trace.graph.operations().iter().zip(inlined.operations()) {
        let resources = |graph: &ProtocolComputationGraph, op: &labtrace_core::OperationNode| -> Vec<String> {
            op.resource_arguments()
                .filter_map(|r| graph.resource(r).map(|n| n.name.clone()))
                .collect()
        };
        assert_eq!(resources(&trace.graph, traced), resources(&inlined, direct));
        let literals = |op: &labtrace_core::OperationNode| -> Vec<BindingValue> {
            op.bindings
                .iter()
                .filter(|b| matches!(b.value, BindingValue::Literal(_)))
                .map(|b| b.value.clone())
                .collect()
        };
        assert_eq!(literals(traced), literals(direct));
    }
}

#[test]
fn unresolved_helpers_fall_back_to_tracing() {
    let record = analyze(WITH_HELPER);
    assert!(record.is_analyzable());
    assert!(record.violations.is_empty(), "{:?}", record.violations);
    assert_eq!(op_names(&record.computation_graph), vec!["pick_up_tips", "aspirate", "dispense", "drop_tips"]);
}
