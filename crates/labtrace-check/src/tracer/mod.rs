//! Dynamic tracing.
//!
//! The fallback when static extraction meets calls it cannot see through.
//! The procedure body is interpreted with stand-ins bound to its
//! parameters; every interaction with a resource is reported to an
//! explicit [`Recorder`], and the recorded events are assembled into the
//! same graph type the extractor produces.

mod assemble;
mod interp;
mod recorder;
mod value;

use labtrace_core::{AnalysisWarning, DeckTopology, HierarchyRegistry, ProtocolComputationGraph};
use labtrace_extract::{signature_of, ExtractError, ParsedModule, ProcedureSignature};
use tracing::debug;

use crate::config::TracerLimits;
use crate::error::CheckError;
use interp::TraceInterpreter;

// Re-export
pub use assemble::assemble_graph;
pub use recorder::{RecordedResource, Recorder, TraceEvent};
pub use value::{Interact, Iteration, Proxy, TracedArg, Truth};

/// Result of tracing one procedure.
#[derive(Debug, Clone)]
pub struct Trace {
    pub signature: ProcedureSignature,
    pub graph: ProtocolComputationGraph,
    pub events: Vec<TraceEvent>,
    /// Statements the tracer skipped.
    pub warnings: Vec<AnalysisWarning>,
}

/// Traces procedure `name` of `module`.
pub fn trace_procedure(
    module: &ParsedModule,
    name: &str,
    hierarchy: &HierarchyRegistry,
    topology: DeckTopology,
    limits: TracerLimits,
) -> Result<Trace, CheckError> {
    let def = module
        .function(name)
        .ok_or_else(|| ExtractError::ProcedureNotFound { name: name.to_string() })?;
    let signature = signature_of(name, &def, module.source());

    let mut interp = TraceInterpreter::new(module, Recorder::new(hierarchy, topology), limits);
    interp.bind_parameters(&signature);
    interp.run(def.body);
    let recorder = interp.finish();

    let warnings = recorder.warnings();
    let events = recorder.into_events();
    let graph = assemble_graph(name, &events)?;
    debug!(
        procedure = name,
        events = events.len(),
        operations = graph.operations().len(),
        skipped = warnings.len(),
        "trace finished"
    );
    Ok(Trace { signature, graph, events, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use labtrace_core::{BindingValue, Literal, NodeKind, WarningKind};

    fn trace(src: &str) -> Trace {
        trace_with(src, TracerLimits::default())
    }

    fn trace_with(src: &str, limits: TracerLimits) -> Trace {
        let module = ParsedModule::parse(src).unwrap();
        trace_procedure(&module, "protocol", &HierarchyRegistry::standard(), DeckTopology::SlotBased, limits).unwrap()
    }

    fn names(t: &Trace) -> Vec<&str> {
        t.graph.operations().iter().map(|o| o.name.as_str()).collect()
    }

    // -----------------------------------------------------------------------
    // Helper expansion
    // -----------------------------------------------------------------------

    #[test]
    fn helper_calls_are_recorded_at_the_call_site() {
        let t = trace(
            r#"
async def move(lh, src, dst, vol=50):
    await lh.aspirate(src, vols=[vol])
    await lh.dispense(dst, vols=[vol])

async def protocol(lh: LiquidHandler, tips: TipRack, source: Plate, dest: Plate):
    await lh.pick_up_tips(tips["A1"])
    await move(lh, source["A1"], dest["A1"])
    await lh.drop_tips(tips["A1"])
"#,
        );
        assert_eq!(names(&t), vec!["pick_up_tips", "aspirate", "dispense", "drop_tips"]);
        let aspirate = &t.graph.operations()[1];
        let vols = aspirate.argument("vols", 1).unwrap();
        assert_eq!(vols.value, BindingValue::Literal(Literal::List(vec![Literal::Int(50)])));
        let well = aspirate.resource_arguments().next().unwrap();
        assert_eq!(t.graph.resource(well).unwrap().name, "source[\"A1\"]");
        assert!(t.warnings.is_empty());
    }

    #[test]
    fn helper_return_values_flow_back() {
        let t = trace(
            r#"
def first_well(plate):
    return plate["A1"]

async def protocol(lh: LiquidHandler, plate: Plate):
    well = first_well(plate)
    await lh.aspirate(well, vols=[10])
"#,
        );
        let aspirate = &t.graph.operations()[0];
        let well = aspirate.resource_arguments().next().unwrap();
        assert_eq!(t.graph.resource(well).unwrap().name, "plate[\"A1\"]");
    }

    #[test]
    fn recursion_stops_at_the_call_limit() {
        let limits = TracerLimits { max_call_depth: 2, ..TracerLimits::default() };
        let t = trace_with(
            r#"
async def again(lh):
    await lh.home()
    await again(lh)

async def protocol(lh: LiquidHandler):
    await again(lh)
"#,
            limits,
        );
        assert_eq!(names(&t), vec!["home", "home", "unanalyzed"]);
    }

    #[test]
    fn wrong_helper_arity_skips_the_statement() {
        let t = trace(
            r#"
def helper(a, b):
    pass

async def protocol(lh: LiquidHandler):
    helper(1)
    await lh.home()
"#,
        );
        assert_eq!(names(&t), vec!["home"]);
        assert_eq!(t.warnings.len(), 1);
        assert_eq!(t.warnings[0].kind, WarningKind::SkippedConstruct);
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    #[test]
    fn runtime_conditions_trace_both_arms() {
        let t = trace(
            r#"
async def protocol(lh: LiquidHandler, plate: Plate, mix: bool):
    if mix:
        await lh.aspirate(plate["A1"], vols=[5])
    else:
        await lh.home()
"#,
        );
        assert_eq!(names(&t), vec!["if", "aspirate", "home"]);
        match &t.graph.operations()[0].kind {
            NodeKind::Conditional { then_branch, else_branch, condition } => {
                assert_eq!(condition, "mix");
                assert_eq!(then_branch.len(), 1);
                assert_eq!(else_branch.len(), 1);
            }
            other => panic!("expected conditional, got {other:?}"),
        }
    }

    #[test]
    fn literal_conditions_pick_one_arm() {
        let t = trace(
            r#"
DEBUG = False

async def protocol(lh: LiquidHandler):
    if DEBUG:
        await lh.home()
    await lh.park()
"#,
        );
        assert_eq!(names(&t), vec!["park"]);
    }

    #[test]
    fn deep_branches_become_unanalyzed() {
        let limits = TracerLimits { max_branch_depth: 1, ..TracerLimits::default() };
        let t = trace_with(
            r#"
async def protocol(lh: LiquidHandler, a: bool, b: bool):
    if a:
        if b:
            await lh.home()
"#,
            limits,
        );
        assert_eq!(names(&t), vec!["if", "unanalyzed"]);
    }

    #[test]
    fn loops_over_collections_have_a_representative_element() {
        let t = trace(
            r#"
async def protocol(lh: LiquidHandler, plate: Plate):
    for well in plate.children:
        await lh.aspirate(well, vols=[5])
"#,
        );
        assert_eq!(names(&t), vec!["for", "aspirate"]);
        match &t.graph.operations()[0].kind {
            NodeKind::Foreach { element, collection, .. } => {
                assert!(element.is_some());
                assert!(collection.is_some());
            }
            other => panic!("expected foreach, got {other:?}"),
        }
    }

    #[test]
    fn unknown_functions_are_skipped_with_a_warning() {
        let t = trace(
            r#"
async def protocol(lh: LiquidHandler):
    mystery(lh)
    await lh.home()
"#,
        );
        assert_eq!(names(&t), vec!["home"]);
        assert!(t.warnings[0].message.contains("mystery"));
    }

    #[test]
    fn missing_procedure_is_an_error() {
        let module = ParsedModule::parse("def other():\n    pass\n").unwrap();
        let err = trace_procedure(
            &module,
            "protocol",
            &HierarchyRegistry::standard(),
            DeckTopology::SlotBased,
            TracerLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CheckError::Extract(ExtractError::ProcedureNotFound { .. })));
    }
}
