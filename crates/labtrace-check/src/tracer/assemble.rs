//! Replays a recorded event stream into a computation graph.

use std::fmt::Display;

use labtrace_core::{ArgumentBinding, BindingValue, NodeKind, OperationDraft, ProtocolComputationGraph};

use super::recorder::TraceEvent;
use crate::error::CheckError;

/// Builds the graph for `procedure` from `events`. Every id the recorder
/// handed out must come back from the graph unchanged.
pub fn assemble_graph(procedure: &str, events: &[TraceEvent]) -> Result<ProtocolComputationGraph, CheckError> {
    let mut graph = ProtocolComputationGraph::new(procedure);
    for event in events {
        match event {
            TraceEvent::Resource { id, name, declared, chain, origin } => {
                let got = graph.add_resource(name.clone(), declared.clone(), chain.clone(), origin.clone())?;
                same(*id, got)?;
            }
            TraceEvent::Call { id, name, receiver, bindings, position, parent } => {
                let draft = OperationDraft::call(name.clone(), *receiver, bindings.clone(), *position).within(*parent);
                same(*id, graph.add_operation(draft)?)?;
            }
            TraceEvent::LoopEnter { id, keyword, collection, element, static_count, position, parent } => {
                let mut draft = OperationDraft::structural(
                    keyword.clone(),
                    NodeKind::foreach(*collection, *element, *static_count),
                    *position,
                )
                .within(*parent);
                if let Some(c) = collection {
                    draft = draft.with_bindings(vec![ArgumentBinding::positional(0, BindingValue::Resource(*c))]);
                }
                same(*id, graph.add_operation(draft)?)?;
            }
            TraceEvent::LoopExit { id, scoped } => graph.set_loop_scope(*id, scoped.clone())?,
            TraceEvent::BranchEnter { id, condition, position, parent } => {
                let draft =
                    OperationDraft::structural("if", NodeKind::conditional(condition.clone()), *position).within(*parent);
                same(*id, graph.add_operation(draft)?)?;
            }
            TraceEvent::Unanalyzed { id, reason, position, parent } => {
                let kind = NodeKind::Unanalyzed { reason: reason.clone() };
                let draft = OperationDraft::structural("unanalyzed", kind, *position).within(*parent);
                same(*id, graph.add_operation(draft)?)?;
            }
            // Arms are attached through each child's parent.
            TraceEvent::BranchElse { .. } | TraceEvent::BranchExit { .. } | TraceEvent::Skipped { .. } => {}
        }
    }
    graph.derive_edges();
    Ok(graph)
}

fn same<T: PartialEq + Display>(recorded: T, assigned: T) -> Result<(), CheckError> {
    if recorded == assigned {
        Ok(())
    } else {
        Err(CheckError::TraceAssembly { reason: format!("recorded {recorded} but the graph assigned {assigned}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labtrace_core::{DeclaredType, OperationId, ResourceChain, ResourceId, ResourceOrigin, SourcePosition};

    #[test]
    fn out_of_order_ids_are_rejected() {
        let events = vec![TraceEvent::Resource {
            id: ResourceId(3),
            name: "plate".into(),
            declared: DeclaredType::parse("Plate"),
            chain: ResourceChain::new(),
            origin: ResourceOrigin::Parameter { index: 0 },
        }];
        let err = assemble_graph("p", &events).unwrap_err();
        assert!(matches!(err, CheckError::TraceAssembly { .. }));
    }

    #[test]
    fn children_attach_to_their_arm() {
        let at = SourcePosition::new(1, 0);
        let events = vec![
            TraceEvent::Resource {
                id: ResourceId(0),
                name: "lh".into(),
                declared: DeclaredType::parse("LiquidHandler"),
                chain: ResourceChain::new(),
                origin: ResourceOrigin::Parameter { index: 0 },
            },
            TraceEvent::BranchEnter { id: OperationId(0), condition: "x".into(), position: at, parent: None },
            TraceEvent::Call {
                id: OperationId(1),
                name: "home".into(),
                receiver: ResourceId(0),
                bindings: Vec::new(),
                position: at,
                parent: Some((OperationId(0), labtrace_core::Arm::Then)),
            },
            TraceEvent::BranchElse { id: OperationId(0) },
            TraceEvent::BranchExit { id: OperationId(0) },
        ];
        let graph = assemble_graph("p", &events).unwrap();
        match &graph.operations()[0].kind {
            NodeKind::Conditional { then_branch, else_branch, .. } => {
                assert_eq!(then_branch, &vec![OperationId(1)]);
                assert!(else_branch.is_empty());
            }
            other => panic!("expected a conditional, got {other:?}"),
        }
    }
}
