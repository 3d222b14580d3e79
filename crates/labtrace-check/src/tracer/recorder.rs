//! The explicit recorder stand-ins report to.
//!
//! Ids are allocated here in the same dense order the graph uses, so the
//! event stream can be replayed into a graph and checked id by id.

use std::collections::{BTreeSet, HashMap};

use labtrace_core::{
    Access, AnalysisWarning, ArgumentBinding, Arm, BindingValue, DeckTopology, DeclaredType, HierarchyRegistry,
    OperationId, ResourceChain, ResourceId, ResourceOrigin, Shape, SourcePosition, WarningKind,
};
use serde::Serialize;

use super::value::Proxy;
use crate::error::TraceError;

/// One recorded interaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// A parameter, an access on another resource, a loop element, a
    /// grouped literal or a used call result.
    Resource {
        id: ResourceId,
        name: String,
        declared: DeclaredType,
        chain: ResourceChain,
        origin: ResourceOrigin,
    },
    Call {
        id: OperationId,
        name: String,
        receiver: ResourceId,
        bindings: Vec<ArgumentBinding>,
        position: SourcePosition,
        parent: Option<(OperationId, Arm)>,
    },
    LoopEnter {
        id: OperationId,
        /// `for` or `while`.
        keyword: String,
        collection: Option<ResourceId>,
        element: Option<ResourceId>,
        static_count: Option<u64>,
        position: SourcePosition,
        parent: Option<(OperationId, Arm)>,
    },
    LoopExit {
        id: OperationId,
        scoped: Vec<ResourceId>,
    },
    BranchEnter {
        id: OperationId,
        condition: String,
        position: SourcePosition,
        parent: Option<(OperationId, Arm)>,
    },
    BranchElse {
        id: OperationId,
    },
    BranchExit {
        id: OperationId,
    },
    Unanalyzed {
        id: OperationId,
        reason: String,
        position: SourcePosition,
        parent: Option<(OperationId, Arm)>,
    },
    /// A statement the tracer could not model.
    Skipped {
        message: String,
        position: SourcePosition,
    },
}

/// A resource as the recorder knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedResource {
    pub name: String,
    pub declared: DeclaredType,
    pub origin: ResourceOrigin,
}

pub struct Recorder<'h> {
    hierarchy: &'h HierarchyRegistry,
    topology: DeckTopology,
    events: Vec<TraceEvent>,
    resources: Vec<RecordedResource>,
    operations: u32,
    /// (parent, access text) -> derived resource
    derived: HashMap<(ResourceId, String), ResourceId>,
    produced: HashMap<OperationId, ResourceId>,
    container: Option<(OperationId, Arm)>,
}

impl<'h> Recorder<'h> {
    pub fn new(hierarchy: &'h HierarchyRegistry, topology: DeckTopology) -> Self {
        Recorder {
            hierarchy,
            topology,
            events: Vec::new(),
            resources: Vec::new(),
            operations: 0,
            derived: HashMap::new(),
            produced: HashMap::new(),
            container: None,
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    pub fn resource(&self, id: ResourceId) -> Option<&RecordedResource> {
        self.resources.get(id.0 as usize)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn container(&self) -> Option<(OperationId, Arm)> {
        self.container
    }

    /// Warnings for every skipped statement, in order.
    pub fn warnings(&self) -> Vec<AnalysisWarning> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Skipped { message, position } => Some(AnalysisWarning {
                    kind: WarningKind::SkippedConstruct,
                    message: message.clone(),
                    position: Some(*position),
                }),
                _ => None,
            })
            .collect()
    }

    // ---- resources ----

    pub fn add_resource(&mut self, name: impl Into<String>, declared: DeclaredType, origin: ResourceOrigin) -> ResourceId {
        let id = ResourceId(self.resources.len() as u32);
        let name = name.into();
        let chain = self.hierarchy.chain_for_opt(declared.placement_kind(), self.topology);
        self.events.push(TraceEvent::Resource {
            id,
            name: name.clone(),
            declared: declared.clone(),
            chain,
            origin: origin.clone(),
        });
        self.resources.push(RecordedResource { name, declared, origin });
        id
    }

    /// The resource reached from `from` by `access`, recorded once.
    pub fn derive(&mut self, from: ResourceId, access: Access, shape: Shape) -> ResourceId {
        let key = (from, access.to_string());
        if let Some(id) = self.derived.get(&key) {
            return *id;
        }
        let parent_name = self.resource(from).map(|r| r.name.clone()).unwrap_or_default();
        let id = self.add_resource(
            format!("{parent_name}{access}"),
            DeclaredType::from_shape(shape),
            ResourceOrigin::Derived { from, access },
        );
        self.derived.insert(key, id);
        id
    }

    /// The resource holding a call's result, recorded on first use.
    pub fn materialize(&mut self, op: OperationId, name: &str) -> ResourceId {
        if let Some(id) = self.produced.get(&op) {
            return *id;
        }
        let id = self.add_resource(name, DeclaredType::unknown(), ResourceOrigin::Produced { by: op });
        self.produced.insert(op, id);
        id
    }

    pub fn group(&mut self, members: Vec<ResourceId>, name: &str) -> ResourceId {
        let kinds: BTreeSet<_> = members
            .iter()
            .filter_map(|m| self.resource(*m).and_then(|r| r.declared.placement_kind()))
            .collect();
        let declared = match (kinds.len(), kinds.iter().next()) {
            (1, Some(kind)) => DeclaredType::from_shape(Shape::Collection(*kind)),
            _ => DeclaredType { collection: true, ..DeclaredType::unknown() },
        };
        self.add_resource(name, declared, ResourceOrigin::Grouped { members })
    }

    /// The stand-in for a recorded resource.
    pub fn proxy(&self, id: ResourceId) -> Proxy {
        let Some(node) = self.resource(id) else {
            return Proxy::Scalar(id.to_string());
        };
        if node.declared.primary().is_some_and(|k| k.receives_operations()) {
            return Proxy::Machine(id);
        }
        if let ResourceOrigin::LoopElement { collection } = node.origin {
            return Proxy::Element { id, collection };
        }
        if node.declared.collection {
            Proxy::Collection(id)
        } else {
            Proxy::Resource(id)
        }
    }

    /// Element type of iterating a resource.
    pub fn element_shape(&self, collection: ResourceId) -> Option<Shape> {
        let node = self.resource(collection)?;
        if node.declared.collection {
            node.declared.element.map(Shape::Single)
        } else {
            node.declared.kinds.iter().find_map(|k| k.item_kind()).map(Shape::Single)
        }
    }

    /// Lineage through derivations, the resource itself first.
    pub fn lineage(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut out = vec![id];
        let mut current = id;
        while let Some(parent) = self.resource(current).and_then(|r| match &r.origin {
            ResourceOrigin::Derived { from, .. } => Some(*from),
            ResourceOrigin::LoopElement { collection } => Some(*collection),
            _ => None,
        }) {
            if out.contains(&parent) {
                break;
            }
            out.push(parent);
            current = parent;
        }
        out
    }

    /// A call argument as a graph binding value. Used call results become
    /// resources.
    pub fn binding(&mut self, value: Proxy, expr: &str) -> BindingValue {
        match value {
            Proxy::Literal(lit) => BindingValue::Literal(lit),
            Proxy::Opaque { produced_by: Some(op), .. } => BindingValue::Resource(self.materialize(op, expr)),
            other => match other.resource() {
                Some(id) => BindingValue::Resource(id),
                None => BindingValue::Dynamic { expr: expr.to_string() },
            },
        }
    }

    // ---- operations ----

    fn next_operation(&mut self) -> OperationId {
        let id = OperationId(self.operations);
        self.operations += 1;
        id
    }

    pub fn call(
        &mut self,
        name: &str,
        receiver: ResourceId,
        bindings: Vec<ArgumentBinding>,
        position: SourcePosition,
    ) -> OperationId {
        let id = self.next_operation();
        self.events.push(TraceEvent::Call {
            id,
            name: name.to_string(),
            receiver,
            bindings,
            position,
            parent: self.container,
        });
        id
    }

    /// Opens a loop; returns its id and the container to restore on exit.
    pub fn enter_loop(
        &mut self,
        keyword: &str,
        collection: Option<ResourceId>,
        element: Option<ResourceId>,
        static_count: Option<u64>,
        position: SourcePosition,
    ) -> (OperationId, Option<(OperationId, Arm)>) {
        let id = self.next_operation();
        self.events.push(TraceEvent::LoopEnter {
            id,
            keyword: keyword.to_string(),
            collection,
            element,
            static_count,
            position,
            parent: self.container,
        });
        (id, self.container.replace((id, Arm::Body)))
    }

    pub fn exit_loop(&mut self, id: OperationId, scoped: Vec<ResourceId>, restore: Option<(OperationId, Arm)>) {
        self.events.push(TraceEvent::LoopExit { id, scoped });
        self.container = restore;
    }

    pub fn enter_branch(
        &mut self,
        condition: &str,
        position: SourcePosition,
    ) -> (OperationId, Option<(OperationId, Arm)>) {
        let id = self.next_operation();
        self.events.push(TraceEvent::BranchEnter {
            id,
            condition: condition.to_string(),
            position,
            parent: self.container,
        });
        (id, self.container.replace((id, Arm::Then)))
    }

    pub fn else_branch(&mut self, id: OperationId) {
        self.events.push(TraceEvent::BranchElse { id });
        self.container = Some((id, Arm::Else));
    }

    pub fn exit_branch(&mut self, id: OperationId, restore: Option<(OperationId, Arm)>) {
        self.events.push(TraceEvent::BranchExit { id });
        self.container = restore;
    }

    pub fn unanalyzed(&mut self, reason: String, position: SourcePosition) -> OperationId {
        let id = self.next_operation();
        self.events.push(TraceEvent::Unanalyzed { id, reason, position, parent: self.container });
        id
    }

    pub fn skip(&mut self, message: String, position: SourcePosition) {
        self.events.push(TraceEvent::Skipped { message, position });
    }

    pub fn skipped(&mut self, error: &TraceError) {
        self.skip(error.to_string(), error.position());
    }
}
