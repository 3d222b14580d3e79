//! ProtocolComputationGraph: the aggregate produced by extraction or
//! tracing and consumed by the simulator.
//!
//! Resources and operations are stored densely: `ResourceId(i)` and
//! `OperationId(i)` index the i-th entry. Operations are kept in source
//! order, so id order is also a pre-order walk of the container tree.
//! All mutations go through methods that check referential integrity;
//! [`validate`](ProtocolComputationGraph::validate) re-checks the whole
//! graph after deserialization.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

use crate::edge::{EdgeKind, OrderingEdge};
use crate::error::CoreError;
use crate::fact::StatePrecondition;
use crate::hierarchy::ResourceChain;
use crate::id::{OperationId, ResourceId};
use crate::node::{
    BindingValue, NodeKind, OperationDraft, OperationNode, ResourceNode, ResourceOrigin,
};
use crate::typeexpr::DeclaredType;

/// The computation graph of one procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolComputationGraph {
    /// Procedure name.
    pub procedure: String,
    /// Parameter name -> resource node, in declaration order.
    parameters: IndexMap<String, ResourceId>,
    /// Resource nodes indexed by ResourceId.0
    resources: Vec<ResourceNode>,
    /// Operation nodes indexed by OperationId.0, in source order
    operations: Vec<OperationNode>,
    preconditions: Vec<StatePrecondition>,
    edges: Vec<OrderingEdge>,
}

impl ProtocolComputationGraph {
    pub fn new(procedure: impl Into<String>) -> Self {
        ProtocolComputationGraph {
            procedure: procedure.into(),
            parameters: IndexMap::new(),
            resources: Vec::new(),
            operations: Vec::new(),
            preconditions: Vec::new(),
            edges: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Adds a resource node. Origins may only reference existing nodes.
    pub fn add_resource(
        &mut self,
        name: impl Into<String>,
        declared: DeclaredType,
        chain: ResourceChain,
        origin: ResourceOrigin,
    ) -> Result<ResourceId, CoreError> {
        match &origin {
            ResourceOrigin::Derived { from, .. } => self.require_resource(*from)?,
            ResourceOrigin::LoopElement { collection } => self.require_resource(*collection)?,
            ResourceOrigin::Grouped { members } => {
                for m in members {
                    self.require_resource(*m)?;
                }
            }
            ResourceOrigin::Produced { by } => self.require_operation(*by)?,
            ResourceOrigin::Parameter { .. } => {}
        }

        let id = ResourceId(self.resources.len() as u32);
        let name = name.into();
        if let ResourceOrigin::Parameter { .. } = origin {
            self.parameters.insert(name.clone(), id);
        }
        if let ResourceOrigin::Produced { by } = origin {
            self.operations[by.0 as usize].produces = Some(id);
        }
        self.resources.push(ResourceNode { id, name, declared, chain, origin });
        Ok(id)
    }

    /// Adds an operation node and attaches it to its parent container.
    pub fn add_operation(&mut self, draft: OperationDraft) -> Result<OperationId, CoreError> {
        if let Some(receiver) = draft.receiver {
            self.require_resource(receiver)?;
        }
        for binding in &draft.bindings {
            if let BindingValue::Resource(id) = binding.value {
                self.require_resource(id)?;
            }
        }
        if let NodeKind::Foreach { collection, element, .. } = &draft.kind {
            for id in collection.iter().chain(element.iter()) {
                self.require_resource(*id)?;
            }
        }
        if let Some((parent, _)) = draft.parent {
            let node = self
                .operations
                .get(parent.0 as usize)
                .ok_or(CoreError::OperationNotFound { id: parent })?;
            if !node.kind.is_container() {
                return Err(CoreError::NotAContainer { id: parent });
            }
        }

        let id = OperationId(self.operations.len() as u32);
        let receiver_kind = draft
            .receiver
            .and_then(|r| self.resources[r.0 as usize].declared.primary());
        if let Some((parent, arm)) = draft.parent {
            if !self.operations[parent.0 as usize].kind.push_child(arm, id) {
                return Err(CoreError::GraphInconsistency {
                    reason: format!("{parent} has no {arm:?} arm"),
                });
            }
        }
        self.operations.push(OperationNode {
            id,
            name: draft.name,
            receiver: draft.receiver,
            receiver_kind,
            bindings: draft.bindings,
            position: draft.position,
            kind: draft.kind,
            parent: draft.parent.map(|(p, _)| p),
            produces: None,
        });
        Ok(id)
    }

    /// Records the resources created inside a loop body.
    pub fn set_loop_scope(&mut self, op: OperationId, scope: Vec<ResourceId>) -> Result<(), CoreError> {
        for id in &scope {
            self.require_resource(*id)?;
        }
        let node = self
            .operations
            .get_mut(op.0 as usize)
            .ok_or(CoreError::OperationNotFound { id: op })?;
        match &mut node.kind {
            NodeKind::Foreach { scoped, .. } => {
                *scoped = scope;
                Ok(())
            }
            _ => Err(CoreError::NotAContainer { id: op }),
        }
    }

    /// Replaces the precondition list.
    pub fn set_preconditions(&mut self, preconditions: Vec<StatePrecondition>) -> Result<(), CoreError> {
        for p in &preconditions {
            self.check_precondition(p)?;
        }
        self.preconditions = preconditions;
        Ok(())
    }

    pub fn add_precondition(&mut self, precondition: StatePrecondition) -> Result<(), CoreError> {
        self.check_precondition(&precondition)?;
        self.preconditions.push(precondition);
        Ok(())
    }

    fn check_precondition(&self, p: &StatePrecondition) -> Result<(), CoreError> {
        self.require_resource(p.resource)?;
        self.require_operation(p.required_by)?;
        if let Some(by) = p.satisfied_by {
            self.require_operation(by)?;
        }
        Ok(())
    }

    fn require_resource(&self, id: ResourceId) -> Result<(), CoreError> {
        if (id.0 as usize) < self.resources.len() {
            Ok(())
        } else {
            Err(CoreError::ResourceNotFound { id })
        }
    }

    fn require_operation(&self, id: OperationId) -> Result<(), CoreError> {
        if (id.0 as usize) < self.operations.len() {
            Ok(())
        } else {
            Err(CoreError::OperationNotFound { id })
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn resource(&self, id: ResourceId) -> Option<&ResourceNode> {
        self.resources.get(id.0 as usize)
    }

    pub fn operation(&self, id: OperationId) -> Option<&OperationNode> {
        self.operations.get(id.0 as usize)
    }

    pub fn resources(&self) -> &[ResourceNode] {
        &self.resources
    }

    pub fn operations(&self) -> &[OperationNode] {
        &self.operations
    }

    pub fn preconditions(&self) -> &[StatePrecondition] {
        &self.preconditions
    }

    pub fn edges(&self) -> &[OrderingEdge] {
        &self.edges
    }

    pub fn parameters(&self) -> &IndexMap<String, ResourceId> {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<ResourceId> {
        self.parameters.get(name).copied()
    }

    /// Top-level operations in source order.
    pub fn roots(&self) -> Vec<OperationId> {
        self.operations.iter().filter(|o| o.parent.is_none()).map(|o| o.id).collect()
    }

    /// Hardware calls only (no containers or markers).
    pub fn calls(&self) -> impl Iterator<Item = &OperationNode> {
        self.operations.iter().filter(|o| o.is_call())
    }

    /// The resource this one was derived from, if any.
    pub fn origin_parent(&self, id: ResourceId) -> Option<ResourceId> {
        match &self.resource(id)?.origin {
            ResourceOrigin::Derived { from, .. } => Some(*from),
            ResourceOrigin::LoopElement { collection } => Some(*collection),
            _ => None,
        }
    }

    /// The resource followed by its origin parents, nearest first.
    pub fn lineage(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut out = vec![id];
        let mut current = id;
        while let Some(parent) = self.origin_parent(current) {
            out.push(parent);
            current = parent;
        }
        out
    }

    /// The physical units that must be placed for `id` to be reachable:
    /// the parameter or produced value at the top of its lineage, or every
    /// member's root for grouped values.
    pub fn placement_roots(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut out = BTreeSet::new();
        self.collect_roots(id, &mut out);
        out.into_iter().collect()
    }

    fn collect_roots(&self, id: ResourceId, out: &mut BTreeSet<ResourceId>) {
        let Some(node) = self.resource(id) else {
            return;
        };
        match &node.origin {
            ResourceOrigin::Derived { from, .. } => self.collect_roots(*from, out),
            ResourceOrigin::LoopElement { collection } => self.collect_roots(*collection, out),
            ResourceOrigin::Grouped { members } => {
                for m in members {
                    self.collect_roots(*m, out);
                }
            }
            ResourceOrigin::Parameter { .. } | ResourceOrigin::Produced { .. } => {
                out.insert(id);
            }
        }
    }

    /// Ids of every operation nested (at any depth) under `op`.
    pub fn descendants(&self, op: OperationId) -> Vec<OperationId> {
        let mut out = Vec::new();
        let mut stack = match self.operation(op) {
            Some(node) => node.kind.children(),
            None => return out,
        };
        stack.reverse();
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(node) = self.operation(next) {
                let mut kids = node.kind.children();
                kids.reverse();
                stack.extend(kids);
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Ordering edges
    // -----------------------------------------------------------------------

    /// Recomputes ordering edges from the operation list.
    ///
    /// A data-dependency edge runs from the operation that produced a value
    /// to each later call consuming it or anything derived from it. A
    /// resource-order edge links consecutive calls that touch the same
    /// placement root.
    pub fn derive_edges(&mut self) {
        let mut edges = BTreeSet::new();
        let mut last_touch: BTreeMap<ResourceId, OperationId> = BTreeMap::new();

        for op in self.operations.iter().filter(|o| o.is_call()) {
            for arg in op.resource_arguments() {
                for ancestor in self.lineage(arg) {
                    if let Some(ResourceOrigin::Produced { by }) = self.resource(ancestor).map(|r| &r.origin) {
                        if *by != op.id {
                            edges.insert(OrderingEdge {
                                from: *by,
                                to: op.id,
                                kind: EdgeKind::DataDependency { resource: ancestor },
                            });
                        }
                    }
                }
                for root in self.placement_roots(arg) {
                    if let Some(prev) = last_touch.insert(root, op.id) {
                        if prev != op.id {
                            edges.insert(OrderingEdge {
                                from: prev,
                                to: op.id,
                                kind: EdgeKind::ResourceOrder { resource: root },
                            });
                        }
                    }
                }
            }
        }
        self.edges = edges.into_iter().collect();
    }

    /// Operations as petgraph nodes (node index == operation id) with the
    /// ordering edges.
    pub fn dependency_graph(&self) -> DiGraph<OperationId, EdgeKind, u32> {
        let mut graph = DiGraph::with_capacity(self.operations.len(), self.edges.len());
        for op in &self.operations {
            graph.add_node(op.id);
        }
        for edge in &self.edges {
            graph.add_edge(edge.from.into(), edge.to.into(), edge.kind);
        }
        graph
    }

    /// A valid execution order of the operations.
    pub fn topological_order(&self) -> Result<Vec<OperationId>, CoreError> {
        let graph = self.dependency_graph();
        toposort(&graph, None)
            .map(|order| order.into_iter().map(|idx| graph[idx]).collect())
            .map_err(|cycle| CoreError::GraphInconsistency {
                reason: format!("ordering cycle through {}", graph[cycle.node_id()]),
            })
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Checks every referential invariant. Returns all breaches found.
    pub fn validate(&self) -> Vec<CoreError> {
        let mut errors = Vec::new();

        for (i, node) in self.resources.iter().enumerate() {
            if node.id.0 as usize != i {
                errors.push(CoreError::GraphInconsistency {
                    reason: format!("resource at index {i} has id {}", node.id),
                });
            }
            let refs: Vec<ResourceId> = match &node.origin {
                ResourceOrigin::Derived { from, .. } => vec![*from],
                ResourceOrigin::LoopElement { collection } => vec![*collection],
                ResourceOrigin::Grouped { members } => members.clone(),
                _ => Vec::new(),
            };
            for r in refs {
                if r >= node.id {
                    errors.push(CoreError::GraphInconsistency {
                        reason: format!("{} derives from later resource {r}", node.id),
                    });
                }
            }
        }

        for (i, op) in self.operations.iter().enumerate() {
            if op.id.0 as usize != i {
                errors.push(CoreError::GraphInconsistency {
                    reason: format!("operation at index {i} has id {}", op.id),
                });
            }
            let mut refs: Vec<ResourceId> = op.resource_arguments().collect();
            refs.extend(op.receiver);
            refs.extend(op.produces);
            for r in refs {
                if let Err(e) = self.require_resource(r) {
                    errors.push(e);
                }
            }
            for child in op.kind.children() {
                match self.operation(child) {
                    Some(c) if c.parent == Some(op.id) => {}
                    Some(_) => errors.push(CoreError::GraphInconsistency {
                        reason: format!("{child} is listed under {} but has another parent", op.id),
                    }),
                    None => errors.push(CoreError::OperationNotFound { id: child }),
                }
            }
            if let Some(parent) = op.parent {
                let listed = self
                    .operation(parent)
                    .map(|p| p.kind.children().contains(&op.id))
                    .unwrap_or(false);
                if !listed {
                    errors.push(CoreError::GraphInconsistency {
                        reason: format!("{} names parent {parent} which does not list it", op.id),
                    });
                }
            }
        }

        for p in &self.preconditions {
            if let Err(e) = self.check_precondition(p) {
                errors.push(e);
            }
        }

        for edge in &self.edges {
            for end in [edge.from, edge.to] {
                if let Err(e) = self.require_operation(end) {
                    errors.push(e);
                }
            }
            if edge.from >= edge.to {
                errors.push(CoreError::InvalidEdge {
                    reason: format!("{} -> {} does not follow source order", edge.from, edge.to),
                });
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{DeckTopology, HierarchyRegistry};
    use crate::kind::ResourceKind;
    use crate::node::{Access, AccessKey, ArgumentBinding, Arm, Literal, SourcePosition};

    fn param(g: &mut ProtocolComputationGraph, name: &str, ty: &str, index: usize) -> ResourceId {
        let declared = DeclaredType::parse(ty);
        let chain = HierarchyRegistry::standard()
            .chain_for_opt(declared.placement_kind(), DeckTopology::SlotBased);
        g.add_resource(name, declared, chain, ResourceOrigin::Parameter { index }).unwrap()
    }

    fn well(g: &mut ProtocolComputationGraph, plate: ResourceId, key: &str) -> ResourceId {
        g.add_resource(
            format!("plate[{key:?}]"),
            DeclaredType::from_shape(crate::kind::Shape::Collection(ResourceKind::Well)),
            ResourceChain::new(),
            ResourceOrigin::Derived {
                from: plate,
                access: Access::Subscript { key: AccessKey::Label(key.into()) },
            },
        )
        .unwrap()
    }

    fn call(g: &mut ProtocolComputationGraph, name: &str, lh: ResourceId, arg: ResourceId) -> OperationId {
        g.add_operation(OperationDraft::call(
            name,
            lh,
            vec![
                ArgumentBinding::positional(0, BindingValue::Resource(arg)),
                ArgumentBinding::keyword("vols", BindingValue::Literal(Literal::Int(50))),
            ],
            SourcePosition::default(),
        ))
        .unwrap()
    }

    #[test]
    fn receiver_kind_and_parameters() {
        let mut g = ProtocolComputationGraph::new("p");
        let lh = param(&mut g, "lh", "LiquidHandler", 0);
        let plate = param(&mut g, "plate", "Plate", 1);
        let op = call(&mut g, "aspirate", lh, plate);
        assert_eq!(g.operation(op).unwrap().receiver_kind, Some(ResourceKind::LiquidHandler));
        assert_eq!(g.parameter("plate"), Some(plate));
        assert_eq!(g.resource(plate).unwrap().chain.as_slice(), &[ResourceKind::DeckSlot, ResourceKind::Deck]);
    }

    #[test]
    fn dangling_binding_rejected() {
        let mut g = ProtocolComputationGraph::new("p");
        let lh = param(&mut g, "lh", "LiquidHandler", 0);
        let err = g
            .add_operation(OperationDraft::call(
                "aspirate",
                lh,
                vec![ArgumentBinding::positional(0, BindingValue::Resource(ResourceId(9)))],
                SourcePosition::default(),
            ))
            .unwrap_err();
        assert_eq!(err, CoreError::ResourceNotFound { id: ResourceId(9) });
    }

    #[test]
    fn children_attach_to_container() {
        let mut g = ProtocolComputationGraph::new("p");
        let lh = param(&mut g, "lh", "LiquidHandler", 0);
        let plate = param(&mut g, "plate", "Plate", 1);
        let loop_op = g
            .add_operation(OperationDraft::structural(
                "for",
                NodeKind::foreach(Some(plate), None, None),
                SourcePosition::default(),
            ))
            .unwrap();
        let inner = g
            .add_operation(
                OperationDraft::call("dispense", lh, vec![], SourcePosition::default())
                    .within(Some((loop_op, Arm::Body))),
            )
            .unwrap();
        assert_eq!(g.operation(loop_op).unwrap().kind.children(), vec![inner]);
        assert_eq!(g.roots(), vec![loop_op]);
        assert_eq!(g.descendants(loop_op), vec![inner]);
        assert!(g.validate().is_empty());

        let err = g
            .add_operation(
                OperationDraft::call("dispense", lh, vec![], SourcePosition::default())
                    .within(Some((inner, Arm::Body))),
            )
            .unwrap_err();
        assert_eq!(err, CoreError::NotAContainer { id: inner });
    }

    #[test]
    fn edges_follow_roots_and_products() {
        let mut g = ProtocolComputationGraph::new("p");
        let lh = param(&mut g, "lh", "LiquidHandler", 0);
        let plate = param(&mut g, "plate", "Plate", 1);
        let a1 = well(&mut g, plate, "A1");
        let b1 = well(&mut g, plate, "B1");
        let first = call(&mut g, "aspirate", lh, a1);
        let second = call(&mut g, "dispense", lh, b1);
        let produced = g
            .add_resource("reading", DeclaredType::unknown(), ResourceChain::new(), ResourceOrigin::Produced { by: second })
            .unwrap();
        let third = call(&mut g, "dispense", lh, produced);
        g.derive_edges();

        assert!(g.edges().contains(&OrderingEdge {
            from: first,
            to: second,
            kind: EdgeKind::ResourceOrder { resource: plate },
        }));
        assert!(g.edges().contains(&OrderingEdge {
            from: second,
            to: third,
            kind: EdgeKind::DataDependency { resource: produced },
        }));
        assert_eq!(g.operation(second).unwrap().produces, Some(produced));
        assert_eq!(g.topological_order().unwrap().len(), 3);
        assert!(g.validate().is_empty());
    }

    #[test]
    fn grouped_roots_cover_members() {
        let mut g = ProtocolComputationGraph::new("p");
        let a = param(&mut g, "a", "Plate", 0);
        let b = param(&mut g, "b", "Plate", 1);
        let group = g
            .add_resource(
                "[a, b]",
                DeclaredType::parse("list[Plate]"),
                ResourceChain::new(),
                ResourceOrigin::Grouped { members: vec![a, b] },
            )
            .unwrap();
        assert_eq!(g.placement_roots(group), vec![a, b]);
    }

    #[test]
    fn graph_json_roundtrip_validates() {
        let mut g = ProtocolComputationGraph::new("p");
        let lh = param(&mut g, "lh", "LiquidHandler", 0);
        let plate = param(&mut g, "plate", "Plate", 1);
        call(&mut g, "aspirate", lh, plate);
        g.derive_edges();
        let json = serde_json::to_string(&g).unwrap();
        let back: ProtocolComputationGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
        assert!(back.validate().is_empty());
    }
}
