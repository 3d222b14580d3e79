//! Static loop bounds.
//!
//! A loop is bounded when its iteration count follows from the source
//! alone: a literal `range(n)`, a literal list, a well-range key, or a
//! labware whose dimensions are in the catalog.

use labtrace_core::{
    count_range_key, Access, AccessKey, NodeKind, OperationId, ProtocolComputationGraph, ResourceCatalog,
    ResourceId, ResourceOrigin,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "bound", rename_all = "snake_case")]
pub enum LoopBound {
    Exact(u64),
    Unbounded { reason: String },
}

impl LoopBound {
    pub fn count(&self) -> Option<u64> {
        match self {
            LoopBound::Exact(n) => Some(*n),
            LoopBound::Unbounded { .. } => None,
        }
    }
}

pub struct BoundsAnalyzer<'a> {
    graph: &'a ProtocolComputationGraph,
    catalog: &'a ResourceCatalog,
}

impl<'a> BoundsAnalyzer<'a> {
    pub fn new(graph: &'a ProtocolComputationGraph, catalog: &'a ResourceCatalog) -> Self {
        BoundsAnalyzer { graph, catalog }
    }

    pub fn loop_bound(&self, op: OperationId) -> LoopBound {
        let Some(node) = self.graph.operation(op) else {
            return LoopBound::Unbounded { reason: format!("{op} is not in the graph") };
        };
        match &node.kind {
            NodeKind::Foreach { static_count: Some(n), .. } => LoopBound::Exact(*n),
            NodeKind::Foreach { collection: Some(c), .. } => match self.collection_size(*c) {
                Some(n) => LoopBound::Exact(n),
                None => {
                    let name = self.graph.resource(*c).map_or("?", |r| r.name.as_str());
                    LoopBound::Unbounded { reason: format!("size of `{name}` is not known statically") }
                }
            },
            NodeKind::Foreach { .. } => LoopBound::Unbounded {
                reason: format!("`{}` loop count depends on runtime values", node.name),
            },
            _ => LoopBound::Unbounded { reason: format!("{op} is not a loop") },
        }
    }

    /// Number of items a collection-valued resource holds, when known.
    pub fn collection_size(&self, id: ResourceId) -> Option<u64> {
        let node = self.graph.resource(id)?;
        match &node.origin {
            ResourceOrigin::Grouped { members } => Some(members.len() as u64),
            ResourceOrigin::Derived { from, access } => self.derived_size(*from, access),
            ResourceOrigin::Parameter { .. } if !node.is_collection() => self.item_count(id),
            _ => None,
        }
    }

    /// Product of the bounds of every loop enclosing `op`; `None` when any
    /// of them is unbounded.
    pub fn enclosing_multiplier(&self, op: OperationId) -> Option<u64> {
        let mut total = 1u64;
        let mut current = self.graph.operation(op)?.parent;
        while let Some(parent) = current {
            let node = self.graph.operation(parent)?;
            if matches!(node.kind, NodeKind::Foreach { .. }) {
                total = total.checked_mul(self.loop_bound(parent).count()?)?;
            }
            current = node.parent;
        }
        Some(total)
    }

    fn derived_size(&self, from: ResourceId, access: &Access) -> Option<u64> {
        match access {
            Access::Subscript { key: AccessKey::Label(label) } => count_range_key(label),
            Access::Subscript { key: AccessKey::Slice { start, stop } } => {
                let n = self.collection_size(from)?;
                Some(slice_len(n, *start, *stop))
            }
            Access::Subscript { .. } => None,
            Access::Attribute { name } => match name.as_str() {
                "children" => self.item_count(from),
                _ => None,
            },
            Access::Method { name, args } => match name.as_str() {
                "get_all_items" | "get_all_tips" | "children" => self.item_count(from),
                "get_wells" | "get_items" | "get_tips" => match args.first() {
                    Some(arg) => literal_key_count(arg),
                    None => self.item_count(from),
                },
                _ => None,
            },
        }
    }

    /// Item count of an itemized labware, honoring a named override for
    /// the resource's placement root.
    fn item_count(&self, id: ResourceId) -> Option<u64> {
        let node = self.graph.resource(id)?;
        let kind = node.kind()?;
        kind.item_kind()?;
        let root = self.graph.lineage(id).last().copied().unwrap_or(id);
        let root_name = self.graph.resource(root).map(|r| r.name.as_str());
        self.catalog.dimensions(Some(kind), root_name).map(|d| d.count())
    }
}

/// Length of `range(n)[start:stop]`.
fn slice_len(n: u64, start: Option<i64>, stop: Option<i64>) -> u64 {
    let n = n as i64;
    let clamp = |v: i64| if v < 0 { (v + n).max(0) } else { v.min(n) };
    let start = start.map_or(0, clamp);
    let stop = stop.map_or(n, clamp);
    (stop - start).max(0) as u64
}

/// Count for an accessor argument written as a string or list literal.
fn literal_key_count(arg: &str) -> Option<u64> {
    let arg = arg.trim();
    if let Some(inner) = arg.strip_prefix('[').and_then(|a| a.strip_suffix(']')) {
        let items: Vec<&str> = inner.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        let mut total = 0;
        for item in items {
            total += count_range_key(unquote(item)?)?;
        }
        return Some(total);
    }
    count_range_key(unquote(arg)?)
}

fn unquote(text: &str) -> Option<&str> {
    let text = text.trim();
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .or_else(|| text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use labtrace_core::{DeclaredType, DeckTopology, HierarchyRegistry, OperationDraft, Shape, SourcePosition};

    fn plate_graph() -> (ProtocolComputationGraph, ResourceId) {
        let hierarchy = HierarchyRegistry::standard();
        let mut graph = ProtocolComputationGraph::new("p");
        let declared = DeclaredType::parse("Plate");
        let chain = hierarchy.chain_for_opt(declared.placement_kind(), DeckTopology::SlotBased);
        let plate = graph
            .add_resource("plate", declared, chain, ResourceOrigin::Parameter { index: 0 })
            .unwrap();
        (graph, plate)
    }

    fn derive(graph: &mut ProtocolComputationGraph, from: ResourceId, access: Access, shape: Shape) -> ResourceId {
        let name = format!("{}{}", graph.resource(from).unwrap().name, access);
        graph
            .add_resource(
                name,
                DeclaredType::from_shape(shape),
                Default::default(),
                ResourceOrigin::Derived { from, access },
            )
            .unwrap()
    }

    #[test]
    fn plate_children_is_96() {
        let (mut graph, plate) = plate_graph();
        let wells = derive(
            &mut graph,
            plate,
            Access::Attribute { name: "children".into() },
            Shape::Collection(labtrace_core::ResourceKind::Well),
        );
        let catalog = ResourceCatalog::standard();
        let bounds = BoundsAnalyzer::new(&graph, &catalog);
        assert_eq!(bounds.collection_size(wells), Some(96));
        assert_eq!(bounds.collection_size(plate), Some(96));
    }

    #[test]
    fn label_and_slice_sizes() {
        let (mut graph, plate) = plate_graph();
        let column = derive(
            &mut graph,
            plate,
            Access::Subscript { key: AccessKey::Label("A1:H1".into()) },
            Shape::Collection(labtrace_core::ResourceKind::Well),
        );
        let head = derive(
            &mut graph,
            plate,
            Access::Subscript { key: AccessKey::Slice { start: None, stop: Some(-90) } },
            Shape::Collection(labtrace_core::ResourceKind::Well),
        );
        let catalog = ResourceCatalog::standard();
        let bounds = BoundsAnalyzer::new(&graph, &catalog);
        assert_eq!(bounds.collection_size(column), Some(8));
        assert_eq!(bounds.collection_size(head), Some(6));
    }

    #[test]
    fn named_override_and_unknown_sizes() {
        let (graph, plate) = plate_graph();
        let catalog = ResourceCatalog::standard().with_named(
            "plate",
            labtrace_core::KindMetadata::itemized(labtrace_core::ResourceKind::Plate, 16, 24, 100.0),
        );
        let bounds = BoundsAnalyzer::new(&graph, &catalog);
        assert_eq!(bounds.collection_size(plate), Some(384));

        let empty = ResourceCatalog::empty();
        assert_eq!(BoundsAnalyzer::new(&graph, &empty).collection_size(plate), None);
    }

    #[test]
    fn loop_bounds() {
        let (mut graph, plate) = plate_graph();
        let counted = graph
            .add_operation(OperationDraft::structural(
                "for",
                NodeKind::foreach(None, None, Some(12)),
                SourcePosition::default(),
            ))
            .unwrap();
        let over_plate = graph
            .add_operation(OperationDraft::structural(
                "for",
                NodeKind::foreach(Some(plate), None, None),
                SourcePosition::default(),
            ))
            .unwrap();
        let nested = graph
            .add_operation(
                OperationDraft::structural("while", NodeKind::foreach(None, None, None), SourcePosition::default())
                    .within(Some((counted, labtrace_core::Arm::Body))),
            )
            .unwrap();

        let catalog = ResourceCatalog::standard();
        let bounds = BoundsAnalyzer::new(&graph, &catalog);
        assert_eq!(bounds.loop_bound(counted), LoopBound::Exact(12));
        assert_eq!(bounds.loop_bound(over_plate), LoopBound::Exact(96));
        assert!(matches!(bounds.loop_bound(nested), LoopBound::Unbounded { .. }));
        assert_eq!(bounds.enclosing_multiplier(nested), Some(12));
    }

    #[test]
    fn accessor_argument_counts() {
        assert_eq!(literal_key_count("\"A1:H1\""), Some(8));
        assert_eq!(literal_key_count("['A1', 'B1']"), Some(2));
        assert_eq!(literal_key_count("wells"), None);
        assert_eq!(slice_len(96, Some(2), Some(5)), 3);
        assert_eq!(slice_len(10, Some(8), Some(2)), 0);
    }
}
