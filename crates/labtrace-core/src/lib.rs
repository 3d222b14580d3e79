pub mod catalog;
pub mod edge;
pub mod error;
pub mod fact;
pub mod graph;
pub mod hierarchy;
pub mod id;
pub mod kind;
pub mod node;
pub mod record;
pub mod typeexpr;

// Re-export commonly used types
pub use catalog::{count_range_key, Dimensions, KindMetadata, ResourceCatalog};
pub use edge::{EdgeKind, OrderingEdge};
pub use error::CoreError;
pub use fact::{StateFact, StatePrecondition};
pub use graph::ProtocolComputationGraph;
pub use hierarchy::{DeckTopology, HierarchyRegistry, ResourceChain};
pub use id::{OperationId, ResourceId};
pub use kind::{ResourceCategory, ResourceKind, Shape};
pub use node::{
    Access, AccessKey, ArgumentBinding, Arm, BindingValue, Literal, NodeKind, OperationDraft,
    OperationNode, ResourceNode, ResourceOrigin, SourcePosition,
};
pub use record::{
    AnalysisOutcome, AnalysisRecord, AnalysisWarning, FailureModeSummary, InferredRequirement,
    MachineRequirement, Quantity, QuantityUnit, SimulationLevel, StructuralFailure,
    ViolationSummary, WarningKind,
};
pub use typeexpr::{inspect, parse_type_expr, DeclaredType, KeyClass, TypeExpr};
