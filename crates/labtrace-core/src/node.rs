//! Resource and operation nodes of the computation graph.
//!
//! A [`ResourceNode`] is a named value the procedure touches: a declared
//! parameter, something derived from one by subscript or member access, a
//! value produced by an operation, or the representative element of a loop.
//! An [`OperationNode`] is one hardware-affecting call, or a structural
//! container (`foreach`, `conditional`) holding child operations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hierarchy::ResourceChain;
use crate::id::{OperationId, ResourceId};
use crate::kind::ResourceKind;
use crate::typeexpr::{DeclaredType, KeyClass};

// ---------------------------------------------------------------------------
// Source positions and literals
// ---------------------------------------------------------------------------

/// 1-based line and column in the procedure's module source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: u32,
    pub column: u32,
}

impl SourcePosition {
    pub fn new(line: u32, column: u32) -> Self {
        SourcePosition { line, column }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A value known from the source text alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
}

impl Literal {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(i) => Some(*i as f64),
            Literal::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Literal::Int(i) => Some(*i),
            Literal::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Python truthiness.
    pub fn truthy(&self) -> bool {
        match self {
            Literal::None => false,
            Literal::Bool(b) => *b,
            Literal::Int(i) => *i != 0,
            Literal::Float(x) => *x != 0.0,
            Literal::Str(s) => !s.is_empty(),
            Literal::List(items) => !items.is_empty(),
        }
    }

    /// Volumes from a scalar or a per-channel list.
    pub fn as_volumes(&self) -> Option<Vec<f64>> {
        match self {
            Literal::List(items) => items.iter().map(Literal::as_f64).collect(),
            other => other.as_f64().map(|v| vec![v]),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::None => f.write_str("None"),
            Literal::Bool(true) => f.write_str("True"),
            Literal::Bool(false) => f.write_str("False"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) => write!(f, "{x:?}"),
            Literal::Str(s) => write!(f, "{s:?}"),
            Literal::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Resource nodes
// ---------------------------------------------------------------------------

/// Subscript key of a derived resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AccessKey {
    /// A well name or range: `"A1"`, `"A1:H1"`.
    Label(String),
    Index(i64),
    Slice { start: Option<i64>, stop: Option<i64> },
    /// A key computed at runtime; the text is the source expression.
    Dynamic(String),
}

impl AccessKey {
    pub fn class(&self) -> KeyClass {
        match self {
            AccessKey::Label(_) => KeyClass::Label,
            AccessKey::Index(_) => KeyClass::Index,
            AccessKey::Slice { .. } => KeyClass::Slice,
            AccessKey::Dynamic(_) => KeyClass::Unknown,
        }
    }
}

/// How a derived resource was reached from its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Access {
    Subscript { key: AccessKey },
    Attribute { name: String },
    Method { name: String, args: Vec<String> },
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Subscript { key } => match key {
                AccessKey::Label(label) => write!(f, "[{label:?}]"),
                AccessKey::Index(i) => write!(f, "[{i}]"),
                AccessKey::Slice { start, stop } => {
                    let s = start.map(|v| v.to_string()).unwrap_or_default();
                    let e = stop.map(|v| v.to_string()).unwrap_or_default();
                    write!(f, "[{s}:{e}]")
                }
                AccessKey::Dynamic(expr) => write!(f, "[{expr}]"),
            },
            Access::Attribute { name } => write!(f, ".{name}"),
            Access::Method { name, args } => write!(f, ".{name}({})", args.join(", ")),
        }
    }
}

/// Where a resource node comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceOrigin {
    /// The procedure's `index`-th parameter.
    Parameter { index: usize },
    /// Subscript or member access on another resource.
    Derived { from: ResourceId, access: Access },
    /// The value returned by an operation.
    Produced { by: OperationId },
    /// A literal list of resources: `[plate_a, plate_b]`.
    Grouped { members: Vec<ResourceId> },
    /// The representative element of a loop over `collection`.
    LoopElement { collection: ResourceId },
}

/// A named value in the procedure. Immutable once added to the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: ResourceId,
    /// Source-level name: a parameter name or the access expression.
    pub name: String,
    pub declared: DeclaredType,
    /// Ancestor kinds, nearest first, resolved for the placement kind.
    pub chain: ResourceChain,
    pub origin: ResourceOrigin,
}

impl ResourceNode {
    /// Kind of a single value; `None` for collections and untyped values.
    pub fn kind(&self) -> Option<ResourceKind> {
        self.declared.primary()
    }

    pub fn is_collection(&self) -> bool {
        self.declared.collection
    }

    pub fn element_kind(&self) -> Option<ResourceKind> {
        if self.declared.collection {
            self.declared.element
        } else {
            None
        }
    }

    /// Kind that determines placement and content semantics.
    pub fn placement_kind(&self) -> Option<ResourceKind> {
        self.declared.placement_kind()
    }
}

// ---------------------------------------------------------------------------
// Operation nodes
// ---------------------------------------------------------------------------

/// Value bound to one call argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BindingValue {
    Resource(ResourceId),
    Literal(Literal),
    /// Only known at runtime; the text is the source expression.
    Dynamic { expr: String },
}

/// One argument of a call, bound by keyword or by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentBinding {
    pub name: Option<String>,
    pub position: Option<usize>,
    pub value: BindingValue,
    /// The value is a static literal and can be evaluated ahead of time.
    pub can_precompute: bool,
}

impl ArgumentBinding {
    pub fn positional(position: usize, value: BindingValue) -> Self {
        let can_precompute = matches!(value, BindingValue::Literal(_));
        ArgumentBinding { name: None, position: Some(position), value, can_precompute }
    }

    pub fn keyword(name: impl Into<String>, value: BindingValue) -> Self {
        let can_precompute = matches!(value, BindingValue::Literal(_));
        ArgumentBinding { name: Some(name.into()), position: None, value, can_precompute }
    }
}

/// Which child list of a container a child belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arm {
    Body,
    Then,
    Else,
}

/// Node kind tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Every argument is resolvable from the source.
    Static,
    /// At least one argument is only known at runtime.
    Dynamic,
    /// Loop over `collection` (or a `range`), body executed per element.
    Foreach {
        collection: Option<ResourceId>,
        element: Option<ResourceId>,
        static_count: Option<u64>,
        /// Resources created inside the body; reset between iterations.
        scoped: Vec<ResourceId>,
        children: Vec<OperationId>,
    },
    /// Statically undecidable branch; both arms kept.
    Conditional {
        condition: String,
        then_branch: Vec<OperationId>,
        else_branch: Vec<OperationId>,
    },
    /// Tracing stopped here (branch or call depth exceeded).
    Unanalyzed { reason: String },
}

impl NodeKind {
    pub fn foreach(
        collection: Option<ResourceId>,
        element: Option<ResourceId>,
        static_count: Option<u64>,
    ) -> Self {
        NodeKind::Foreach { collection, element, static_count, scoped: Vec::new(), children: Vec::new() }
    }

    pub fn conditional(condition: impl Into<String>) -> Self {
        NodeKind::Conditional {
            condition: condition.into(),
            then_branch: Vec::new(),
            else_branch: Vec::new(),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Foreach { .. } | NodeKind::Conditional { .. })
    }

    fn arm_mut(&mut self, arm: Arm) -> Option<&mut Vec<OperationId>> {
        match (self, arm) {
            (NodeKind::Foreach { children, .. }, Arm::Body) => Some(children),
            (NodeKind::Conditional { then_branch, .. }, Arm::Then) => Some(then_branch),
            (NodeKind::Conditional { else_branch, .. }, Arm::Else) => Some(else_branch),
            _ => None,
        }
    }

    pub(crate) fn push_child(&mut self, arm: Arm, child: OperationId) -> bool {
        match self.arm_mut(arm) {
            Some(list) => {
                list.push(child);
                true
            }
            None => false,
        }
    }

    /// All direct children, body or then-arm first.
    pub fn children(&self) -> Vec<OperationId> {
        match self {
            NodeKind::Foreach { children, .. } => children.clone(),
            NodeKind::Conditional { then_branch, else_branch, .. } => {
                then_branch.iter().chain(else_branch).copied().collect()
            }
            _ => Vec::new(),
        }
    }
}

/// One call or structural container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationNode {
    pub id: OperationId,
    /// Method name, or `for` / `while` / `if` for containers.
    pub name: String,
    pub receiver: Option<ResourceId>,
    pub receiver_kind: Option<ResourceKind>,
    pub bindings: Vec<ArgumentBinding>,
    pub position: SourcePosition,
    pub kind: NodeKind,
    /// Enclosing foreach or conditional.
    pub parent: Option<OperationId>,
    /// Resource node holding this call's return value, if it is used.
    pub produces: Option<ResourceId>,
}

impl OperationNode {
    /// True for hardware calls (static or dynamic), false for containers
    /// and unanalyzed markers.
    pub fn is_call(&self) -> bool {
        matches!(self.kind, NodeKind::Static | NodeKind::Dynamic)
    }

    /// Binding for parameter `param` declared at `index`: keyword first,
    /// then position.
    pub fn argument(&self, param: &str, index: usize) -> Option<&ArgumentBinding> {
        self.bindings
            .iter()
            .find(|b| b.name.as_deref() == Some(param))
            .or_else(|| self.bindings.iter().find(|b| b.position == Some(index)))
    }

    /// Resource ids bound to arguments.
    pub fn resource_arguments(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.bindings.iter().filter_map(|b| match b.value {
            BindingValue::Resource(id) => Some(id),
            _ => None,
        })
    }
}

/// Fields of a new operation; the graph assigns the id and receiver kind.
#[derive(Debug, Clone)]
pub struct OperationDraft {
    pub name: String,
    pub receiver: Option<ResourceId>,
    pub bindings: Vec<ArgumentBinding>,
    pub position: SourcePosition,
    pub kind: NodeKind,
    pub parent: Option<(OperationId, Arm)>,
}

impl OperationDraft {
    /// A call; static unless an argument is dynamic.
    pub fn call(
        name: impl Into<String>,
        receiver: ResourceId,
        bindings: Vec<ArgumentBinding>,
        position: SourcePosition,
    ) -> Self {
        let dynamic = bindings.iter().any(|b| matches!(b.value, BindingValue::Dynamic { .. }));
        OperationDraft {
            name: name.into(),
            receiver: Some(receiver),
            bindings,
            position,
            kind: if dynamic { NodeKind::Dynamic } else { NodeKind::Static },
            parent: None,
        }
    }

    /// A container or marker node without a receiver.
    pub fn structural(name: impl Into<String>, kind: NodeKind, position: SourcePosition) -> Self {
        OperationDraft {
            name: name.into(),
            receiver: None,
            bindings: Vec::new(),
            position,
            kind,
            parent: None,
        }
    }

    pub fn within(mut self, parent: Option<(OperationId, Arm)>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_bindings(mut self, bindings: Vec<ArgumentBinding>) -> Self {
        self.bindings = bindings;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_truthiness_and_volumes() {
        assert!(!Literal::Int(0).truthy());
        assert!(Literal::Str("x".into()).truthy());
        assert!(!Literal::List(vec![]).truthy());
        assert_eq!(Literal::Int(50).as_volumes(), Some(vec![50.0]));
        assert_eq!(
            Literal::List(vec![Literal::Int(10), Literal::Float(2.5)]).as_volumes(),
            Some(vec![10.0, 2.5])
        );
        assert_eq!(Literal::Str("a".into()).as_volumes(), None);
    }

    #[test]
    fn access_display() {
        let a = Access::Subscript { key: AccessKey::Label("A1:H1".into()) };
        assert_eq!(a.to_string(), "[\"A1:H1\"]");
        let m = Access::Method { name: "get_well".into(), args: vec!["\"A1\"".into()] };
        assert_eq!(m.to_string(), ".get_well(\"A1\")");
        let s = Access::Subscript { key: AccessKey::Slice { start: Some(0), stop: None } };
        assert_eq!(s.to_string(), "[0:]");
    }

    #[test]
    fn dynamic_argument_makes_call_dynamic() {
        let draft = OperationDraft::call(
            "aspirate",
            ResourceId(0),
            vec![ArgumentBinding::keyword("vols", BindingValue::Dynamic { expr: "v".into() })],
            SourcePosition::default(),
        );
        assert_eq!(draft.kind, NodeKind::Dynamic);
        assert!(!draft.bindings[0].can_precompute);
    }

    #[test]
    fn argument_lookup_prefers_keyword() {
        let op = OperationNode {
            id: OperationId(0),
            name: "aspirate".into(),
            receiver: Some(ResourceId(0)),
            receiver_kind: Some(ResourceKind::LiquidHandler),
            bindings: vec![
                ArgumentBinding::positional(0, BindingValue::Resource(ResourceId(1))),
                ArgumentBinding::keyword("vols", BindingValue::Literal(Literal::Int(50))),
            ],
            position: SourcePosition::new(3, 5),
            kind: NodeKind::Static,
            parent: None,
            produces: None,
        };
        assert_eq!(
            op.argument("resources", 0).map(|b| &b.value),
            Some(&BindingValue::Resource(ResourceId(1)))
        );
        assert!(op.argument("vols", 1).unwrap().can_precompute);
        assert_eq!(op.resource_arguments().collect::<Vec<_>>(), vec![ResourceId(1)]);
    }
}
