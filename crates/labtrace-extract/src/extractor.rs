//! Static computation-graph extraction.
//!
//! Walks a procedure's syntax tree without executing it. Parameters with
//! resource annotations become resource nodes; subscripts and accessor
//! calls on them become derived resources; calls on machines and the deck
//! become operation nodes. Loops become `foreach` nodes with one
//! representative element, undecidable conditionals become `conditional`
//! nodes with both arms kept, and literal conditions are folded.
//!
//! Calls the walk cannot see through (helper functions defined in the
//! module, unknown free functions) are reported as [`Unresolved`]; the
//! pipeline then re-derives the graph with the tracer.

use std::collections::{BTreeSet, HashMap};

use labtrace_core::{
    Access, AccessKey, AnalysisWarning, ArgumentBinding, Arm, BindingValue, DeckTopology,
    DeclaredType, HierarchyRegistry, Literal, NodeKind, OperationDraft, OperationId,
    ProtocolComputationGraph, ResourceChain, ResourceId, ResourceOrigin, Shape, SourcePosition,
    WarningKind,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tree_sitter::Node;

use crate::error::ExtractError;
use crate::signature::{signature_of, ProcedureSignature};
use crate::source::ParsedModule;
use crate::syntax::{
    comparison_operators, field_children, fold_binary, fold_compare, literal, named_children,
    position, text, unparenthesize,
};

/// Builtins that never affect hardware.
pub const INERT_BUILTINS: &[&str] = &[
    "print", "str", "int", "float", "bool", "abs", "min", "max", "sum", "round", "isinstance",
    "dict", "set", "getattr", "hasattr", "repr", "format", "divmod", "any", "all", "map",
    "filter", "type", "id", "hash", "ord", "chr",
];

/// Why the static walk could not fully resolve the procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnresolvedReason {
    /// A call to a function defined in the same module.
    HelperCall { name: String },
    /// A call to a free function the extractor does not know.
    UnknownCall { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unresolved {
    pub reason: UnresolvedReason,
    pub position: SourcePosition,
}

/// Result of a static walk.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub signature: ProcedureSignature,
    pub graph: ProtocolComputationGraph,
    pub unresolved: Vec<Unresolved>,
    pub warnings: Vec<AnalysisWarning>,
}

impl Extraction {
    /// True when no call escaped the walk.
    pub fn is_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Extracts the computation graph of procedure `name`.
pub fn extract_procedure(
    module: &ParsedModule,
    name: &str,
    hierarchy: &HierarchyRegistry,
    topology: DeckTopology,
) -> Result<Extraction, ExtractError> {
    let def = module
        .function(name)
        .ok_or_else(|| ExtractError::ProcedureNotFound { name: name.to_string() })?;
    let signature = signature_of(name, &def, module.source());

    let mut helpers: BTreeSet<String> = module.function_names().into_iter().collect();
    for stmt in named_children(def.body) {
        if stmt.kind() == "function_definition" {
            if let Some(n) = stmt.child_by_field_name("name") {
                helpers.insert(text(n, module.source()).to_string());
            }
        }
    }

    let mut ex = Extractor {
        source: module.source(),
        hierarchy,
        topology,
        helpers,
        graph: ProtocolComputationGraph::new(name),
        env: HashMap::new(),
        derived: HashMap::new(),
        produced: HashMap::new(),
        container: None,
        unresolved: Vec::new(),
        warnings: Vec::new(),
    };
    ex.bind_parameters(&signature)?;
    ex.block(def.body)?;
    ex.graph.derive_edges();

    debug!(
        procedure = name,
        operations = ex.graph.operations().len(),
        resources = ex.graph.resources().len(),
        unresolved = ex.unresolved.len(),
        "static extraction finished"
    );

    Ok(Extraction {
        signature,
        graph: ex.graph,
        unresolved: ex.unresolved,
        warnings: ex.warnings,
    })
}

/// Abstract value of an expression during the walk.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Resource(ResourceId),
    Literal(Literal),
    /// Runtime-only; holds the source text.
    Dynamic(String),
    /// `range(..)` with its count when literal.
    Range(Option<u64>),
    Enumerate(Box<Value>),
    Zip(Vec<Value>),
    /// Return value of a hardware call, materialized on first use.
    Produced(OperationId),
}

struct Extractor<'a> {
    source: &'a str,
    hierarchy: &'a HierarchyRegistry,
    topology: DeckTopology,
    helpers: BTreeSet<String>,
    graph: ProtocolComputationGraph,
    env: HashMap<String, Value>,
    /// (parent, access text) -> derived resource
    derived: HashMap<(ResourceId, String), ResourceId>,
    produced: HashMap<OperationId, ResourceId>,
    container: Option<(OperationId, Arm)>,
    unresolved: Vec<Unresolved>,
    warnings: Vec<AnalysisWarning>,
}

impl<'a> Extractor<'a> {
    fn text(&self, node: Node<'_>) -> &'a str {
        text(node, self.source)
    }

    fn chain(&self, declared: &DeclaredType) -> ResourceChain {
        self.hierarchy.chain_for_opt(declared.placement_kind(), self.topology)
    }

    fn warn(&mut self, kind: WarningKind, message: String, node: Node<'_>) {
        self.warnings.push(AnalysisWarning { kind, message, position: Some(position(node)) });
    }

    fn bind_parameters(&mut self, signature: &ProcedureSignature) -> Result<(), ExtractError> {
        for (index, param) in signature.parameters.iter().enumerate() {
            if param.declared.is_resource() {
                let chain = self.chain(&param.declared);
                let id = self.graph.add_resource(
                    param.name.clone(),
                    param.declared.clone(),
                    chain,
                    ResourceOrigin::Parameter { index },
                )?;
                self.env.insert(param.name.clone(), Value::Resource(id));
            } else {
                self.env.insert(param.name.clone(), Value::Dynamic(param.name.clone()));
            }
        }
        Ok(())
    }

    // ---- resources ----

    fn derive(&mut self, from: ResourceId, access: Access, shape: Shape) -> Result<ResourceId, ExtractError> {
        let key = (from, access.to_string());
        if let Some(id) = self.derived.get(&key) {
            return Ok(*id);
        }
        let parent_name = self.graph.resource(from).map(|r| r.name.clone()).unwrap_or_default();
        let declared = DeclaredType::from_shape(shape);
        let chain = self.chain(&declared);
        let id = self.graph.add_resource(
            format!("{parent_name}{access}"),
            declared,
            chain,
            ResourceOrigin::Derived { from, access },
        )?;
        self.derived.insert(key, id);
        Ok(id)
    }

    fn materialize(&mut self, op: OperationId, name: &str) -> Result<ResourceId, ExtractError> {
        if let Some(id) = self.produced.get(&op) {
            return Ok(*id);
        }
        let id = self.graph.add_resource(
            name,
            DeclaredType::unknown(),
            ResourceChain::new(),
            ResourceOrigin::Produced { by: op },
        )?;
        self.produced.insert(op, id);
        Ok(id)
    }

    fn group(&mut self, members: Vec<ResourceId>, name: &str) -> Result<ResourceId, ExtractError> {
        let kinds: BTreeSet<_> = members
            .iter()
            .filter_map(|m| self.graph.resource(*m).and_then(|r| r.placement_kind()))
            .collect();
        let declared = match (kinds.len(), kinds.iter().next()) {
            (1, Some(kind)) => DeclaredType::from_shape(Shape::Collection(*kind)),
            _ => DeclaredType { collection: true, ..DeclaredType::unknown() },
        };
        let chain = self.chain(&declared);
        Ok(self.graph.add_resource(name, declared, chain, ResourceOrigin::Grouped { members })?)
    }

    fn element_shape(&self, collection: ResourceId) -> Option<Shape> {
        let node = self.graph.resource(collection)?;
        if node.declared.collection {
            node.declared.element.map(Shape::Single)
        } else {
            node.declared.kinds.iter().find_map(|k| k.item_kind()).map(Shape::Single)
        }
    }

    fn to_binding(&mut self, value: Value, node: Node<'_>) -> Result<BindingValue, ExtractError> {
        Ok(match value {
            Value::Resource(id) => BindingValue::Resource(id),
            Value::Literal(lit) => BindingValue::Literal(lit),
            Value::Produced(op) => {
                let name = self.text(node);
                BindingValue::Resource(self.materialize(op, name)?)
            }
            _ => BindingValue::Dynamic { expr: self.text(node).to_string() },
        })
    }

    // ---- expressions ----

    fn eval(&mut self, node: Node<'_>) -> Result<Value, ExtractError> {
        let node = unparenthesize(node);
        if let Some(lit) = literal(node, self.source) {
            return Ok(Value::Literal(lit));
        }
        let src = self.text(node).to_string();
        match node.kind() {
            "identifier" => Ok(self.env.get(&src).cloned().unwrap_or(Value::Dynamic(src))),
            "await" => match node.named_child(0) {
                Some(inner) => self.eval(inner),
                None => Ok(Value::Dynamic(src)),
            },
            "attribute" => {
                let (Some(object), Some(attr)) =
                    (node.child_by_field_name("object"), node.child_by_field_name("attribute"))
                else {
                    return Ok(Value::Dynamic(src));
                };
                let attr = self.text(attr).to_string();
                if let Value::Resource(r) = self.eval(object)? {
                    let shape = self.graph.resource(r).and_then(|n| n.declared.member_shape(&attr));
                    if let Some(shape) = shape {
                        let id = self.derive(r, Access::Attribute { name: attr }, shape)?;
                        return Ok(Value::Resource(id));
                    }
                }
                Ok(Value::Dynamic(src))
            }
            "subscript" => self.subscript(node),
            "call" => self.call(node),
            "list" | "tuple" | "expression_list" => {
                let mut members = Vec::new();
                let mut all_resources = true;
                for child in named_children(node) {
                    match self.eval(child)? {
                        Value::Resource(id) => members.push(id),
                        _ => all_resources = false,
                    }
                }
                if all_resources && !members.is_empty() {
                    return Ok(Value::Resource(self.group(members, &src)?));
                }
                Ok(Value::Dynamic(src))
            }
            "comparison_operator" => {
                let operands = named_children(node);
                let ops = comparison_operators(node, self.source);
                let mut values = Vec::new();
                for operand in operands {
                    values.push(self.eval(operand)?);
                }
                let mut result = true;
                for (i, op) in ops.iter().enumerate() {
                    match (values.get(i), values.get(i + 1)) {
                        (Some(Value::Literal(a)), Some(Value::Literal(b))) => match fold_compare(op, a, b) {
                            Some(r) => result &= r,
                            None => return Ok(Value::Dynamic(src)),
                        },
                        _ => return Ok(Value::Dynamic(src)),
                    }
                }
                Ok(Value::Literal(Literal::Bool(result)))
            }
            "boolean_operator" => {
                let (Some(l), Some(r), Some(op)) = (
                    node.child_by_field_name("left"),
                    node.child_by_field_name("right"),
                    node.child_by_field_name("operator"),
                ) else {
                    return Ok(Value::Dynamic(src));
                };
                let is_and = self.text(op) == "and";
                let left = self.eval(l)?;
                let right = self.eval(r)?;
                match (left, right) {
                    (Value::Literal(a), _) if is_and && !a.truthy() => Ok(Value::Literal(a)),
                    (Value::Literal(a), _) if !is_and && a.truthy() => Ok(Value::Literal(a)),
                    (Value::Literal(_), Value::Literal(b)) => Ok(Value::Literal(b)),
                    _ => Ok(Value::Dynamic(src)),
                }
            }
            "not_operator" => match node.child_by_field_name("argument") {
                Some(arg) => match self.eval(arg)? {
                    Value::Literal(l) => Ok(Value::Literal(Literal::Bool(!l.truthy()))),
                    _ => Ok(Value::Dynamic(src)),
                },
                None => Ok(Value::Dynamic(src)),
            },
            "binary_operator" => {
                let (Some(l), Some(r), Some(op)) = (
                    node.child_by_field_name("left"),
                    node.child_by_field_name("right"),
                    node.child_by_field_name("operator"),
                ) else {
                    return Ok(Value::Dynamic(src));
                };
                let op = self.text(op);
                match (self.eval(l)?, self.eval(r)?) {
                    (Value::Literal(a), Value::Literal(b)) => {
                        Ok(fold_binary(op, &a, &b).map(Value::Literal).unwrap_or(Value::Dynamic(src)))
                    }
                    _ => Ok(Value::Dynamic(src)),
                }
            }
            "list_comprehension" | "generator_expression" => self.comprehension(node),
            _ => Ok(Value::Dynamic(src)),
        }
    }

    /// `[w for w in wells]` is `wells`; anything else is dynamic.
    fn comprehension(&mut self, node: Node<'_>) -> Result<Value, ExtractError> {
        let src = self.text(node).to_string();
        let body = node.child_by_field_name("body");
        let clauses: Vec<_> = named_children(node).into_iter().filter(|c| c.kind() == "for_in_clause").collect();
        if let (Some(body), [clause]) = (body, clauses.as_slice()) {
            let left = clause.child_by_field_name("left");
            let right = clause.child_by_field_name("right");
            if let (Some(left), Some(right)) = (left, right) {
                if body.kind() == "identifier" && self.text(body) == self.text(left) {
                    if let Value::Resource(r) = self.eval(right)? {
                        return Ok(Value::Resource(r));
                    }
                }
            }
        }
        Ok(Value::Dynamic(src))
    }

    fn subscript_key(&mut self, key: Node<'_>) -> Result<AccessKey, ExtractError> {
        if key.kind() == "slice" {
            let bounds: Vec<Option<i64>> = named_children(key)
                .into_iter()
                .map(|c| literal(c, self.source).and_then(|l| l.as_int()))
                .collect();
            // `a:b`, `:b` and `a:` all parse to at most two named children;
            // position them by the colon.
            let colon = (0..key.child_count())
                .filter_map(|i| key.child(i))
                .position(|c| c.kind() == ":")
                .unwrap_or(0);
            let (start, stop) = match (bounds.len(), colon) {
                (2, _) => (bounds[0], bounds[1]),
                (1, 0) => (None, bounds[0]),
                (1, _) => (bounds[0], None),
                _ => (None, None),
            };
            return Ok(AccessKey::Slice { start, stop });
        }
        Ok(match self.eval(key)? {
            Value::Literal(Literal::Str(s)) => AccessKey::Label(s),
            Value::Literal(Literal::Int(i)) => AccessKey::Index(i),
            _ => AccessKey::Dynamic(self.text(key).to_string()),
        })
    }

    fn subscript(&mut self, node: Node<'_>) -> Result<Value, ExtractError> {
        let src = self.text(node).to_string();
        let keys = field_children(node, "subscript");
        let (Some(value), [key]) = (node.child_by_field_name("value"), keys.as_slice()) else {
            return Ok(Value::Dynamic(src));
        };
        let value = self.eval(value)?;
        let key = self.subscript_key(*key)?;
        match value {
            Value::Resource(r) => {
                let shape = self.graph.resource(r).and_then(|n| n.declared.subscript_shape(key.class()));
                match shape {
                    Some(shape) => Ok(Value::Resource(self.derive(r, Access::Subscript { key }, shape)?)),
                    None => Ok(Value::Dynamic(src)),
                }
            }
            Value::Literal(Literal::List(items)) => match key {
                AccessKey::Index(i) => {
                    let idx = if i < 0 { items.len() as i64 + i } else { i };
                    Ok(usize::try_from(idx)
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .map(Value::Literal)
                        .unwrap_or(Value::Dynamic(src)))
                }
                _ => Ok(Value::Dynamic(src)),
            },
            _ => Ok(Value::Dynamic(src)),
        }
    }

    fn call(&mut self, node: Node<'_>) -> Result<Value, ExtractError> {
        let src = self.text(node).to_string();
        let Some(func) = node.child_by_field_name("function") else {
            return Ok(Value::Dynamic(src));
        };
        let args = node.child_by_field_name("arguments");
        match func.kind() {
            "attribute" => {
                let (Some(object), Some(method)) =
                    (func.child_by_field_name("object"), func.child_by_field_name("attribute"))
                else {
                    return Ok(Value::Dynamic(src));
                };
                let method = self.text(method).to_string();
                let Value::Resource(receiver) = self.eval(object)? else {
                    self.eval_arguments(args)?;
                    return Ok(Value::Dynamic(src));
                };
                let declared = match self.graph.resource(receiver) {
                    Some(r) => r.declared.clone(),
                    None => return Ok(Value::Dynamic(src)),
                };
                if declared.primary().is_some_and(|k| k.receives_operations()) {
                    let op = self.record_call(receiver, &method, args, position(node))?;
                    return Ok(Value::Produced(op));
                }
                if let Some(shape) = declared.member_shape(&method) {
                    let arg_text = args
                        .map(|a| named_children(a).into_iter().map(|c| self.text(c).to_string()).collect())
                        .unwrap_or_default();
                    let access = Access::Method { name: method, args: arg_text };
                    return Ok(Value::Resource(self.derive(receiver, access, shape)?));
                }
                Ok(Value::Dynamic(src))
            }
            "identifier" => {
                let name = self.text(func).to_string();
                let arg_nodes: Vec<Node<'_>> = args.map(named_children).unwrap_or_default();
                match name.as_str() {
                    "range" => {
                        let mut bounds = Vec::new();
                        for a in &arg_nodes {
                            bounds.push(match self.eval(*a)? {
                                Value::Literal(Literal::Int(i)) => Some(i),
                                _ => None,
                            });
                        }
                        Ok(Value::Range(range_count(&bounds)))
                    }
                    "enumerate" => match arg_nodes.first() {
                        Some(a) => Ok(Value::Enumerate(Box::new(self.eval(*a)?))),
                        None => Ok(Value::Dynamic(src)),
                    },
                    "zip" => {
                        let mut values = Vec::new();
                        for a in &arg_nodes {
                            values.push(self.eval(*a)?);
                        }
                        Ok(Value::Zip(values))
                    }
                    "list" | "tuple" | "sorted" | "reversed" | "iter" => match arg_nodes.first() {
                        Some(a) => self.eval(*a),
                        None => Ok(Value::Literal(Literal::List(Vec::new()))),
                    },
                    "len" => match arg_nodes.first() {
                        Some(a) => match self.eval(*a)? {
                            Value::Literal(Literal::List(items)) => Ok(Value::Literal(Literal::Int(items.len() as i64))),
                            Value::Literal(Literal::Str(s)) => Ok(Value::Literal(Literal::Int(s.chars().count() as i64))),
                            _ => Ok(Value::Dynamic(src)),
                        },
                        None => Ok(Value::Dynamic(src)),
                    },
                    n if INERT_BUILTINS.contains(&n) => {
                        self.eval_arguments(args)?;
                        Ok(Value::Dynamic(src))
                    }
                    n => {
                        let reason = if self.helpers.contains(n) {
                            UnresolvedReason::HelperCall { name: name.clone() }
                        } else {
                            UnresolvedReason::UnknownCall { name: name.clone() }
                        };
                        debug!(call = %name, "call not resolvable statically");
                        self.unresolved.push(Unresolved { reason, position: position(node) });
                        self.eval_arguments(args)?;
                        Ok(Value::Dynamic(src))
                    }
                }
            }
            _ => Ok(Value::Dynamic(src)),
        }
    }

    /// Evaluates arguments only for the calls nested inside them.
    fn eval_arguments(&mut self, args: Option<Node<'_>>) -> Result<(), ExtractError> {
        for arg in args.map(named_children).unwrap_or_default() {
            let value_node = if arg.kind() == "keyword_argument" { arg.child_by_field_name("value") } else { Some(arg) };
            if let Some(v) = value_node {
                self.eval(v)?;
            }
        }
        Ok(())
    }

    fn record_call(
        &mut self,
        receiver: ResourceId,
        method: &str,
        args: Option<Node<'_>>,
        pos: SourcePosition,
    ) -> Result<OperationId, ExtractError> {
        let mut bindings = Vec::new();
        let mut index = 0;
        for arg in args.map(named_children).unwrap_or_default() {
            match arg.kind() {
                "keyword_argument" => {
                    let (Some(name), Some(value)) = (arg.child_by_field_name("name"), arg.child_by_field_name("value")) else {
                        continue;
                    };
                    let name = self.text(name).to_string();
                    let v = self.eval(value)?;
                    let binding = self.to_binding(v, value)?;
                    bindings.push(ArgumentBinding::keyword(name, binding));
                }
                "list_splat" | "dictionary_splat" => {
                    bindings.push(ArgumentBinding {
                        name: None,
                        position: None,
                        value: BindingValue::Dynamic { expr: self.text(arg).to_string() },
                        can_precompute: false,
                    });
                }
                "comment" => {}
                _ => {
                    let v = self.eval(arg)?;
                    let binding = self.to_binding(v, arg)?;
                    bindings.push(ArgumentBinding::positional(index, binding));
                    index += 1;
                }
            }
        }
        let draft = OperationDraft::call(method, receiver, bindings, pos).within(self.container);
        Ok(self.graph.add_operation(draft)?)
    }

    // ---- statements ----

    fn block(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        for stmt in named_children(node) {
            self.statement(stmt)?;
        }
        Ok(())
    }

    fn statement(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        match node.kind() {
            "expression_statement" => {
                for child in named_children(node) {
                    match child.kind() {
                        "assignment" => self.assign(child)?,
                        "augmented_assignment" => self.augmented_assign(child)?,
                        _ => {
                            self.eval(child)?;
                        }
                    }
                }
            }
            "for_statement" => self.for_loop(node)?,
            "while_statement" => self.while_loop(node)?,
            "if_statement" => {
                let alternatives = field_children(node, "alternative");
                if let (Some(cond), Some(body)) =
                    (node.child_by_field_name("condition"), node.child_by_field_name("consequence"))
                {
                    self.branch(cond, body, &alternatives, position(node))?;
                }
            }
            "with_statement" => {
                if let Some(body) = node.child_by_field_name("body") {
                    self.block(body)?;
                }
            }
            "try_statement" => {
                if let Some(body) = node.child_by_field_name("body") {
                    self.block(body)?;
                }
                for child in named_children(node) {
                    match child.kind() {
                        "else_clause" | "finally_clause" => {
                            let body = child
                                .child_by_field_name("body")
                                .or_else(|| named_children(child).into_iter().find(|c| c.kind() == "block"));
                            if let Some(body) = body {
                                self.block(body)?;
                            }
                        }
                        "except_clause" | "except_group_clause" => self.warn(
                            WarningKind::SkippedConstruct,
                            "exception handler not analyzed".to_string(),
                            child,
                        ),
                        _ => {}
                    }
                }
            }
            "return_statement" => {
                if let Some(value) = node.named_child(0) {
                    self.eval(value)?;
                }
            }
            "function_definition" | "class_definition" | "decorated_definition"
            | "import_statement" | "import_from_statement" | "future_import_statement"
            | "pass_statement" | "break_statement" | "continue_statement" | "global_statement"
            | "nonlocal_statement" | "comment" | "assert_statement" | "delete_statement"
            | "raise_statement" => {}
            other => {
                let message = format!("statement `{other}` not analyzed");
                self.warn(WarningKind::SkippedConstruct, message, node);
            }
        }
        Ok(())
    }

    fn bind(&mut self, target: Node<'_>, value: Value) -> Result<(), ExtractError> {
        match target.kind() {
            "identifier" => {
                let name = self.text(target).to_string();
                let value = match value {
                    Value::Produced(op) => Value::Resource(self.materialize(op, &name)?),
                    other => other,
                };
                self.env.insert(name, value);
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" => {
                let targets = named_children(target);
                let parts: Vec<Value> = match value {
                    Value::Literal(Literal::List(items)) if items.len() == targets.len() => {
                        items.into_iter().map(Value::Literal).collect()
                    }
                    _ => targets.iter().map(|t| Value::Dynamic(self.text(*t).to_string())).collect(),
                };
                for (t, v) in targets.into_iter().zip(parts) {
                    self.bind(t, v)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn assign(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        let Some(left) = node.child_by_field_name("left") else {
            return Ok(());
        };
        let Some(right) = node.child_by_field_name("right") else {
            return Ok(());
        };
        let targets = named_children(left);
        let is_pattern = matches!(left.kind(), "pattern_list" | "tuple_pattern" | "list_pattern");
        let right_items = named_children(unparenthesize(right));
        if is_pattern
            && matches!(unparenthesize(right).kind(), "expression_list" | "tuple" | "list")
            && right_items.len() == targets.len()
        {
            for (t, r) in targets.into_iter().zip(right_items) {
                let v = self.eval(r)?;
                self.bind(t, v)?;
            }
            return Ok(());
        }
        let value = self.eval(right)?;
        self.bind(left, value)
    }

    fn augmented_assign(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        let (Some(left), Some(right), Some(op)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("right"),
            node.child_by_field_name("operator"),
        ) else {
            return Ok(());
        };
        let name = self.text(left).to_string();
        let op = self.text(op).trim_end_matches('=').to_string();
        let rhs = self.eval(right)?;
        let folded = match (self.env.get(&name), &rhs) {
            (Some(Value::Literal(a)), Value::Literal(b)) => fold_binary(&op, a, b).map(Value::Literal),
            _ => None,
        };
        self.env.insert(name.clone(), folded.unwrap_or(Value::Dynamic(name)));
        Ok(())
    }

    fn for_loop(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        let (Some(left), Some(right), Some(body)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("right"),
            node.child_by_field_name("body"),
        ) else {
            return Ok(());
        };
        let iter = self.eval(right)?;

        // (target, collection it iterates) pairs; targets without a
        // collection are bound to dynamic values.
        let mut pairs: Vec<(Node<'_>, Option<Value>)> = Vec::new();
        match iter {
            Value::Enumerate(inner) => match named_children(left).as_slice() {
                [index, element] => {
                    pairs.push((*index, None));
                    pairs.push((*element, Some(*inner)));
                }
                _ => pairs.push((left, Some(*inner))),
            },
            Value::Zip(values) => {
                let targets = named_children(left);
                if targets.len() == values.len() {
                    pairs.extend(targets.into_iter().zip(values.into_iter().map(Some)));
                } else {
                    pairs.push((left, None));
                }
            }
            other => pairs.push((left, Some(other))),
        }
        // zip stops at the shortest input.
        let static_count = pairs
            .iter()
            .filter_map(|(_, v)| v.as_ref().and_then(literal_count))
            .min();
        let collection = pairs.iter().find_map(|(_, v)| match v {
            Some(Value::Resource(r)) => Some(*r),
            _ => None,
        });

        let resources_before = self.graph.resources().len();
        let mut elements = Vec::new();
        for (target, value) in &pairs {
            match value {
                Some(Value::Resource(coll)) => {
                    let name = self.text(*target).to_string();
                    let declared = self
                        .element_shape(*coll)
                        .map(DeclaredType::from_shape)
                        .unwrap_or_else(DeclaredType::unknown);
                    let chain = self.chain(&declared);
                    let elem = self.graph.add_resource(
                        name.clone(),
                        declared,
                        chain,
                        ResourceOrigin::LoopElement { collection: *coll },
                    )?;
                    elements.push(elem);
                    self.env.insert(name, Value::Resource(elem));
                }
                _ => {
                    let dynamic = Value::Dynamic(self.text(*target).to_string());
                    self.bind(*target, dynamic)?;
                }
            }
        }

        let mut draft = OperationDraft::structural(
            "for",
            NodeKind::foreach(collection, elements.first().copied(), static_count),
            position(node),
        )
        .within(self.container);
        if let Some(c) = collection {
            draft = draft.with_bindings(vec![ArgumentBinding::positional(0, BindingValue::Resource(c))]);
        }
        let op = self.graph.add_operation(draft)?;
        self.loop_body(op, body, resources_before, &elements)
    }

    fn while_loop(&mut self, node: Node<'_>) -> Result<(), ExtractError> {
        let (Some(cond), Some(body)) = (node.child_by_field_name("condition"), node.child_by_field_name("body")) else {
            return Ok(());
        };
        if let Value::Literal(l) = self.eval(cond)? {
            if !l.truthy() {
                return Ok(());
            }
        }
        let resources_before = self.graph.resources().len();
        let draft = OperationDraft::structural("while", NodeKind::foreach(None, None, None), position(node))
            .within(self.container);
        let op = self.graph.add_operation(draft)?;
        self.loop_body(op, body, resources_before, &[])
    }

    /// Walks a loop body and records which resources it scopes: those
    /// created inside the body that depend on a loop element or on a value
    /// produced inside the body.
    fn loop_body(
        &mut self,
        op: OperationId,
        body: Node<'_>,
        resources_before: usize,
        elements: &[ResourceId],
    ) -> Result<(), ExtractError> {
        let saved = self.container.replace((op, Arm::Body));
        self.block(body)?;
        self.container = saved;

        let mut scoped = Vec::new();
        for node in &self.graph.resources()[resources_before..] {
            let lineage = self.graph.lineage(node.id);
            let per_iteration = lineage.iter().any(|r| {
                elements.contains(r)
                    || matches!(
                        self.graph.resource(*r).map(|n| &n.origin),
                        Some(ResourceOrigin::Produced { by }) if *by > op
                    )
            });
            if per_iteration {
                scoped.push(node.id);
            }
        }
        self.graph.set_loop_scope(op, scoped)?;
        Ok(())
    }

    fn branch(
        &mut self,
        cond: Node<'_>,
        consequence: Node<'_>,
        rest: &[Node<'_>],
        pos: SourcePosition,
    ) -> Result<(), ExtractError> {
        if let Value::Literal(l) = self.eval(cond)? {
            return if l.truthy() { self.block(consequence) } else { self.alternatives(rest) };
        }

        let condition = self.text(cond).to_string();
        let draft = OperationDraft::structural("if", NodeKind::conditional(condition), pos).within(self.container);
        let op = self.graph.add_operation(draft)?;
        let saved = self.container;
        let before = self.env.clone();

        self.container = Some((op, Arm::Then));
        self.block(consequence)?;
        let after_then = std::mem::replace(&mut self.env, before);

        self.container = Some((op, Arm::Else));
        self.alternatives(rest)?;
        self.container = saved;

        // Bindings that differ between the arms are only known at runtime.
        let names: BTreeSet<String> = after_then.keys().chain(self.env.keys()).cloned().collect();
        for name in names {
            if after_then.get(&name) != self.env.get(&name) {
                self.env.insert(name.clone(), Value::Dynamic(name));
            }
        }
        Ok(())
    }

    fn alternatives(&mut self, rest: &[Node<'_>]) -> Result<(), ExtractError> {
        let Some(alt) = rest.first() else {
            return Ok(());
        };
        match alt.kind() {
            "elif_clause" => {
                if let (Some(cond), Some(body)) =
                    (alt.child_by_field_name("condition"), alt.child_by_field_name("consequence"))
                {
                    self.branch(cond, body, &rest[1..], position(*alt))?;
                }
                Ok(())
            }
            "else_clause" => match alt.child_by_field_name("body") {
                Some(body) => self.block(body),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

/// Iteration count of a range or literal list.
fn literal_count(value: &Value) -> Option<u64> {
    match value {
        Value::Range(count) => *count,
        Value::Literal(Literal::List(items)) => Some(items.len() as u64),
        _ => None,
    }
}

/// Iteration count of `range(..)` with literal bounds.
pub fn range_count(bounds: &[Option<i64>]) -> Option<u64> {
    let (start, stop, step) = match bounds {
        [Some(stop)] => (0, *stop, 1),
        [Some(start), Some(stop)] => (*start, *stop, 1),
        [Some(start), Some(stop), Some(step)] if *step != 0 => (*start, *stop, *step),
        _ => return None,
    };
    let span = if step > 0 { stop - start } else { start - stop };
    let step = step.abs();
    if span <= 0 {
        return Some(0);
    }
    u64::try_from((span + step - 1) / step).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use labtrace_core::{EdgeKind, ResourceKind};
    use proptest::prelude::*;

    fn extract(src: &str) -> Extraction {
        let module = ParsedModule::parse(src).unwrap();
        extract_procedure(&module, "protocol", &HierarchyRegistry::standard(), DeckTopology::SlotBased).unwrap()
    }

    const LINEAR: &str = r#"
async def protocol(lh: LiquidHandler, tips: TipRack, source: Plate, dest: Plate):
    await lh.pick_up_tips(tips["A1"])
    await lh.aspirate(source["A1"], vols=[50])
    await lh.dispense(dest["A1"], vols=[50])
    await lh.drop_tips(tips["A1"])
"#;

    #[test]
    fn linear_procedure_records_calls_in_order() {
        let ex = extract(LINEAR);
        assert!(ex.is_resolved());
        let names: Vec<_> = ex.graph.operations().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["pick_up_tips", "aspirate", "dispense", "drop_tips"]);
        assert!(ex.graph.operations().iter().all(|o| o.kind == NodeKind::Static));

        let aspirate = &ex.graph.operations()[1];
        let vols = aspirate.argument("vols", 1).unwrap();
        assert!(vols.can_precompute);
        assert_eq!(vols.value, BindingValue::Literal(Literal::List(vec![Literal::Int(50)])));

        let src_well = aspirate.resource_arguments().next().unwrap();
        let node = ex.graph.resource(src_well).unwrap();
        assert_eq!(node.name, "source[\"A1\"]");
        assert_eq!(node.element_kind(), Some(ResourceKind::Well));
        assert_eq!(
            node.chain.as_slice(),
            &[ResourceKind::Plate, ResourceKind::DeckSlot, ResourceKind::Deck]
        );
    }

    #[test]
    fn repeated_access_reuses_derived_node() {
        let ex = extract(LINEAR);
        let first = ex.graph.operations()[0].resource_arguments().next();
        let last = ex.graph.operations()[3].resource_arguments().next();
        assert_eq!(first, last);
        let tips = ex.graph.parameter("tips").unwrap();
        assert!(ex.graph.edges().iter().any(|e| e.kind == EdgeKind::ResourceOrder { resource: tips }
            && e.from == OperationId(0)
            && e.to == OperationId(3)));
    }

    #[test]
    fn loop_over_plate_is_foreach_with_element() {
        let ex = extract(
            r#"
async def protocol(lh: LiquidHandler, plate: Plate):
    for well in plate.children:
        await lh.dispense(well, vols=[10])
"#,
        );
        let foreach = &ex.graph.operations()[0];
        let NodeKind::Foreach { collection, element, children, scoped, static_count } = &foreach.kind else {
            panic!("expected foreach, got {:?}", foreach.kind);
        };
        assert_eq!(*static_count, None);
        assert_eq!(children, &vec![OperationId(1)]);
        let coll = ex.graph.resource(collection.unwrap()).unwrap();
        assert_eq!(coll.name, "plate.children");
        let elem = element.unwrap();
        assert_eq!(ex.graph.resource(elem).unwrap().kind(), Some(ResourceKind::Well));
        assert!(scoped.contains(&elem));
        assert_eq!(ex.graph.operations()[1].parent, Some(foreach.id));
    }

    #[test]
    fn range_loop_has_static_count() {
        let ex = extract(
            r#"
async def protocol(lh: LiquidHandler, plate: Plate):
    for i in range(2, 14, 4):
        await lh.dispense(plate[i], vols=[10])
"#,
        );
        match &ex.graph.operations()[0].kind {
            NodeKind::Foreach { static_count, collection, .. } => {
                assert_eq!(*static_count, Some(3));
                assert_eq!(*collection, None);
            }
            other => panic!("expected foreach, got {other:?}"),
        }
        // `plate[i]` has a runtime key.
        let well = ex.graph.operations()[1].resource_arguments().next().unwrap();
        assert_eq!(ex.graph.resource(well).unwrap().name, "plate[i]");
    }

    #[test]
    fn undecidable_condition_keeps_both_arms() {
        let ex = extract(
            r#"
async def protocol(lh: LiquidHandler, plate: Plate, fast: bool):
    if fast:
        await lh.aspirate(plate["A1"], vols=[10])
    elif 1 > 2:
        await lh.aspirate(plate["B1"], vols=[10])
    else:
        await lh.dispense(plate["C1"], vols=[10])
"#,
        );
        let NodeKind::Conditional { condition, then_branch, else_branch } = &ex.graph.operations()[0].kind else {
            panic!("expected conditional");
        };
        assert_eq!(condition, "fast");
        assert_eq!(then_branch.len(), 1);
        // The literal `elif` is folded away; only the else arm remains.
        assert_eq!(else_branch.len(), 1);
        assert_eq!(ex.graph.operation(else_branch[0]).unwrap().name, "dispense");
    }

    #[test]
    fn literal_condition_is_folded() {
        let ex = extract(
            r#"
DEBUG = False

async def protocol(lh: LiquidHandler, plate: Plate):
    n = 3
    if n * 2 == 6:
        await lh.aspirate(plate["A1"], vols=[10])
    else:
        await lh.dispense(plate["A1"], vols=[10])
"#,
        );
        let names: Vec<_> = ex.graph.operations().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["aspirate"]);
    }

    #[test]
    fn helper_call_is_unresolved() {
        let ex = extract(
            r#"
async def fill(lh, well):
    await lh.dispense(well, vols=[10])

async def protocol(lh: LiquidHandler, plate: Plate):
    await fill(lh, plate["A1"])
"#,
        );
        assert!(!ex.is_resolved());
        assert_eq!(ex.unresolved[0].reason, UnresolvedReason::HelperCall { name: "fill".into() });
        assert!(ex.graph.operations().is_empty());
    }

    #[test]
    fn builtins_do_not_unresolve() {
        let ex = extract(
            r#"
async def protocol(lh: LiquidHandler, plate: Plate):
    print("start", len([1, 2]))
    await lh.setup()
"#,
        );
        assert!(ex.is_resolved());
        assert_eq!(ex.graph.operations().len(), 1);
    }

    #[test]
    fn produced_value_creates_data_dependency() {
        let ex = extract(
            r#"
async def protocol(lh: LiquidHandler, reader: PlateReader, plate: Plate):
    data = await reader.read_absorbance(wavelength=450)
    await lh.dispense(plate["A1"], vols=data)
"#,
        );
        let read = OperationId(0);
        let dispense = OperationId(1);
        let produced = ex.graph.operation(read).unwrap().produces.unwrap();
        assert!(ex.graph.edges().iter().any(|e| e.from == read
            && e.to == dispense
            && e.kind == EdgeKind::DataDependency { resource: produced }));
    }

    #[test]
    fn dynamic_arguments_tag_node() {
        let ex = extract(
            r#"
async def protocol(lh: LiquidHandler, plate: Plate, volume: float):
    await lh.aspirate(plate["A1"], vols=[volume])
"#,
        );
        assert_eq!(ex.graph.operations()[0].kind, NodeKind::Dynamic);
    }

    #[test]
    fn missing_procedure_is_an_error() {
        let module = ParsedModule::parse("def other():\n    pass\n").unwrap();
        let err = extract_procedure(&module, "protocol", &HierarchyRegistry::standard(), DeckTopology::SlotBased)
            .unwrap_err();
        assert!(matches!(err, ExtractError::ProcedureNotFound { .. }));
    }

    #[test]
    fn range_counts() {
        assert_eq!(range_count(&[Some(12)]), Some(12));
        assert_eq!(range_count(&[Some(2), Some(14), Some(4)]), Some(3));
        assert_eq!(range_count(&[Some(10), Some(0), Some(-3)]), Some(4));
        assert_eq!(range_count(&[Some(5), Some(1)]), Some(0));
        assert_eq!(range_count(&[None]), None);
    }

    proptest! {
        #[test]
        fn range_count_matches_iteration(start in -60i64..60, stop in -60i64..60, step in -9i64..9) {
            prop_assume!(step != 0);
            let iterated = if step > 0 {
                (start..stop).step_by(step as usize).count()
            } else {
                (stop + 1..=start).rev().step_by(step.unsigned_abs() as usize).count()
            };
            prop_assert_eq!(range_count(&[Some(start), Some(stop), Some(step)]), Some(iterated as u64));
        }
    }
}
