//! The tracing interpreter.
//!
//! Runs a procedure body over stand-in values instead of walking it
//! statically. Helper functions are expanded at their call site with
//! their parameters bound to the caller's stand-ins, so hardware calls
//! made inside helpers land in the graph where they happen. Conditions on
//! runtime values trace both arms up to a nesting limit.

use std::collections::{BTreeSet, HashMap};
use std::mem;

use labtrace_core::{AccessKey, DeclaredType, Literal, OperationId, ResourceId, ResourceOrigin, SourcePosition};
use labtrace_extract::extractor::range_count;
use labtrace_extract::syntax::{
    comparison_operators, field_children, fold_binary, literal, named_children, position, text, unparenthesize,
};
use labtrace_extract::{signature_of, FunctionDef, ParamKind, ParsedModule, ProcedureSignature, INERT_BUILTINS};
use tracing::{debug, warn};
use tree_sitter::Node;

use super::recorder::Recorder;
use super::value::{Interact, Iteration, Proxy, TracedArg, Truth};
use crate::config::TracerLimits;
use crate::error::TraceError;

/// How a statement ends.
enum Flow {
    Next,
    Return(Proxy),
}

pub(crate) struct TraceInterpreter<'m, 'h> {
    module: &'m ParsedModule,
    source: &'m str,
    limits: TracerLimits,
    recorder: Recorder<'h>,
    /// Module-level names: imports, classes and constants.
    globals: HashMap<String, Proxy>,
    /// Module-level functions and nested definitions seen so far.
    functions: HashMap<String, FunctionDef<'m>>,
    env: HashMap<String, Proxy>,
    call_depth: usize,
    branch_depth: usize,
}

impl<'m, 'h> TraceInterpreter<'m, 'h> {
    pub(crate) fn new(module: &'m ParsedModule, recorder: Recorder<'h>, limits: TracerLimits) -> Self {
        let mut interp = TraceInterpreter {
            module,
            source: module.source(),
            limits,
            recorder,
            globals: HashMap::new(),
            functions: module.functions().into_iter().collect(),
            env: HashMap::new(),
            call_depth: 0,
            branch_depth: 0,
        };
        interp.scan_globals();
        interp
    }

    pub(crate) fn bind_parameters(&mut self, signature: &ProcedureSignature) {
        for (index, param) in signature.parameters.iter().enumerate() {
            let value = if param.declared.is_resource() {
                let id = self.recorder.add_resource(
                    param.name.clone(),
                    param.declared.clone(),
                    ResourceOrigin::Parameter { index },
                );
                self.recorder.proxy(id)
            } else {
                Proxy::Scalar(param.name.clone())
            };
            self.env.insert(param.name.clone(), value);
        }
    }

    pub(crate) fn run(&mut self, body: Node<'m>) {
        self.block(body);
    }

    pub(crate) fn finish(self) -> Recorder<'h> {
        self.recorder
    }

    fn text(&self, node: Node<'_>) -> &'m str {
        text(node, self.source)
    }

    fn scan_globals(&mut self) {
        for stmt in named_children(self.module.root()) {
            match stmt.kind() {
                "import_statement" | "import_from_statement" => {
                    for name in field_children(stmt, "name") {
                        let bound = match name.kind() {
                            "aliased_import" => name.child_by_field_name("alias").map(|a| self.text(a)),
                            _ if stmt.kind() == "import_statement" => self.text(name).split('.').next(),
                            _ => self.text(name).rsplit('.').next(),
                        };
                        if let Some(bound) = bound {
                            self.globals
                                .insert(bound.to_string(), Proxy::Opaque { expr: bound.to_string(), produced_by: None });
                        }
                    }
                }
                "class_definition" | "decorated_definition" => {
                    let class = if stmt.kind() == "class_definition" {
                        Some(stmt)
                    } else {
                        stmt.child_by_field_name("definition").filter(|d| d.kind() == "class_definition")
                    };
                    if let Some(name) = class.and_then(|c| c.child_by_field_name("name")) {
                        let name = self.text(name);
                        self.globals.insert(name.to_string(), Proxy::Opaque { expr: name.to_string(), produced_by: None });
                    }
                }
                "expression_statement" => {
                    for child in named_children(stmt) {
                        let (Some(left), Some(right)) =
                            (child.child_by_field_name("left"), child.child_by_field_name("right"))
                        else {
                            continue;
                        };
                        if child.kind() != "assignment" || left.kind() != "identifier" {
                            continue;
                        }
                        let name = self.text(left).to_string();
                        let value = match literal(right, self.source) {
                            Some(lit) => Proxy::Literal(lit),
                            None => Proxy::Scalar(name.clone()),
                        };
                        self.globals.insert(name, value);
                    }
                }
                _ => {}
            }
        }
    }

    // ---- expressions ----

    fn lookup(&self, name: &str, at: SourcePosition) -> Result<Proxy, TraceError> {
        if let Some(value) = self.env.get(name).or_else(|| self.globals.get(name)) {
            return Ok(value.clone());
        }
        if self.functions.contains_key(name) {
            return Ok(Proxy::Opaque { expr: name.to_string(), produced_by: None });
        }
        Err(TraceError::Undefined { name: name.to_string(), position: at })
    }

    fn eval(&mut self, node: Node<'m>) -> Result<Proxy, TraceError> {
        let node = unparenthesize(node);
        if let Some(lit) = literal(node, self.source) {
            return Ok(Proxy::Literal(lit));
        }
        let src = self.text(node);
        let at = position(node);
        match node.kind() {
            "identifier" => self.lookup(src, at),
            "await" => match node.named_child(0) {
                Some(inner) => self.eval(inner),
                None => Ok(Proxy::Scalar(src.to_string())),
            },
            "attribute" => {
                let (Some(object), Some(attr)) =
                    (node.child_by_field_name("object"), node.child_by_field_name("attribute"))
                else {
                    return Ok(Proxy::Scalar(src.to_string()));
                };
                let attr = self.text(attr);
                let object = self.eval(object)?;
                object.attribute(&mut self.recorder, attr, src)
            }
            "subscript" => {
                let keys = field_children(node, "subscript");
                let (Some(value), [key]) = (node.child_by_field_name("value"), keys.as_slice()) else {
                    return Ok(Proxy::Scalar(src.to_string()));
                };
                let value = self.eval(value)?;
                let key = self.subscript_key(*key)?;
                value.subscript(&mut self.recorder, key, src, at)
            }
            "call" => self.call(node),
            "list" | "tuple" | "expression_list" => {
                let mut items = Vec::new();
                for child in named_children(node) {
                    items.push(self.eval(child)?);
                }
                let members: Vec<ResourceId> = items.iter().filter_map(Proxy::resource).collect();
                if !members.is_empty() && members.len() == items.len() {
                    let id = self.recorder.group(members, src);
                    return Ok(self.recorder.proxy(id));
                }
                let literals: Vec<Literal> = items
                    .iter()
                    .filter_map(|i| match i {
                        Proxy::Literal(l) => Some(l.clone()),
                        _ => None,
                    })
                    .collect();
                if literals.len() == items.len() {
                    return Ok(Proxy::Literal(Literal::List(literals)));
                }
                Ok(Proxy::Scalar(src.to_string()))
            }
            "comparison_operator" => {
                let ops = comparison_operators(node, self.source);
                let mut values = Vec::new();
                for operand in named_children(node) {
                    values.push(self.eval(operand)?);
                }
                let mut result = true;
                for (i, op) in ops.iter().enumerate() {
                    let (Some(a), Some(b)) = (values.get(i), values.get(i + 1)) else {
                        return Ok(Proxy::Flag(src.to_string()));
                    };
                    match a.compare(op, b, src) {
                        Proxy::Literal(Literal::Bool(r)) => result &= r,
                        flag => return Ok(flag),
                    }
                }
                Ok(Proxy::Literal(Literal::Bool(result)))
            }
            "boolean_operator" => {
                let (Some(l), Some(r), Some(op)) = (
                    node.child_by_field_name("left"),
                    node.child_by_field_name("right"),
                    node.child_by_field_name("operator"),
                ) else {
                    return Ok(Proxy::Scalar(src.to_string()));
                };
                let is_and = self.text(op) == "and";
                let left = self.eval(l)?;
                let right = self.eval(r)?;
                match left.truthiness() {
                    Truth::Known(t) if t != is_and => Ok(left),
                    Truth::Known(_) => Ok(right),
                    Truth::Unknown => Ok(Proxy::Flag(src.to_string())),
                }
            }
            "not_operator" => match node.child_by_field_name("argument") {
                Some(arg) => match self.eval(arg)?.truthiness() {
                    Truth::Known(t) => Ok(Proxy::Literal(Literal::Bool(!t))),
                    Truth::Unknown => Ok(Proxy::Flag(src.to_string())),
                },
                None => Ok(Proxy::Scalar(src.to_string())),
            },
            "binary_operator" => {
                let (Some(l), Some(r), Some(op)) = (
                    node.child_by_field_name("left"),
                    node.child_by_field_name("right"),
                    node.child_by_field_name("operator"),
                ) else {
                    return Ok(Proxy::Scalar(src.to_string()));
                };
                let op = self.text(op);
                match (self.eval(l)?, self.eval(r)?) {
                    (Proxy::Literal(a), Proxy::Literal(b)) => Ok(fold_binary(op, &a, &b)
                        .map(Proxy::Literal)
                        .unwrap_or_else(|| Proxy::Scalar(src.to_string()))),
                    _ => Ok(Proxy::Scalar(src.to_string())),
                }
            }
            "conditional_expression" => match named_children(node).as_slice() {
                [body, condition, alternative] => match self.eval(*condition)?.truthiness() {
                    Truth::Known(true) => self.eval(*body),
                    Truth::Known(false) => self.eval(*alternative),
                    Truth::Unknown => Ok(Proxy::Scalar(src.to_string())),
                },
                _ => Ok(Proxy::Scalar(src.to_string())),
            },
            "list_comprehension" | "generator_expression" => self.comprehension(node),
            _ => Ok(Proxy::Scalar(src.to_string())),
        }
    }

    /// `[w for w in wells]` is `wells`; anything else is a runtime value.
    fn comprehension(&mut self, node: Node<'m>) -> Result<Proxy, TraceError> {
        let src = self.text(node);
        let body = node.child_by_field_name("body");
        let clauses: Vec<_> = named_children(node).into_iter().filter(|c| c.kind() == "for_in_clause").collect();
        if let (Some(body), [clause]) = (body, clauses.as_slice()) {
            if let (Some(left), Some(right)) = (clause.child_by_field_name("left"), clause.child_by_field_name("right")) {
                if body.kind() == "identifier" && self.text(body) == self.text(left) {
                    let value = self.eval(right)?;
                    if value.resource().is_some() {
                        return Ok(value);
                    }
                }
            }
        }
        Ok(Proxy::Scalar(src.to_string()))
    }

    fn subscript_key(&mut self, key: Node<'m>) -> Result<AccessKey, TraceError> {
        if key.kind() == "slice" {
            let bounds: Vec<Option<i64>> = named_children(key)
                .into_iter()
                .map(|c| literal(c, self.source).and_then(|l| l.as_int()))
                .collect();
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
            Proxy::Literal(Literal::Str(s)) => AccessKey::Label(s),
            Proxy::Literal(Literal::Int(i)) => AccessKey::Index(i),
            _ => AccessKey::Dynamic(self.text(key).to_string()),
        })
    }

    fn call(&mut self, node: Node<'m>) -> Result<Proxy, TraceError> {
        let src = self.text(node);
        let at = position(node);
        let Some(func) = node.child_by_field_name("function") else {
            return Ok(Proxy::Scalar(src.to_string()));
        };
        let args = node.child_by_field_name("arguments");
        match func.kind() {
            "attribute" => {
                let (Some(object), Some(method)) =
                    (func.child_by_field_name("object"), func.child_by_field_name("attribute"))
                else {
                    return Ok(Proxy::Scalar(src.to_string()));
                };
                let method = self.text(method);
                let receiver = self.eval(object)?;
                let traced = match receiver {
                    Proxy::Machine(_) => self.arguments(args)?,
                    // Accessor arguments only name the member.
                    Proxy::Resource(_) | Proxy::Collection(_) | Proxy::Element { .. } => self.argument_texts(args),
                    _ => {
                        self.arguments(args)?;
                        Vec::new()
                    }
                };
                receiver.invoke(&mut self.recorder, method, traced, src, at)
            }
            "identifier" => {
                let name = self.text(func);
                self.call_function(name, args, src, at)
            }
            _ => {
                self.arguments(args)?;
                Ok(Proxy::Scalar(src.to_string()))
            }
        }
    }

    fn call_function(
        &mut self,
        name: &str,
        args: Option<Node<'m>>,
        src: &str,
        at: SourcePosition,
    ) -> Result<Proxy, TraceError> {
        let arg_nodes: Vec<Node<'m>> = args.map(named_children).unwrap_or_default();
        match name {
            "range" => {
                let mut bounds = Vec::new();
                for a in &arg_nodes {
                    bounds.push(match self.eval(*a)? {
                        Proxy::Literal(Literal::Int(i)) => Some(i),
                        _ => None,
                    });
                }
                Ok(Proxy::Range(range_count(&bounds)))
            }
            "enumerate" => match arg_nodes.first() {
                Some(a) => Ok(Proxy::Enumerate(Box::new(self.eval(*a)?))),
                None => Ok(Proxy::Scalar(src.to_string())),
            },
            "zip" => {
                let mut values = Vec::new();
                for a in &arg_nodes {
                    values.push(self.eval(*a)?);
                }
                Ok(Proxy::Zip(values))
            }
            "list" | "tuple" | "sorted" | "reversed" | "iter" => match arg_nodes.first() {
                Some(a) => self.eval(*a),
                None => Ok(Proxy::Literal(Literal::List(Vec::new()))),
            },
            "len" => match arg_nodes.first() {
                Some(a) => Ok(match self.eval(*a)? {
                    Proxy::Literal(Literal::List(items)) => Proxy::Literal(Literal::Int(items.len() as i64)),
                    Proxy::Literal(Literal::Str(s)) => Proxy::Literal(Literal::Int(s.chars().count() as i64)),
                    Proxy::Range(Some(n)) => Proxy::Literal(Literal::Int(n as i64)),
                    _ => Proxy::Scalar(src.to_string()),
                }),
                None => Ok(Proxy::Scalar(src.to_string())),
            },
            n if INERT_BUILTINS.contains(&n) => {
                self.arguments(args)?;
                Ok(Proxy::Scalar(src.to_string()))
            }
            n => {
                if let Some(def) = self.functions.get(n).copied() {
                    let traced = self.arguments(args)?;
                    return self.expand(n, def, traced, src, at);
                }
                if let Some(Proxy::Opaque { .. }) = self.globals.get(n) {
                    self.arguments(args)?;
                    return Ok(Proxy::Opaque { expr: src.to_string(), produced_by: None });
                }
                Err(TraceError::UnknownFunction { name: n.to_string(), position: at })
            }
        }
    }

    fn arguments(&mut self, args: Option<Node<'m>>) -> Result<Vec<TracedArg>, TraceError> {
        let mut out = Vec::new();
        for arg in args.map(named_children).unwrap_or_default() {
            match arg.kind() {
                "keyword_argument" => {
                    let (Some(name), Some(value)) = (arg.child_by_field_name("name"), arg.child_by_field_name("value"))
                    else {
                        continue;
                    };
                    out.push(TracedArg {
                        name: Some(self.text(name).to_string()),
                        value: self.eval(value)?,
                        expr: self.text(value).to_string(),
                        splat: false,
                    });
                }
                "list_splat" | "dictionary_splat" => {
                    let expr = self.text(arg).to_string();
                    out.push(TracedArg { name: None, value: Proxy::Scalar(expr.clone()), expr, splat: true });
                }
                "comment" => {}
                _ => out.push(TracedArg {
                    name: None,
                    value: self.eval(arg)?,
                    expr: self.text(arg).to_string(),
                    splat: false,
                }),
            }
        }
        Ok(out)
    }

    fn argument_texts(&self, args: Option<Node<'m>>) -> Vec<TracedArg> {
        args.map(named_children)
            .unwrap_or_default()
            .into_iter()
            .map(|a| {
                let expr = self.text(a).to_string();
                TracedArg { name: None, value: Proxy::Scalar(expr.clone()), expr, splat: false }
            })
            .collect()
    }

    // ---- helpers ----

    fn expand(
        &mut self,
        name: &str,
        def: FunctionDef<'m>,
        args: Vec<TracedArg>,
        src: &str,
        at: SourcePosition,
    ) -> Result<Proxy, TraceError> {
        if self.call_depth >= self.limits.max_call_depth {
            let reason = format!("helper `{name}` nested deeper than {} calls", self.limits.max_call_depth);
            self.recorder.unanalyzed(reason, at);
            return Ok(Proxy::Opaque { expr: src.to_string(), produced_by: None });
        }
        let signature = signature_of(name, &def, self.source);
        let frame = self.bind_arguments(&signature, &def, args, at)?;
        debug!(helper = name, depth = self.call_depth + 1, "expanding helper");

        let saved = mem::replace(&mut self.env, frame);
        self.call_depth += 1;
        let flow = self.block(def.body);
        self.call_depth -= 1;
        self.env = saved;
        Ok(match flow {
            Flow::Return(value) => value,
            Flow::Next => Proxy::Literal(Literal::None),
        })
    }

    /// Binds call arguments to a helper's parameters the way Python does.
    fn bind_arguments(
        &mut self,
        signature: &ProcedureSignature,
        def: &FunctionDef<'m>,
        args: Vec<TracedArg>,
        at: SourcePosition,
    ) -> Result<HashMap<String, Proxy>, TraceError> {
        let name = &signature.name;
        let splat = args.iter().any(|a| a.splat);
        let (keyword, positional): (Vec<TracedArg>, Vec<TracedArg>) =
            args.into_iter().filter(|a| !a.splat).partition(|a| a.name.is_some());
        let given = keyword.len() + positional.len();
        let params: Vec<_> = signature.positional().collect();
        let var_positional = signature.parameters.iter().find(|p| p.kind == ParamKind::VarPositional);
        let var_keyword = signature.parameters.iter().find(|p| p.kind == ParamKind::VarKeyword);

        if positional.len() > params.len() && var_positional.is_none() {
            return Err(TraceError::Arity {
                name: name.clone(),
                given: positional.len(),
                expected: params.len(),
                position: at,
            });
        }

        let mut frame = HashMap::new();
        for (param, arg) in params.iter().zip(positional) {
            frame.insert(param.name.clone(), arg.value);
        }
        for arg in keyword {
            let Some(key) = arg.name else {
                continue;
            };
            match signature.parameter(&key) {
                Some(p) if matches!(p.kind, ParamKind::Positional | ParamKind::KeywordOnly) => {
                    frame.insert(key, arg.value);
                }
                _ if var_keyword.is_some() => {}
                _ => {
                    return Err(TraceError::UnexpectedKeyword { name: name.clone(), keyword: key, position: at });
                }
            }
        }

        let required = signature
            .parameters
            .iter()
            .filter(|p| matches!(p.kind, ParamKind::Positional | ParamKind::KeywordOnly) && p.default.is_none())
            .count();
        for param in &signature.parameters {
            if frame.contains_key(&param.name) {
                continue;
            }
            let value = match param.kind {
                ParamKind::VarPositional | ParamKind::VarKeyword => Proxy::Scalar(param.name.clone()),
                _ => match self.default_node(def, &param.name) {
                    Some(node) => self.eval(node)?,
                    None if splat => Proxy::Scalar(param.name.clone()),
                    None => {
                        return Err(TraceError::Arity { name: name.clone(), given, expected: required, position: at })
                    }
                },
            };
            frame.insert(param.name.clone(), value);
        }
        Ok(frame)
    }

    fn default_node(&self, def: &FunctionDef<'m>, param: &str) -> Option<Node<'m>> {
        let params = def.node.child_by_field_name("parameters")?;
        named_children(params)
            .into_iter()
            .filter(|p| matches!(p.kind(), "default_parameter" | "typed_default_parameter"))
            .find(|p| p.child_by_field_name("name").is_some_and(|n| self.text(n) == param))
            .and_then(|p| p.child_by_field_name("value"))
    }

    // ---- statements ----

    /// Runs a block. A statement that cannot be modeled is logged, recorded
    /// as skipped, and the block carries on.
    fn block(&mut self, node: Node<'m>) -> Flow {
        for stmt in named_children(node) {
            match self.statement(stmt) {
                Ok(Flow::Next) => {}
                Ok(ret) => return ret,
                Err(error) => {
                    warn!(%error, "statement skipped during tracing");
                    self.recorder.skipped(&error);
                }
            }
        }
        Flow::Next
    }

    fn statement(&mut self, node: Node<'m>) -> Result<Flow, TraceError> {
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
                    return self.branch(cond, body, &alternatives, position(node));
                }
            }
            "with_statement" => {
                if let Some(body) = node.child_by_field_name("body") {
                    return Ok(self.block(body));
                }
            }
            "try_statement" => {
                if let Some(body) = node.child_by_field_name("body") {
                    if let Flow::Return(value) = self.block(body) {
                        return Ok(Flow::Return(value));
                    }
                }
                for child in named_children(node) {
                    match child.kind() {
                        "else_clause" | "finally_clause" => {
                            let body = child
                                .child_by_field_name("body")
                                .or_else(|| named_children(child).into_iter().find(|c| c.kind() == "block"));
                            if let Some(body) = body {
                                if let Flow::Return(value) = self.block(body) {
                                    return Ok(Flow::Return(value));
                                }
                            }
                        }
                        "except_clause" | "except_group_clause" => {
                            self.recorder.skip("exception handler not analyzed".to_string(), position(child));
                        }
                        _ => {}
                    }
                }
            }
            "return_statement" => {
                let value = match node.named_child(0) {
                    Some(value) => self.eval(value)?,
                    None => Proxy::Literal(Literal::None),
                };
                return Ok(Flow::Return(value));
            }
            "function_definition" | "decorated_definition" => {
                let def = if node.kind() == "function_definition" {
                    Some(node)
                } else {
                    node.child_by_field_name("definition").filter(|d| d.kind() == "function_definition")
                };
                if let Some((name, def)) = def.and_then(|d| self.module.function_def(d)) {
                    self.functions.insert(name, def);
                }
            }
            "class_definition" | "import_statement" | "import_from_statement" | "future_import_statement"
            | "pass_statement" | "break_statement" | "continue_statement" | "global_statement"
            | "nonlocal_statement" | "comment" | "assert_statement" | "delete_statement"
            | "raise_statement" => {}
            other => {
                self.recorder.skip(format!("statement `{other}` not analyzed"), position(node));
            }
        }
        Ok(Flow::Next)
    }

    fn bind(&mut self, target: Node<'m>, value: Proxy) -> Result<(), TraceError> {
        match target.kind() {
            "identifier" => {
                let name = self.text(target);
                let value = match value {
                    Proxy::Opaque { produced_by: Some(op), .. } => {
                        let id = self.recorder.materialize(op, name);
                        self.recorder.proxy(id)
                    }
                    other => other,
                };
                self.env.insert(name.to_string(), value);
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" => {
                let targets = named_children(target);
                let parts: Vec<Proxy> = match value {
                    Proxy::Literal(Literal::List(items)) if items.len() == targets.len() => {
                        items.into_iter().map(Proxy::Literal).collect()
                    }
                    _ => targets.iter().map(|t| Proxy::Scalar(self.text(*t).to_string())).collect(),
                };
                for (t, v) in targets.into_iter().zip(parts) {
                    self.bind(t, v)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn assign(&mut self, node: Node<'m>) -> Result<(), TraceError> {
        let (Some(left), Some(right)) = (node.child_by_field_name("left"), node.child_by_field_name("right")) else {
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

    fn augmented_assign(&mut self, node: Node<'m>) -> Result<(), TraceError> {
        let (Some(left), Some(right), Some(op)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("right"),
            node.child_by_field_name("operator"),
        ) else {
            return Ok(());
        };
        let name = self.text(left).to_string();
        let op = self.text(op).trim_end_matches('=');
        let rhs = self.eval(right)?;
        let folded = match (self.env.get(&name), &rhs) {
            (Some(Proxy::Literal(a)), Proxy::Literal(b)) => fold_binary(op, a, b).map(Proxy::Literal),
            _ => None,
        };
        self.env.insert(name.clone(), folded.unwrap_or(Proxy::Scalar(name)));
        Ok(())
    }

    fn for_loop(&mut self, node: Node<'m>) -> Result<(), TraceError> {
        let (Some(left), Some(right), Some(body)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("right"),
            node.child_by_field_name("body"),
        ) else {
            return Ok(());
        };
        let at = position(node);
        let iter = self.eval(right)?;

        let pairs: Vec<(Node<'m>, Option<Proxy>)> = match iter {
            Proxy::Enumerate(inner) => match named_children(left).as_slice() {
                [index, element] => vec![(*index, None), (*element, Some(*inner))],
                _ => vec![(left, Some(*inner))],
            },
            Proxy::Zip(values) => {
                let targets = named_children(left);
                if targets.len() == values.len() {
                    targets.into_iter().zip(values.into_iter().map(Some)).collect()
                } else {
                    vec![(left, None)]
                }
            }
            other => vec![(left, Some(other))],
        };
        let mut iterations: Vec<(Node<'m>, Option<Iteration>)> = Vec::new();
        for (target, value) in pairs {
            let iteration = match value {
                Some(v) => Some(v.iterate(&self.recorder, at)?),
                None => None,
            };
            iterations.push((target, iteration));
        }
        // zip stops at the shortest input.
        let static_count = iterations.iter().filter_map(|(_, it)| it.as_ref().and_then(|i| i.static_count)).min();
        let collection = iterations.iter().find_map(|(_, it)| it.as_ref().and_then(|i| i.collection));

        let resources_before = self.recorder.resource_count();
        let mut elements = Vec::new();
        for (target, iteration) in iterations {
            match iteration {
                Some(Iteration { collection: Some(coll), element, .. }) => {
                    let name = self.text(target);
                    let declared = element.map(DeclaredType::from_shape).unwrap_or_else(DeclaredType::unknown);
                    let elem = self.recorder.add_resource(name, declared, ResourceOrigin::LoopElement { collection: coll });
                    elements.push(elem);
                    let proxy = self.recorder.proxy(elem);
                    self.env.insert(name.to_string(), proxy);
                }
                _ => {
                    let runtime = Proxy::Scalar(self.text(target).to_string());
                    self.bind(target, runtime)?;
                }
            }
        }

        let (op, saved) = self.recorder.enter_loop("for", collection, elements.first().copied(), static_count, at);
        self.block(body);
        let scoped = self.scoped(op, resources_before, &elements);
        self.recorder.exit_loop(op, scoped, saved);
        Ok(())
    }

    fn while_loop(&mut self, node: Node<'m>) -> Result<(), TraceError> {
        let (Some(cond), Some(body)) = (node.child_by_field_name("condition"), node.child_by_field_name("body")) else {
            return Ok(());
        };
        if self.eval(cond)?.truthiness() == Truth::Known(false) {
            return Ok(());
        }
        let resources_before = self.recorder.resource_count();
        let (op, saved) = self.recorder.enter_loop("while", None, None, None, position(node));
        self.block(body);
        let scoped = self.scoped(op, resources_before, &[]);
        self.recorder.exit_loop(op, scoped, saved);
        Ok(())
    }

    /// Resources created since `before` that change per iteration: those
    /// reached from a loop element or from a value produced inside the body.
    fn scoped(&self, op: OperationId, before: usize, elements: &[ResourceId]) -> Vec<ResourceId> {
        (before..self.recorder.resource_count())
            .map(|i| ResourceId(i as u32))
            .filter(|id| {
                self.recorder.lineage(*id).iter().any(|r| {
                    elements.contains(r)
                        || matches!(
                            self.recorder.resource(*r).map(|n| &n.origin),
                            Some(ResourceOrigin::Produced { by }) if *by > op
                        )
                })
            })
            .collect()
    }

    fn branch(
        &mut self,
        cond: Node<'m>,
        consequence: Node<'m>,
        rest: &[Node<'m>],
        at: SourcePosition,
    ) -> Result<Flow, TraceError> {
        match self.eval(cond)?.truthiness() {
            Truth::Known(true) => return Ok(self.block(consequence)),
            Truth::Known(false) => return self.alternatives(rest),
            Truth::Unknown => {}
        }
        if self.branch_depth >= self.limits.max_branch_depth {
            let reason = format!("branch nesting deeper than {}", self.limits.max_branch_depth);
            self.recorder.unanalyzed(reason, at);
            return Ok(Flow::Next);
        }

        let condition = self.text(cond);
        let (op, saved) = self.recorder.enter_branch(condition, at);
        let before = self.env.clone();
        self.branch_depth += 1;

        // A return in one arm does not end the procedure on the other.
        self.block(consequence);
        let after_then = mem::replace(&mut self.env, before);

        self.recorder.else_branch(op);
        if let Err(error) = self.alternatives(rest) {
            warn!(%error, "statement skipped during tracing");
            self.recorder.skipped(&error);
        }
        self.branch_depth -= 1;
        self.recorder.exit_branch(op, saved);

        // Bindings that differ between the arms are only known at runtime.
        let names: BTreeSet<String> = after_then.keys().chain(self.env.keys()).cloned().collect();
        for name in names {
            if after_then.get(&name) != self.env.get(&name) {
                self.env.insert(name.clone(), Proxy::Scalar(name));
            }
        }
        Ok(Flow::Next)
    }

    fn alternatives(&mut self, rest: &[Node<'m>]) -> Result<Flow, TraceError> {
        let Some(alt) = rest.first() else {
            return Ok(Flow::Next);
        };
        match alt.kind() {
            "elif_clause" => match (alt.child_by_field_name("condition"), alt.child_by_field_name("consequence")) {
                (Some(cond), Some(body)) => self.branch(cond, body, &rest[1..], position(*alt)),
                _ => Ok(Flow::Next),
            },
            "else_clause" => Ok(alt.child_by_field_name("body").map(|b| self.block(b)).unwrap_or(Flow::Next)),
            _ => Ok(Flow::Next),
        }
    }
}
