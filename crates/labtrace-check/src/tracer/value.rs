//! Stand-in values and the interactions they support.

use labtrace_core::{
    Access, AccessKey, ArgumentBinding, Literal, OperationId, ResourceId, Shape, SourcePosition,
};
use labtrace_extract::syntax::fold_compare;

use super::recorder::Recorder;
use crate::error::TraceError;

/// A stand-in for a value the traced procedure handles.
#[derive(Debug, Clone, PartialEq)]
pub enum Proxy {
    /// A single labware resource.
    Resource(ResourceId),
    /// A resource declared as a collection.
    Collection(ResourceId),
    /// The representative element of a loop over `collection`.
    Element { id: ResourceId, collection: ResourceId },
    /// A machine or deck; method calls on it are recorded.
    Machine(ResourceId),
    /// A runtime-only value; holds its source text.
    Scalar(String),
    /// The outcome of a comparison between runtime values.
    Flag(String),
    Literal(Literal),
    /// Something the tracer cannot look into. Hardware call results carry
    /// the call that produced them and become resources when used.
    Opaque { expr: String, produced_by: Option<OperationId> },
    /// `range(..)` with its count when literal.
    Range(Option<u64>),
    Enumerate(Box<Proxy>),
    Zip(Vec<Proxy>),
}

/// Truth value of a stand-in when branched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    Known(bool),
    /// Decided at runtime; both arms are traced.
    Unknown,
}

/// What iterating a stand-in yields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Iteration {
    /// The resource iterated, when it is one.
    pub collection: Option<ResourceId>,
    /// Type of the representative element.
    pub element: Option<Shape>,
    /// Count known from the source alone.
    pub static_count: Option<u64>,
}

/// One argument passed to a call.
#[derive(Debug, Clone, PartialEq)]
pub struct TracedArg {
    pub name: Option<String>,
    pub value: Proxy,
    /// Source text of the argument expression.
    pub expr: String,
    /// `*args` or `**kwargs`.
    pub splat: bool,
}

impl Proxy {
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Proxy::Resource(id) | Proxy::Collection(id) | Proxy::Machine(id) | Proxy::Element { id, .. } => {
                Some(*id)
            }
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Proxy::Machine(_) => "machine".to_string(),
            Proxy::Flag(expr) => format!("condition `{expr}`"),
            Proxy::Range(_) => "range".to_string(),
            other => format!("{other:?}"),
        }
    }

    fn unsupported(&self, operation: &str, at: SourcePosition) -> TraceError {
        TraceError::Unsupported { target: self.describe(), operation: operation.to_string(), position: at }
    }
}

/// The interaction surface shared by every stand-in. Each interaction that
/// touches a resource appends to the recorder and returns another stand-in.
pub trait Interact {
    fn subscript(
        &self,
        recorder: &mut Recorder<'_>,
        key: AccessKey,
        expr: &str,
        at: SourcePosition,
    ) -> Result<Proxy, TraceError>;

    fn attribute(&self, recorder: &mut Recorder<'_>, name: &str, expr: &str) -> Result<Proxy, TraceError>;

    fn iterate(&self, recorder: &Recorder<'_>, at: SourcePosition) -> Result<Iteration, TraceError>;

    fn invoke(
        &self,
        recorder: &mut Recorder<'_>,
        method: &str,
        args: Vec<TracedArg>,
        expr: &str,
        at: SourcePosition,
    ) -> Result<Proxy, TraceError>;

    fn compare(&self, op: &str, other: &Proxy, expr: &str) -> Proxy;

    fn truthiness(&self) -> Truth;
}

impl Interact for Proxy {
    fn subscript(
        &self,
        recorder: &mut Recorder<'_>,
        key: AccessKey,
        expr: &str,
        at: SourcePosition,
    ) -> Result<Proxy, TraceError> {
        match self {
            Proxy::Machine(_) | Proxy::Flag(_) => Err(self.unsupported("subscripting", at)),
            Proxy::Resource(r) | Proxy::Collection(r) | Proxy::Element { id: r, .. } => {
                let shape = recorder.resource(*r).and_then(|n| n.declared.subscript_shape(key.class()));
                match shape {
                    Some(shape) => {
                        let id = recorder.derive(*r, Access::Subscript { key }, shape);
                        Ok(recorder.proxy(id))
                    }
                    None => Ok(Proxy::Scalar(expr.to_string())),
                }
            }
            Proxy::Literal(Literal::List(items)) => match key {
                AccessKey::Index(i) => {
                    let idx = if i < 0 { items.len() as i64 + i } else { i };
                    Ok(usize::try_from(idx)
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .map(Proxy::Literal)
                        .unwrap_or_else(|| Proxy::Scalar(expr.to_string())))
                }
                _ => Ok(Proxy::Scalar(expr.to_string())),
            },
            _ => Ok(Proxy::Scalar(expr.to_string())),
        }
    }

    fn attribute(&self, recorder: &mut Recorder<'_>, name: &str, expr: &str) -> Result<Proxy, TraceError> {
        let Some(r) = self.resource() else {
            return Ok(Proxy::Scalar(expr.to_string()));
        };
        let shape = recorder.resource(r).and_then(|n| n.declared.member_shape(name));
        Ok(match shape {
            Some(shape) => {
                let id = recorder.derive(r, Access::Attribute { name: name.to_string() }, shape);
                recorder.proxy(id)
            }
            None => Proxy::Scalar(expr.to_string()),
        })
    }

    fn iterate(&self, recorder: &Recorder<'_>, at: SourcePosition) -> Result<Iteration, TraceError> {
        match self {
            Proxy::Machine(_) | Proxy::Flag(_) => Err(self.unsupported("iteration", at)),
            Proxy::Resource(r) | Proxy::Collection(r) | Proxy::Element { id: r, .. } => Ok(Iteration {
                collection: Some(*r),
                element: recorder.element_shape(*r),
                static_count: None,
            }),
            Proxy::Literal(Literal::List(items)) => {
                Ok(Iteration { static_count: Some(items.len() as u64), ..Iteration::default() })
            }
            Proxy::Range(count) => Ok(Iteration { static_count: *count, ..Iteration::default() }),
            _ => Ok(Iteration::default()),
        }
    }

    fn invoke(
        &self,
        recorder: &mut Recorder<'_>,
        method: &str,
        args: Vec<TracedArg>,
        expr: &str,
        at: SourcePosition,
    ) -> Result<Proxy, TraceError> {
        match self {
            Proxy::Machine(receiver) => {
                let mut bindings = Vec::new();
                let mut index = 0;
                for arg in args {
                    if arg.splat {
                        bindings.push(ArgumentBinding {
                            name: None,
                            position: None,
                            value: labtrace_core::BindingValue::Dynamic { expr: arg.expr },
                            can_precompute: false,
                        });
                        continue;
                    }
                    let value = recorder.binding(arg.value, &arg.expr);
                    match arg.name {
                        Some(name) => bindings.push(ArgumentBinding::keyword(name, value)),
                        None => {
                            bindings.push(ArgumentBinding::positional(index, value));
                            index += 1;
                        }
                    }
                }
                let op = recorder.call(method, *receiver, bindings, at);
                Ok(Proxy::Opaque { expr: expr.to_string(), produced_by: Some(op) })
            }
            Proxy::Resource(r) | Proxy::Collection(r) | Proxy::Element { id: r, .. } => {
                let shape = recorder.resource(*r).and_then(|n| n.declared.member_shape(method));
                Ok(match shape {
                    Some(shape) => {
                        let access = Access::Method {
                            name: method.to_string(),
                            args: args.into_iter().map(|a| a.expr).collect(),
                        };
                        let id = recorder.derive(*r, access, shape);
                        recorder.proxy(id)
                    }
                    None => Proxy::Scalar(expr.to_string()),
                })
            }
            _ => Ok(Proxy::Scalar(expr.to_string())),
        }
    }

    fn compare(&self, op: &str, other: &Proxy, expr: &str) -> Proxy {
        match (self, other) {
            (Proxy::Literal(a), Proxy::Literal(b)) => match fold_compare(op, a, b) {
                Some(r) => Proxy::Literal(Literal::Bool(r)),
                None => Proxy::Flag(expr.to_string()),
            },
            _ => Proxy::Flag(expr.to_string()),
        }
    }

    fn truthiness(&self) -> Truth {
        match self {
            Proxy::Literal(l) => Truth::Known(l.truthy()),
            Proxy::Resource(_) | Proxy::Collection(_) | Proxy::Element { .. } | Proxy::Machine(_) => Truth::Known(true),
            Proxy::Range(Some(n)) => Truth::Known(*n > 0),
            _ => Truth::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_comparisons_fold() {
        let a = Proxy::Literal(Literal::Int(3));
        let b = Proxy::Literal(Literal::Int(5));
        assert_eq!(a.compare("<", &b, "3 < 5"), Proxy::Literal(Literal::Bool(true)));
        assert_eq!(a.compare("<", &Proxy::Scalar("v".into()), "3 < v"), Proxy::Flag("3 < v".into()));
    }

    #[test]
    fn truthiness_of_stand_ins() {
        assert_eq!(Proxy::Flag("x > 1".into()).truthiness(), Truth::Unknown);
        assert_eq!(Proxy::Scalar("x".into()).truthiness(), Truth::Unknown);
        assert_eq!(Proxy::Literal(Literal::Int(0)).truthiness(), Truth::Known(false));
        assert_eq!(Proxy::Machine(ResourceId(0)).truthiness(), Truth::Known(true));
        assert_eq!(Proxy::Range(Some(0)).truthiness(), Truth::Known(false));
    }
}
