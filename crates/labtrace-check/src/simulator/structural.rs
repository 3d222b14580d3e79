//! Structural validation of every call against the contract table.

use std::collections::BTreeSet;

use labtrace_core::{
    ArgumentBinding, BindingValue, Literal, OperationNode, ProtocolComputationGraph, StructuralFailure,
};
use tracing::debug;

use crate::contracts::{ContractDatabase, MethodSignature, ParamRole};

/// Checks that every call names a known method of its receiver and binds
/// arguments its signature accepts. Returns one failure per problem, in
/// graph order.
pub fn check_structure(graph: &ProtocolComputationGraph, contracts: &ContractDatabase) -> Vec<StructuralFailure> {
    let mut failures = Vec::new();
    for op in graph.calls() {
        let Some(receiver) = op.receiver.and_then(|r| graph.resource(r)) else {
            continue;
        };
        if receiver.declared.kinds.is_empty() {
            continue;
        }
        let fail = |message: String| StructuralFailure {
            message,
            call: call_text(graph, op),
            position: op.position,
        };
        let Some(entry) = contracts.resolve(&receiver.declared, &op.name) else {
            let kinds = receiver
                .declared
                .kinds
                .iter()
                .map(|k| k.describe())
                .collect::<Vec<_>>()
                .join(" or ");
            failures.push(fail(format!("`{}` is not a known operation of {kinds}", op.name)));
            continue;
        };
        for message in binding_errors(&entry.signature, &op.bindings) {
            failures.push(fail(message));
        }
    }
    if !failures.is_empty() {
        debug!(procedure = %graph.procedure, count = failures.len(), "structural failures");
    }
    failures
}

fn binding_errors(signature: &MethodSignature, bindings: &[ArgumentBinding]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut bound = BTreeSet::new();
    let mut splat = false;

    for binding in bindings {
        let index = match (&binding.name, binding.position) {
            (Some(name), _) => match signature.index_of(name) {
                Some(i) => Some(i),
                None => {
                    if !signature.open_keywords {
                        errors.push(format!("unexpected keyword argument `{name}`"));
                    }
                    None
                }
            },
            (None, Some(position)) => {
                if position >= signature.params.len() {
                    errors.push(format!(
                        "takes at most {} positional arguments but {} were given",
                        signature.params.len(),
                        position + 1
                    ));
                    None
                } else {
                    Some(position)
                }
            }
            (None, None) => {
                splat = true;
                None
            }
        };
        let Some(index) = index else {
            continue;
        };
        let param = &signature.params[index];
        if !bound.insert(index) {
            errors.push(format!("argument `{}` given more than once", param.name));
        }
        if param.role == ParamRole::Resource {
            if let BindingValue::Literal(lit) = &binding.value {
                if *lit != Literal::None {
                    errors.push(format!("argument `{}` expects a resource, got {lit}", param.name));
                }
            }
        }
    }

    if !splat {
        for (index, param) in signature.params.iter().enumerate() {
            if param.required && !bound.contains(&index) {
                errors.push(format!("missing required argument `{}`", param.name));
            }
        }
    }
    errors.sort();
    errors.dedup();
    errors
}

/// Source-like rendering of a call: `lh.aspirate(source["A1"], 50)`.
fn call_text(graph: &ProtocolComputationGraph, op: &OperationNode) -> String {
    let receiver = op
        .receiver
        .and_then(|r| graph.resource(r))
        .map(|r| r.name.as_str())
        .unwrap_or("?");
    let args = op
        .bindings
        .iter()
        .map(|b| {
            let value = match &b.value {
                BindingValue::Resource(id) => graph.resource(*id).map(|r| r.name.clone()).unwrap_or_default(),
                BindingValue::Literal(lit) => lit.to_string(),
                BindingValue::Dynamic { expr } => expr.clone(),
            };
            match &b.name {
                Some(name) => format!("{name}={value}"),
                None => value,
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{receiver}.{}({args})", op.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ParamSpec;

    fn signature() -> MethodSignature {
        MethodSignature {
            params: vec![
                ParamSpec::resource("resources"),
                ParamSpec::value("vols"),
                ParamSpec::optional("flow_rates"),
            ],
            open_keywords: false,
        }
    }

    fn res(id: u32) -> BindingValue {
        BindingValue::Resource(labtrace_core::ResourceId(id))
    }

    fn lit(v: i64) -> BindingValue {
        BindingValue::Literal(Literal::Int(v))
    }

    #[test]
    fn accepts_positional_and_keyword_mix() {
        let bindings = vec![ArgumentBinding::positional(0, res(1)), ArgumentBinding::keyword("vols", lit(50))];
        assert!(binding_errors(&signature(), &bindings).is_empty());
    }

    #[test]
    fn reports_missing_and_unexpected() {
        let bindings = vec![ArgumentBinding::positional(0, res(1)), ArgumentBinding::keyword("speed", lit(3))];
        let errors = binding_errors(&signature(), &bindings);
        assert_eq!(errors, vec!["missing required argument `vols`", "unexpected keyword argument `speed`"]);
    }

    #[test]
    fn reports_duplicates_and_overflow() {
        let bindings = vec![
            ArgumentBinding::positional(0, res(1)),
            ArgumentBinding::positional(1, lit(5)),
            ArgumentBinding::positional(2, lit(5)),
            ArgumentBinding::positional(3, lit(5)),
            ArgumentBinding::keyword("vols", lit(5)),
        ];
        let errors = binding_errors(&signature(), &bindings);
        assert!(errors.contains(&"argument `vols` given more than once".to_string()));
        assert!(errors.iter().any(|e| e.starts_with("takes at most 3 positional")));
    }

    #[test]
    fn literal_for_resource_parameter_is_rejected() {
        let bindings = vec![ArgumentBinding::positional(0, lit(7)), ArgumentBinding::positional(1, lit(5))];
        let errors = binding_errors(&signature(), &bindings);
        assert_eq!(errors, vec!["argument `resources` expects a resource, got 7"]);
    }

    #[test]
    fn splat_suppresses_missing_arguments() {
        let bindings = vec![ArgumentBinding {
            name: None,
            position: None,
            value: BindingValue::Dynamic { expr: "*args".into() },
            can_precompute: false,
        }];
        assert!(binding_errors(&signature(), &bindings).is_empty());
    }
}
