//! Procedure signatures: parameter names, kinds and declared types.

use labtrace_core::DeclaredType;
use serde::{Deserialize, Serialize};
use tree_sitter::Node;

use crate::source::FunctionDef;
use crate::syntax::{named_children, text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Positional,
    KeywordOnly,
    VarPositional,
    VarKeyword,
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub annotation: Option<String>,
    pub declared: DeclaredType,
    /// Default value source text.
    pub default: Option<String>,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureSignature {
    pub name: String,
    pub is_async: bool,
    pub parameters: Vec<Parameter>,
}

impl ProcedureSignature {
    /// Parameters that can be bound positionally, in order.
    pub fn positional(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(|p| p.kind == ParamKind::Positional)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

fn parameter(node: Node<'_>, source: &str, kind: ParamKind) -> Option<Parameter> {
    let (name_node, kind) = match node.kind() {
        "identifier" => (node, kind),
        "list_splat_pattern" => (node.named_child(0)?, ParamKind::VarPositional),
        "dictionary_splat_pattern" => (node.named_child(0)?, ParamKind::VarKeyword),
        "typed_parameter" => {
            let inner = node.named_child(0)?;
            match inner.kind() {
                "list_splat_pattern" => (inner.named_child(0)?, ParamKind::VarPositional),
                "dictionary_splat_pattern" => (inner.named_child(0)?, ParamKind::VarKeyword),
                _ => (inner, kind),
            }
        }
        "default_parameter" | "typed_default_parameter" => (node.child_by_field_name("name")?, kind),
        _ => return None,
    };
    let annotation = node.child_by_field_name("type").map(|t| text(t, source).to_string());
    let declared = annotation.as_deref().map(DeclaredType::parse).unwrap_or_else(DeclaredType::unknown);
    let default = node.child_by_field_name("value").map(|v| text(v, source).to_string());
    Some(Parameter {
        name: text(name_node, source).to_string(),
        annotation,
        declared,
        default,
        kind,
    })
}

/// Reads the signature of a function definition.
pub fn signature_of(name: &str, def: &FunctionDef<'_>, source: &str) -> ProcedureSignature {
    let mut parameters = Vec::new();
    let mut kind = ParamKind::Positional;
    if let Some(params) = def.node.child_by_field_name("parameters") {
        for child in named_children(params) {
            match child.kind() {
                "keyword_separator" => kind = ParamKind::KeywordOnly,
                "positional_separator" | "comment" => {}
                _ => {
                    if let Some(p) = parameter(child, source, kind) {
                        if p.kind == ParamKind::VarPositional {
                            kind = ParamKind::KeywordOnly;
                        }
                        parameters.push(p);
                    }
                }
            }
        }
    }
    ProcedureSignature { name: name.to_string(), is_async: def.is_async, parameters }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ParsedModule;
    use labtrace_core::ResourceKind;

    #[test]
    fn reads_annotations_defaults_and_kinds() {
        let src = "async def run(lh: LiquidHandler, wells: list[Well], vol: float = 50.0, *args, mode: str = 'a', **kw):\n    pass\n";
        let module = ParsedModule::parse(src).unwrap();
        let def = module.function("run").unwrap();
        let sig = signature_of("run", &def, module.source());

        assert!(sig.is_async);
        let names: Vec<_> = sig.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["lh", "wells", "vol", "args", "mode", "kw"]);

        let lh = sig.parameter("lh").unwrap();
        assert_eq!(lh.declared.primary(), Some(ResourceKind::LiquidHandler));
        let wells = sig.parameter("wells").unwrap();
        assert!(wells.declared.collection);
        assert_eq!(wells.declared.element, Some(ResourceKind::Well));
        assert_eq!(sig.parameter("vol").unwrap().default.as_deref(), Some("50.0"));
        assert_eq!(sig.parameter("args").unwrap().kind, ParamKind::VarPositional);
        assert_eq!(sig.parameter("mode").unwrap().kind, ParamKind::KeywordOnly);
        assert_eq!(sig.parameter("kw").unwrap().kind, ParamKind::VarKeyword);
        assert_eq!(sig.positional().count(), 3);
    }

    #[test]
    fn unannotated_parameters_have_no_kinds() {
        let module = ParsedModule::parse("def run(lh, plate):\n    pass\n").unwrap();
        let def = module.function("run").unwrap();
        let sig = signature_of("run", &def, module.source());
        assert!(sig.parameters.iter().all(|p| !p.declared.is_resource()));
    }
}
