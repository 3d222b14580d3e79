//! Parsed procedure modules.

use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser, Tree};

use crate::error::ExtractError;
use crate::syntax::{child_by_kind, first_error, named_children, position, text};

/// A procedure to analyze: its name and the full text of its module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcedureSource {
    pub name: String,
    pub source: String,
}

impl ProcedureSource {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        ProcedureSource { name: name.into(), source: source.into() }
    }
}

/// A module's source text together with its syntax tree.
pub struct ParsedModule {
    source: String,
    tree: Tree,
}

/// A function definition inside a [`ParsedModule`].
#[derive(Debug, Clone, Copy)]
pub struct FunctionDef<'t> {
    pub node: Node<'t>,
    pub body: Node<'t>,
    pub is_async: bool,
}

impl std::fmt::Debug for ParsedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedModule").field("bytes", &self.source.len()).finish()
    }
}

impl ParsedModule {
    /// Parses Python source. Any syntax error is reported with the position
    /// of the first error node.
    pub fn parse(source: impl Into<String>) -> Result<Self, ExtractError> {
        let source = source.into();
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::language())
            .map_err(|e| ExtractError::Grammar { reason: e.to_string() })?;
        let tree = parser.parse(&source, None).ok_or(ExtractError::NoTree)?;
        if let Some(err) = first_error(tree.root_node()) {
            let pos = position(err);
            return Err(ExtractError::Syntax { line: pos.line, column: pos.column });
        }
        Ok(ParsedModule { source, tree })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    /// Top-level function definitions, including decorated ones.
    pub fn functions(&self) -> Vec<(String, FunctionDef<'_>)> {
        named_children(self.root())
            .into_iter()
            .filter_map(|n| match n.kind() {
                "function_definition" => Some(n),
                "decorated_definition" => n
                    .child_by_field_name("definition")
                    .filter(|d| d.kind() == "function_definition"),
                _ => None,
            })
            .filter_map(|n| self.function_def(n))
            .collect()
    }

    /// Looks up a top-level function by name.
    pub fn function(&self, name: &str) -> Option<FunctionDef<'_>> {
        self.functions().into_iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions().into_iter().map(|(n, _)| n).collect()
    }

    /// Wraps a `function_definition` node.
    pub fn function_def<'t>(&'t self, node: Node<'t>) -> Option<(String, FunctionDef<'t>)> {
        let name = text(node.child_by_field_name("name")?, &self.source).to_string();
        let body = node.child_by_field_name("body")?;
        let is_async = child_by_kind(node, "async").is_some();
        Some((name, FunctionDef { node, body, is_async }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = r#"
import asyncio

async def protocol(lh, plate):
    await lh.setup()

@decorator
def helper(x):
    return x
"#;

    #[test]
    fn finds_functions() {
        let module = ParsedModule::parse(SRC).unwrap();
        assert_eq!(module.function_names(), vec!["protocol", "helper"]);
        assert!(module.function("protocol").unwrap().is_async);
        assert!(!module.function("helper").unwrap().is_async);
        assert!(module.function("missing").is_none());
    }

    #[test]
    fn syntax_error_has_position() {
        let err = ParsedModule::parse("def broken(:\n    pass\n").unwrap_err();
        match err {
            ExtractError::Syntax { line, .. } => assert_eq!(line, 1),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }
}
