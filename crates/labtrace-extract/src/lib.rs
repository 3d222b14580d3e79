//! Python procedure parsing and static graph extraction.
//!
//! Parses a module with tree-sitter, reads the target procedure's
//! signature, and walks its body to build a
//! [`ProtocolComputationGraph`](labtrace_core::ProtocolComputationGraph)
//! without executing anything.

pub mod error;
pub mod extractor;
pub mod signature;
pub mod source;
pub mod syntax;

pub use error::ExtractError;
pub use extractor::{extract_procedure, Extraction, Unresolved, UnresolvedReason, INERT_BUILTINS};
pub use signature::{signature_of, ParamKind, Parameter, ProcedureSignature};
pub use source::{FunctionDef, ParsedModule, ProcedureSource};
