//! Error types for source parsing and static extraction.

use labtrace_core::CoreError;
use thiserror::Error;

/// Errors produced while parsing a module or extracting a procedure.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The Python grammar could not be loaded into the parser.
    #[error("failed to load python grammar: {reason}")]
    Grammar { reason: String },

    /// The parser returned no tree.
    #[error("parser produced no syntax tree")]
    NoTree,

    /// The module source does not parse.
    #[error("syntax error at {line}:{column}")]
    Syntax { line: u32, column: u32 },

    /// The requested procedure is not defined at module level.
    #[error("procedure '{name}' not found")]
    ProcedureNotFound { name: String },

    /// Graph construction broke an invariant.
    #[error(transparent)]
    Graph(#[from] CoreError),
}
