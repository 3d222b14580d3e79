//! Error types for the analysis engine.
//!
//! [`CheckError`] is reserved for infrastructure failures. Structural
//! errors, state violations and unbounded loops are analysis *results* and
//! travel inside the record instead.
//!
//! [`TraceError`] is raised inside the tracer when a statement cannot be
//! modeled. The tracer catches it, logs it and skips the statement.

use labtrace_core::{CoreError, SimulationLevel, SourcePosition};
use labtrace_extract::ExtractError;
use labtrace_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// States only move up the precision ladder.
    #[error("cannot promote a {from} state to {to}")]
    InvalidPromotion {
        from: SimulationLevel,
        to: SimulationLevel,
    },

    /// The recorder's id allocation and the assembled graph disagree.
    #[error("trace assembly failed: {reason}")]
    TraceAssembly { reason: String },
}

/// A statement the tracer could not model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("call to unknown function `{name}` at {position}")]
    UnknownFunction { name: String, position: SourcePosition },

    #[error("`{target}` does not support {operation} at {position}")]
    Unsupported {
        target: String,
        operation: String,
        position: SourcePosition,
    },

    #[error("helper `{name}` called with {given} arguments, expects {expected} at {position}")]
    Arity {
        name: String,
        given: usize,
        expected: usize,
        position: SourcePosition,
    },

    #[error("helper `{name}` got an unexpected keyword argument `{keyword}` at {position}")]
    UnexpectedKeyword {
        name: String,
        keyword: String,
        position: SourcePosition,
    },

    #[error("`{name}` is not defined at {position}")]
    Undefined { name: String, position: SourcePosition },
}

impl TraceError {
    pub fn position(&self) -> SourcePosition {
        match self {
            TraceError::UnknownFunction { position, .. }
            | TraceError::Unsupported { position, .. }
            | TraceError::Arity { position, .. }
            | TraceError::UnexpectedKeyword { position, .. }
            | TraceError::Undefined { position, .. } => *position,
        }
    }
}
