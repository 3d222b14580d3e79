//! Core error types for labtrace-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! invariant breaches of the graph data model and the hierarchy registry.

use crate::id::{OperationId, ResourceId};
use crate::kind::ResourceKind;
use thiserror::Error;

/// Core errors produced by the labtrace-core crate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// A resource id was not found in the graph.
    #[error("resource not found: ResourceId({id})", id = id.0)]
    ResourceNotFound { id: ResourceId },

    /// An operation id was not found in the graph.
    #[error("operation not found: OperationId({id})", id = id.0)]
    OperationNotFound { id: OperationId },

    /// A child was attached to an operation that cannot hold children.
    #[error("operation {id} is not a foreach or conditional node")]
    NotAContainer { id: OperationId },

    /// A parent override would make a kind its own ancestor.
    #[error("hierarchy cycle through {kind}")]
    HierarchyCycle { kind: ResourceKind },

    /// A parent override leaves a chain that does not end at the deck.
    #[error("containment chain for {kind} does not terminate at Deck")]
    UnrootedChain { kind: ResourceKind },

    /// An edge failed validation.
    #[error("invalid edge: {reason}")]
    InvalidEdge { reason: String },

    /// A structural invariant of the computation graph was violated.
    #[error("graph inconsistency: {reason}")]
    GraphInconsistency { reason: String },
}
