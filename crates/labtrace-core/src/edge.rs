//! Ordering edges between operations.

use serde::{Deserialize, Serialize};

use crate::id::{OperationId, ResourceId};

/// Why one operation must run before another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeKind {
    /// `to` consumes a value `from` produced (or something derived from it).
    DataDependency { resource: ResourceId },
    /// Both operations touch the same physical root resource.
    ResourceOrder { resource: ResourceId },
}

impl EdgeKind {
    pub fn resource(&self) -> ResourceId {
        match self {
            EdgeKind::DataDependency { resource } | EdgeKind::ResourceOrder { resource } => *resource,
        }
    }
}

/// A directed ordering edge `from -> to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderingEdge {
    pub from: OperationId,
    pub to: OperationId,
    pub kind: EdgeKind,
}
