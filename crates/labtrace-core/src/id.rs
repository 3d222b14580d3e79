//! Stable ID newtypes for graph entities.
//!
//! Resource and operation IDs are distinct newtype wrappers over `u32` so
//! that a `ResourceId` cannot be used where an `OperationId` is expected.
//! Both are dense: the inner value is the creation index inside a
//! [`ProtocolComputationGraph`](crate::graph::ProtocolComputationGraph).

use std::fmt;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

/// Identity of a resource node (a named value the procedure touches).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u32);

/// Identity of an operation node. Doubles as the node index in the
/// ordering-edge dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

// Bridge between OperationId and petgraph's NodeIndex<u32>.

impl From<NodeIndex<u32>> for OperationId {
    fn from(idx: NodeIndex<u32>) -> Self {
        OperationId(idx.index() as u32)
    }
}

impl From<OperationId> for NodeIndex<u32> {
    fn from(id: OperationId) -> Self {
        NodeIndex::new(id.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_id_to_node_index_roundtrip() {
        let idx = NodeIndex::<u32>::new(42);
        let op = OperationId::from(idx);
        assert_eq!(op.0, 42);

        let back: NodeIndex<u32> = op.into();
        assert_eq!(back.index(), 42);
    }

    #[test]
    fn display_is_prefixed() {
        assert_eq!(format!("{}", ResourceId(7)), "r7");
        assert_eq!(format!("{}", OperationId(3)), "op3");
    }

    #[test]
    fn ids_order_by_creation_index() {
        let mut ids = vec![ResourceId(3), ResourceId(0), ResourceId(2)];
        ids.sort();
        assert_eq!(ids, vec![ResourceId(0), ResourceId(2), ResourceId(3)]);
    }

    #[test]
    fn serde_is_transparent_number() {
        let json = serde_json::to_string(&OperationId(9)).unwrap();
        assert_eq!(json, "9");
        let back: OperationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, OperationId(9));
    }
}
