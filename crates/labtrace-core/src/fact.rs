//! State facts and the preconditions that reference them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{OperationId, ResourceId};

/// A state fact an operation may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateFact {
    /// The resource sits on the deck.
    OnDeck,
    /// The resource holds transferable content (liquid, or tips in a rack).
    HasContent,
    /// The resource can accept more content.
    HasCapacity,
    /// The machine has tips loaded.
    TipsLoaded,
    /// The machine has no tips loaded.
    TipsEmpty,
    /// The machine's channels hold aspirated liquid.
    HoldingContent,
    /// Enough content remains for the requested volume.
    SufficientContent,
    /// The requested volume fits in the resource.
    WithinCapacity,
    /// The requested volume fits in the loaded tips.
    WithinTipVolume,
    /// The channels hold at least the requested volume.
    SufficientHeld,
}

impl StateFact {
    /// Whether the fact is about the physical setup rather than the machine.
    pub fn is_environmental(&self) -> bool {
        matches!(self, StateFact::OnDeck | StateFact::HasContent | StateFact::HasCapacity)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            StateFact::OnDeck => "must be placed on the deck",
            StateFact::HasContent => "must contain transferable content",
            StateFact::HasCapacity => "must have free capacity",
            StateFact::TipsLoaded => "must have tips loaded",
            StateFact::TipsEmpty => "must not have tips loaded",
            StateFact::HoldingContent => "must hold aspirated liquid",
            StateFact::SufficientContent => "must contain enough liquid",
            StateFact::WithinCapacity => "must have room for the dispensed volume",
            StateFact::WithinTipVolume => "must have tips large enough for the volume",
            StateFact::SufficientHeld => "must hold enough liquid to dispense",
        }
    }
}

impl fmt::Display for StateFact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// A required state fact on a resource, with the operation that needs it
/// and, when known, the earlier operation that establishes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatePrecondition {
    pub resource: ResourceId,
    pub fact: StateFact,
    pub required_by: OperationId,
    pub satisfied_by: Option<OperationId>,
}
