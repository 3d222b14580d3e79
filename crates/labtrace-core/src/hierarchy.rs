//! Resource hierarchy registry.
//!
//! Maps a resource kind to the ordered chain of ancestor kinds it must sit
//! in, ending at the deck. The table is parameterized by deck topology:
//! slot-based decks hold labware directly in a slot, carrier-based decks
//! hold it in a carrier site on a carrier on a rail.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::CoreError;
use crate::kind::ResourceKind;

/// Ordered ancestor kinds, nearest first.
pub type ResourceChain = SmallVec<[ResourceKind; 6]>;

/// How labware is seated on the deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeckTopology {
    #[default]
    SlotBased,
    CarrierBased,
}

impl fmt::Display for DeckTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeckTopology::SlotBased => f.write_str("slot"),
            DeckTopology::CarrierBased => f.write_str("carrier"),
        }
    }
}

impl FromStr for DeckTopology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slot" | "slot_based" | "slots" => Ok(DeckTopology::SlotBased),
            "carrier" | "carrier_based" | "carriers" => Ok(DeckTopology::CarrierBased),
            other => Err(format!("unknown deck topology '{other}' (expected slot or carrier)")),
        }
    }
}

fn standard_parent(kind: ResourceKind, topology: DeckTopology) -> Option<ResourceKind> {
    use ResourceKind::*;
    match kind {
        Well => Some(Plate),
        TipSpot => Some(TipRack),
        Tip => Some(TipSpot),
        Tube => Some(TubeRack),
        Lid => Some(Plate),
        Plate | TipRack | TubeRack | Trough | Container => match topology {
            DeckTopology::SlotBased => Some(DeckSlot),
            DeckTopology::CarrierBased => Some(CarrierSite),
        },
        DeckSlot => Some(Deck),
        CarrierSite => Some(Carrier),
        Carrier => Some(Rail),
        Rail => Some(Deck),
        Deck | Resource | LiquidHandler | PlateReader | HeaterShaker => None,
    }
}

/// Static containment table with validated overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HierarchyRegistry {
    overrides: BTreeMap<(ResourceKind, DeckTopology), Option<ResourceKind>>,
}

impl HierarchyRegistry {
    /// The built-in table without overrides.
    pub fn standard() -> Self {
        HierarchyRegistry::default()
    }

    /// Immediate parent of `kind` under `topology`.
    pub fn parent(&self, kind: ResourceKind, topology: DeckTopology) -> Option<ResourceKind> {
        match self.overrides.get(&(kind, topology)) {
            Some(parent) => *parent,
            None => standard_parent(kind, topology),
        }
    }

    /// Replace the parent of `kind` for one topology.
    ///
    /// Returns [`CoreError::HierarchyCycle`] if the override makes a kind
    /// its own ancestor and [`CoreError::UnrootedChain`] if any chain no
    /// longer ends at `Deck`.
    pub fn with_parent(
        mut self,
        kind: ResourceKind,
        topology: DeckTopology,
        parent: Option<ResourceKind>,
    ) -> Result<Self, CoreError> {
        self.overrides.insert((kind, topology), parent);
        for k in ResourceKind::ALL {
            self.walk(k, topology)?;
        }
        Ok(self)
    }

    fn walk(&self, kind: ResourceKind, topology: DeckTopology) -> Result<ResourceChain, CoreError> {
        let mut chain = ResourceChain::new();
        let mut current = kind;
        while let Some(parent) = self.parent(current, topology) {
            if parent == kind || chain.contains(&parent) {
                return Err(CoreError::HierarchyCycle { kind: parent });
            }
            chain.push(parent);
            current = parent;
        }
        if let Some(last) = chain.last() {
            if *last != ResourceKind::Deck {
                return Err(CoreError::UnrootedChain { kind });
            }
        }
        Ok(chain)
    }

    /// Ancestor kinds of `kind`, nearest first, ending at `Deck`. Kinds
    /// with no placement (deck, machines, untyped resources) get an empty
    /// chain.
    pub fn chain_for(&self, kind: ResourceKind, topology: DeckTopology) -> ResourceChain {
        // Overrides are validated on insertion, so the walk cannot fail
        // for a registry built through `with_parent`.
        self.walk(kind, topology).unwrap_or_default()
    }

    /// Chain for an optional kind; unknown kinds get an empty chain.
    pub fn chain_for_opt(&self, kind: Option<ResourceKind>, topology: DeckTopology) -> ResourceChain {
        kind.map(|k| self.chain_for(k, topology)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ResourceKind::*;

    #[test]
    fn well_chain_slot_based() {
        let reg = HierarchyRegistry::standard();
        assert_eq!(
            reg.chain_for(Well, DeckTopology::SlotBased).as_slice(),
            &[Plate, DeckSlot, Deck]
        );
    }

    #[test]
    fn well_chain_carrier_based() {
        let reg = HierarchyRegistry::standard();
        assert_eq!(
            reg.chain_for(Well, DeckTopology::CarrierBased).as_slice(),
            &[Plate, CarrierSite, Carrier, Rail, Deck]
        );
    }

    #[test]
    fn unplaced_kinds_have_empty_chain() {
        let reg = HierarchyRegistry::standard();
        for kind in [Deck, Resource, LiquidHandler, PlateReader, HeaterShaker] {
            assert!(reg.chain_for(kind, DeckTopology::SlotBased).is_empty());
        }
    }

    #[test]
    fn cyclic_override_rejected() {
        let err = HierarchyRegistry::standard()
            .with_parent(DeckSlot, DeckTopology::SlotBased, Some(Plate))
            .unwrap_err();
        assert!(matches!(err, CoreError::HierarchyCycle { .. }), "got {err:?}");
    }

    #[test]
    fn unrooted_override_rejected() {
        let err = HierarchyRegistry::standard()
            .with_parent(Rail, DeckTopology::CarrierBased, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::UnrootedChain { .. }), "got {err:?}");
    }

    #[test]
    fn valid_override_applies() {
        // Tube racks on a shaker-mounted site: still rooted at the deck.
        let reg = HierarchyRegistry::standard()
            .with_parent(TubeRack, DeckTopology::SlotBased, Some(CarrierSite))
            .unwrap();
        assert_eq!(
            reg.chain_for(Tube, DeckTopology::SlotBased).as_slice(),
            &[TubeRack, CarrierSite, Carrier, Rail, Deck]
        );
    }

    #[test]
    fn topology_parses() {
        assert_eq!("slot".parse::<DeckTopology>(), Ok(DeckTopology::SlotBased));
        assert_eq!("Carrier".parse::<DeckTopology>(), Ok(DeckTopology::CarrierBased));
        assert!("rack".parse::<DeckTopology>().is_err());
    }

    proptest! {
        #[test]
        fn chains_are_finite_acyclic_and_rooted(
            kind in prop::sample::select(ResourceKind::ALL.to_vec()),
            carrier in any::<bool>(),
        ) {
            let topology = if carrier { DeckTopology::CarrierBased } else { DeckTopology::SlotBased };
            let chain = HierarchyRegistry::standard().chain_for(kind, topology);
            if !chain.is_empty() {
                prop_assert!(chain.len() <= ResourceKind::ALL.len());
                let mut seen = std::collections::BTreeSet::new();
                for k in chain.iter() {
                    prop_assert!(seen.insert(*k), "repeated {} in chain of {}", k, kind);
                    prop_assert_ne!(*k, kind);
                }
                prop_assert_eq!(*chain.last().unwrap(), Deck);
            }
        }
    }
}
