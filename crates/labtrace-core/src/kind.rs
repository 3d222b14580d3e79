//! Resource kinds known to the analyzer.
//!
//! [`ResourceKind`] is a closed set of the physical and logical entities a
//! procedure can touch. Vendor-specific class names collapse onto these
//! through [`ResourceKind::from_name`]. Member and subscript semantics
//! (what `plate["A1:H1"]` or `lh.deck` yields) are answered by
//! [`ResourceKind::member_shape`] and [`ResourceKind::subscript_shape`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// A resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Deck,
    DeckSlot,
    Rail,
    Carrier,
    CarrierSite,
    Plate,
    Well,
    TipRack,
    TipSpot,
    Tip,
    Trough,
    TubeRack,
    Tube,
    Lid,
    Container,
    Resource,
    LiquidHandler,
    PlateReader,
    HeaterShaker,
}

/// Coarse classification used by the catalog and the failure search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceCategory {
    /// Hardware that receives operations.
    Machine,
    /// Deck, slots, rails, carriers.
    Infrastructure,
    /// Placeable labware (plates, racks, troughs).
    Labware,
    /// Addressable items inside labware (wells, tip spots, tubes).
    Item,
    /// Untyped resource.
    Generic,
}

/// What a member access or subscript on a resource yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    Single(ResourceKind),
    Collection(ResourceKind),
}

impl Shape {
    /// The kind of the value, or of each element for collections.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Shape::Single(k) | Shape::Collection(k) => *k,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Shape::Collection(_))
    }
}

impl ResourceKind {
    /// Every kind, in declaration order.
    pub const ALL: [ResourceKind; 19] = [
        ResourceKind::Deck,
        ResourceKind::DeckSlot,
        ResourceKind::Rail,
        ResourceKind::Carrier,
        ResourceKind::CarrierSite,
        ResourceKind::Plate,
        ResourceKind::Well,
        ResourceKind::TipRack,
        ResourceKind::TipSpot,
        ResourceKind::Tip,
        ResourceKind::Trough,
        ResourceKind::TubeRack,
        ResourceKind::Tube,
        ResourceKind::Lid,
        ResourceKind::Container,
        ResourceKind::Resource,
        ResourceKind::LiquidHandler,
        ResourceKind::PlateReader,
        ResourceKind::HeaterShaker,
    ];

    /// Canonical name as written in annotations.
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Deck => "Deck",
            ResourceKind::DeckSlot => "DeckSlot",
            ResourceKind::Rail => "Rail",
            ResourceKind::Carrier => "Carrier",
            ResourceKind::CarrierSite => "CarrierSite",
            ResourceKind::Plate => "Plate",
            ResourceKind::Well => "Well",
            ResourceKind::TipRack => "TipRack",
            ResourceKind::TipSpot => "TipSpot",
            ResourceKind::Tip => "Tip",
            ResourceKind::Trough => "Trough",
            ResourceKind::TubeRack => "TubeRack",
            ResourceKind::Tube => "Tube",
            ResourceKind::Lid => "Lid",
            ResourceKind::Container => "Container",
            ResourceKind::Resource => "Resource",
            ResourceKind::LiquidHandler => "LiquidHandler",
            ResourceKind::PlateReader => "PlateReader",
            ResourceKind::HeaterShaker => "HeaterShaker",
        }
    }

    /// Resolve a type name to a kind.
    ///
    /// Module-qualified names use their last segment (`plr.resources.Plate`
    /// is `Plate`). Vendor aliases map onto the closest kind. Returns `None`
    /// for names that are not resources.
    pub fn from_name(name: &str) -> Option<Self> {
        let last = name.rsplit('.').next().unwrap_or(name).trim();
        if let Some(kind) = ResourceKind::ALL.iter().find(|k| k.name() == last) {
            return Some(*kind);
        }
        let kind = match last {
            "PlateCarrier" | "TipCarrier" | "TroughCarrier" | "TubeCarrier" | "MFXCarrier" => {
                ResourceKind::Carrier
            }
            "PlateHolder" | "ResourceHolder" => ResourceKind::CarrierSite,
            "HamiltonDeck" | "HamiltonSTARDeck" | "STARLetDeck" | "VantageDeck" | "OTDeck" => {
                ResourceKind::Deck
            }
            "Reservoir" => ResourceKind::Trough,
            "ItemizedResource" => ResourceKind::Resource,
            "HamiltonTip" => ResourceKind::Tip,
            "Shaker" => ResourceKind::HeaterShaker,
            _ => return None,
        };
        Some(kind)
    }

    pub fn category(&self) -> ResourceCategory {
        match self {
            ResourceKind::LiquidHandler | ResourceKind::PlateReader | ResourceKind::HeaterShaker => {
                ResourceCategory::Machine
            }
            ResourceKind::Deck
            | ResourceKind::DeckSlot
            | ResourceKind::Rail
            | ResourceKind::Carrier
            | ResourceKind::CarrierSite => ResourceCategory::Infrastructure,
            ResourceKind::Plate
            | ResourceKind::TipRack
            | ResourceKind::Trough
            | ResourceKind::TubeRack
            | ResourceKind::Lid
            | ResourceKind::Container => ResourceCategory::Labware,
            ResourceKind::Well | ResourceKind::TipSpot | ResourceKind::Tip | ResourceKind::Tube => {
                ResourceCategory::Item
            }
            ResourceKind::Resource => ResourceCategory::Generic,
        }
    }

    pub fn is_machine(&self) -> bool {
        self.category() == ResourceCategory::Machine
    }

    /// Whether operations are invoked on this kind (machines and the deck).
    pub fn receives_operations(&self) -> bool {
        self.is_machine() || *self == ResourceKind::Deck
    }

    /// Labware that is placed on the deck as a unit.
    pub fn is_placeable(&self) -> bool {
        self.category() == ResourceCategory::Labware
    }

    /// Kinds whose instances hold liquid or consumables.
    pub fn holds_content(&self) -> bool {
        matches!(
            self,
            ResourceKind::Well
                | ResourceKind::Tube
                | ResourceKind::Container
                | ResourceKind::Trough
                | ResourceKind::TipSpot
        )
    }

    /// The addressable item kind of itemized labware.
    pub fn item_kind(&self) -> Option<ResourceKind> {
        match self {
            ResourceKind::Plate => Some(ResourceKind::Well),
            ResourceKind::TipRack => Some(ResourceKind::TipSpot),
            ResourceKind::TubeRack => Some(ResourceKind::Tube),
            ResourceKind::Trough => Some(ResourceKind::Container),
            _ => None,
        }
    }

    /// Result of subscripting a single resource of this kind.
    pub fn subscript_shape(&self) -> Option<Shape> {
        self.item_kind().map(Shape::Collection)
    }

    /// Result of accessing attribute or accessor method `member`.
    pub fn member_shape(&self, member: &str) -> Option<Shape> {
        if let Some(item) = self.item_kind() {
            match member {
                "children" | "get_all_items" | "get_items" | "get_wells" | "get_tips"
                | "get_all_tips" => return Some(Shape::Collection(item)),
                "get_well" | "get_item" | "get_tip" => return Some(Shape::Single(item)),
                _ => {}
            }
        }
        match (self, member) {
            (ResourceKind::Plate, "lid") => Some(Shape::Single(ResourceKind::Lid)),
            (k, "deck") if k.is_machine() => Some(Shape::Single(ResourceKind::Deck)),
            (ResourceKind::Deck, "get_resource") => Some(Shape::Single(ResourceKind::Resource)),
            (ResourceKind::TipSpot, "get_tip") => Some(Shape::Single(ResourceKind::Tip)),
            _ => None,
        }
    }

    /// Lowercase words for messages ("tip rack", "plate").
    pub fn describe(&self) -> &'static str {
        match self {
            ResourceKind::Deck => "deck",
            ResourceKind::DeckSlot => "deck slot",
            ResourceKind::Rail => "rail",
            ResourceKind::Carrier => "carrier",
            ResourceKind::CarrierSite => "carrier site",
            ResourceKind::Plate => "plate",
            ResourceKind::Well => "well",
            ResourceKind::TipRack => "tip rack",
            ResourceKind::TipSpot => "tip spot",
            ResourceKind::Tip => "tip",
            ResourceKind::Trough => "trough",
            ResourceKind::TubeRack => "tube rack",
            ResourceKind::Tube => "tube",
            ResourceKind::Lid => "lid",
            ResourceKind::Container => "container",
            ResourceKind::Resource => "resource",
            ResourceKind::LiquidHandler => "liquid handler",
            ResourceKind::PlateReader => "plate reader",
            ResourceKind::HeaterShaker => "heater shaker",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
