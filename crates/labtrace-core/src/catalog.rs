//! Resource catalog metadata.
//!
//! The catalog is consumed from outside the analyzer: per-kind category,
//! row/column dimensions for itemized labware, and per-item maximum volume.
//! Named overrides describe a specific resource (a 384-well plate bound to a
//! parameter called `assay`) and take precedence over the kind defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kind::{ResourceCategory, ResourceKind};

/// Row/column layout of itemized labware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub rows: u32,
    pub columns: u32,
}

impl Dimensions {
    pub fn new(rows: u32, columns: u32) -> Self {
        Dimensions { rows, columns }
    }

    /// Number of addressable items.
    pub fn count(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.columns)
    }
}

/// Static metadata for one kind or one named resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindMetadata {
    pub category: ResourceCategory,
    #[serde(default)]
    pub dimensions: Option<Dimensions>,
    /// Maximum volume of one item (well, tube, tip) in microliters.
    #[serde(default)]
    pub item_volume: Option<f64>,
}

impl KindMetadata {
    pub fn of(kind: ResourceKind) -> Self {
        KindMetadata {
            category: kind.category(),
            dimensions: None,
            item_volume: None,
        }
    }

    pub fn itemized(kind: ResourceKind, rows: u32, columns: u32, item_volume: f64) -> Self {
        KindMetadata {
            category: kind.category(),
            dimensions: Some(Dimensions::new(rows, columns)),
            item_volume: Some(item_volume),
        }
    }
}

/// Catalog of kind metadata with per-name overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceCatalog {
    #[serde(default)]
    kinds: BTreeMap<ResourceKind, KindMetadata>,
    #[serde(default)]
    named: BTreeMap<String, KindMetadata>,
}

impl ResourceCatalog {
    /// An empty catalog: no dimensions or volumes are known.
    pub fn empty() -> Self {
        ResourceCatalog::default()
    }

    /// Defaults for common labware: 96-well plates and tip racks, a 24-tube
    /// rack and an 8-channel trough.
    pub fn standard() -> Self {
        ResourceCatalog::empty()
            .with_kind(ResourceKind::Plate, KindMetadata::itemized(ResourceKind::Plate, 8, 12, 360.0))
            .with_kind(
                ResourceKind::TipRack,
                KindMetadata::itemized(ResourceKind::TipRack, 8, 12, 1000.0),
            )
            .with_kind(
                ResourceKind::TubeRack,
                KindMetadata::itemized(ResourceKind::TubeRack, 4, 6, 1500.0),
            )
            .with_kind(
                ResourceKind::Trough,
                KindMetadata::itemized(ResourceKind::Trough, 1, 8, 25_000.0),
            )
    }

    pub fn with_kind(mut self, kind: ResourceKind, meta: KindMetadata) -> Self {
        self.kinds.insert(kind, meta);
        self
    }

    pub fn with_named(mut self, name: impl Into<String>, meta: KindMetadata) -> Self {
        self.named.insert(name.into(), meta);
        self
    }

    /// Metadata for a resource, preferring a named override.
    pub fn metadata(&self, kind: Option<ResourceKind>, name: Option<&str>) -> Option<&KindMetadata> {
        name.and_then(|n| self.named.get(n))
            .or_else(|| kind.and_then(|k| self.kinds.get(&k)))
    }

    pub fn dimensions(&self, kind: Option<ResourceKind>, name: Option<&str>) -> Option<Dimensions> {
        self.metadata(kind, name).and_then(|m| m.dimensions)
    }

    /// Maximum volume of one item of the given labware.
    pub fn item_volume(&self, kind: Option<ResourceKind>, name: Option<&str>) -> Option<f64> {
        self.metadata(kind, name).and_then(|m| m.item_volume)
    }

    /// Largest item volume in the catalog, used as a plausibility cap for
    /// volumes that are only known at runtime.
    pub fn max_item_volume(&self) -> Option<f64> {
        self.kinds
            .values()
            .chain(self.named.values())
            .filter_map(|m| m.item_volume)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
    }

    /// Largest item count in the catalog.
    pub fn max_item_count(&self) -> Option<u64> {
        self.kinds
            .values()
            .chain(self.named.values())
            .filter_map(|m| m.dimensions.map(|d| d.count()))
            .max()
    }
}

// ---- well-range keys ----

fn split_well(name: &str) -> Option<(u32, u32)> {
    let name = name.trim();
    let letters: String = name.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &name[letters.len()..];
    if letters.is_empty() || digits.is_empty() {
        return None;
    }
    let column: u32 = digits.parse().ok()?;
    let row = letters
        .to_ascii_uppercase()
        .bytes()
        .try_fold(0u32, |acc, b| acc.checked_mul(26)?.checked_add(u32::from(b - b'A') + 1))?;
    Some((row, column))
}

/// Count the items a well-range key selects: `"A1"` is 1, `"A1:H1"` is 8,
/// `"A1:H12"` is 96, `"A1,B1"` is 2. Returns `None` for keys that are not
/// well names.
pub fn count_range_key(key: &str) -> Option<u64> {
    let mut total = 0u64;
    for part in key.split(',') {
        let part = part.trim();
        let count = match part.split_once(':') {
            Some((start, end)) => {
                let (r1, c1) = split_well(start)?;
                let (r2, c2) = split_well(end)?;
                u64::from(r1.abs_diff(r2) + 1) * u64::from(c1.abs_diff(c2) + 1)
            }
            None => {
                split_well(part)?;
                1
            }
        };
        total += count;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_keys() {
        assert_eq!(count_range_key("A1"), Some(1));
        assert_eq!(count_range_key("A1:H1"), Some(8));
        assert_eq!(count_range_key("A1:A12"), Some(12));
        assert_eq!(count_range_key("A1:H12"), Some(96));
        assert_eq!(count_range_key("H12:A1"), Some(96));
        assert_eq!(count_range_key("A1, B1"), Some(2));
        assert_eq!(count_range_key("AA1:AB1"), Some(2));
        assert_eq!(count_range_key("source"), None);
        assert_eq!(count_range_key("1"), None);
    }

    #[test]
    fn standard_plate_is_96_wells() {
        let catalog = ResourceCatalog::standard();
        let dims = catalog.dimensions(Some(ResourceKind::Plate), None).unwrap();
        assert_eq!(dims.count(), 96);
        assert_eq!(catalog.item_volume(Some(ResourceKind::TipRack), None), Some(1000.0));
    }

    #[test]
    fn named_override_wins() {
        let catalog = ResourceCatalog::standard().with_named(
            "assay",
            KindMetadata::itemized(ResourceKind::Plate, 16, 24, 120.0),
        );
        assert_eq!(
            catalog.dimensions(Some(ResourceKind::Plate), Some("assay")).map(|d| d.count()),
            Some(384)
        );
        assert_eq!(
            catalog.dimensions(Some(ResourceKind::Plate), Some("other")).map(|d| d.count()),
            Some(96)
        );
    }

    #[test]
    fn plausibility_caps() {
        let catalog = ResourceCatalog::standard();
        assert_eq!(catalog.max_item_volume(), Some(25_000.0));
        assert_eq!(catalog.max_item_count(), Some(96));
        assert_eq!(ResourceCatalog::empty().max_item_volume(), None);
    }

    #[test]
    fn catalog_json_roundtrip() {
        let catalog = ResourceCatalog::standard();
        let json = serde_json::to_string(&catalog).unwrap();
        let back: ResourceCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, catalog);
    }
}
