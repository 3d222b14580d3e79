//! Unmet-requirement delta against a physical layout.

use indexmap::IndexMap;
use labtrace_core::{
    AnalysisRecord, InferredRequirement, MachineRequirement, QuantityUnit, ResourceChain, ResourceKind, StateFact,
};
use serde::{Deserialize, Serialize};

/// A resource as currently placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedResource {
    pub kind: ResourceKind,
    /// Ancestor kinds of the spot it sits in, nearest first.
    #[serde(default)]
    pub chain: ResourceChain,
    #[serde(default)]
    pub has_content: bool,
    /// Per-item volume present, in µL, when measured.
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineState {
    #[serde(default)]
    pub tips_loaded: bool,
}

/// What is placed where, keyed by the names procedures use.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhysicalLayout {
    #[serde(default)]
    pub resources: IndexMap<String, PlacedResource>,
    #[serde(default)]
    pub machines: IndexMap<String, MachineState>,
}

/// One change the setup needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SetupAction {
    Place { resource: String, kind: Option<ResourceKind>, chain: ResourceChain },
    /// Placed, but under a chain the kind does not fit.
    Relocate { resource: String, from: ResourceChain, to: ResourceChain },
    /// Placed with a kind other than the one the procedure declares.
    ReplaceKind { resource: String, expected: ResourceKind, found: ResourceKind },
    Fill { resource: String },
    /// Has content, but less than the procedure consumes.
    TopUp { resource: String, present: f64, required: f64 },
    EjectTips { machine: String },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SetupDelta {
    pub actions: Vec<SetupAction>,
    /// Requirements the layout already meets.
    pub satisfied: Vec<String>,
}

impl SetupDelta {
    pub fn is_ready(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Compares requirements with a layout. Never touches the layout.
pub fn resolve(
    requirements: &[InferredRequirement],
    machines: &[MachineRequirement],
    layout: &PhysicalLayout,
) -> SetupDelta {
    let mut delta = SetupDelta::default();
    for req in requirements {
        let before = delta.actions.len();
        resolve_one(req, layout, &mut delta.actions);
        if delta.actions.len() == before {
            delta.satisfied.push(req.resource.clone());
        }
    }
    for req in machines {
        let loaded = layout.machines.get(&req.machine).is_some_and(|m| m.tips_loaded);
        if req.tips_empty && loaded {
            delta.actions.push(SetupAction::EjectTips { machine: req.machine.clone() });
        } else {
            delta.satisfied.push(req.machine.clone());
        }
    }
    delta
}

/// [`resolve`] over a stored analysis record.
pub fn resolve_record(record: &AnalysisRecord, layout: &PhysicalLayout) -> SetupDelta {
    resolve(&record.inferred_requirements, &record.machine_requirements, layout)
}

fn resolve_one(req: &InferredRequirement, layout: &PhysicalLayout, actions: &mut Vec<SetupAction>) {
    let name = &req.resource;
    let Some(placed) = layout.resources.get(name) else {
        if req.facts.contains(&StateFact::OnDeck) {
            actions.push(SetupAction::Place {
                resource: name.clone(),
                kind: req.kind,
                chain: req.required_chain.clone(),
            });
        }
        return;
    };

    if let Some(expected) = req.kind {
        if expected != placed.kind {
            actions.push(SetupAction::ReplaceKind { resource: name.clone(), expected, found: placed.kind });
        }
    }
    if req.facts.contains(&StateFact::OnDeck)
        && !req.required_chain.is_empty()
        && placed.chain != req.required_chain
    {
        actions.push(SetupAction::Relocate {
            resource: name.clone(),
            from: placed.chain.clone(),
            to: req.required_chain.clone(),
        });
    }
    if req.facts.contains(&StateFact::HasContent) {
        if !placed.has_content {
            actions.push(SetupAction::Fill { resource: name.clone() });
        } else if let (Some(quantity), Some(present)) = (req.quantity, placed.volume) {
            if quantity.unit == QuantityUnit::Microliters && present < quantity.amount {
                actions.push(SetupAction::TopUp { resource: name.clone(), present, required: quantity.amount });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labtrace_core::Quantity;

    fn slot_chain() -> ResourceChain {
        [ResourceKind::DeckSlot, ResourceKind::Deck].into_iter().collect()
    }

    fn plate_requirement(name: &str, facts: Vec<StateFact>) -> InferredRequirement {
        InferredRequirement {
            resource: name.to_string(),
            kind: Some(ResourceKind::Plate),
            required_chain: slot_chain(),
            facts,
            quantity: Some(Quantity { amount: 100.0, unit: QuantityUnit::Microliters }),
            details: Vec::new(),
        }
    }

    fn placed_plate(has_content: bool, volume: Option<f64>) -> PlacedResource {
        PlacedResource { kind: ResourceKind::Plate, chain: slot_chain(), has_content, volume }
    }

    #[test]
    fn missing_resource_is_placed() {
        let reqs = vec![plate_requirement("source", vec![StateFact::OnDeck, StateFact::HasContent])];
        let delta = resolve(&reqs, &[], &PhysicalLayout::default());
        assert_eq!(
            delta.actions,
            vec![SetupAction::Place {
                resource: "source".into(),
                kind: Some(ResourceKind::Plate),
                chain: slot_chain()
            }]
        );
        assert!(delta.satisfied.is_empty());
    }

    #[test]
    fn satisfied_layout_has_no_actions() {
        let reqs = vec![plate_requirement("source", vec![StateFact::OnDeck, StateFact::HasContent])];
        let mut layout = PhysicalLayout::default();
        layout.resources.insert("source".into(), placed_plate(true, Some(200.0)));
        let before = layout.clone();
        let delta = resolve(&reqs, &[], &layout);
        assert!(delta.is_ready());
        assert_eq!(delta.satisfied, vec!["source".to_string()]);
        assert_eq!(layout, before);
    }

    #[test]
    fn empty_or_short_resources_are_filled() {
        let reqs = vec![
            plate_requirement("a", vec![StateFact::OnDeck, StateFact::HasContent]),
            plate_requirement("b", vec![StateFact::OnDeck, StateFact::HasContent]),
        ];
        let mut layout = PhysicalLayout::default();
        layout.resources.insert("a".into(), placed_plate(false, None));
        layout.resources.insert("b".into(), placed_plate(true, Some(40.0)));
        let delta = resolve(&reqs, &[], &layout);
        assert_eq!(
            delta.actions,
            vec![
                SetupAction::Fill { resource: "a".into() },
                SetupAction::TopUp { resource: "b".into(), present: 40.0, required: 100.0 },
            ]
        );
    }

    #[test]
    fn wrong_kind_and_wrong_chain_are_reported() {
        let reqs = vec![plate_requirement("dest", vec![StateFact::OnDeck])];
        let mut layout = PhysicalLayout::default();
        let carrier: ResourceChain =
            [ResourceKind::CarrierSite, ResourceKind::Carrier, ResourceKind::Rail, ResourceKind::Deck]
                .into_iter()
                .collect();
        layout.resources.insert(
            "dest".into(),
            PlacedResource { kind: ResourceKind::Trough, chain: carrier.clone(), has_content: false, volume: None },
        );
        let delta = resolve(&reqs, &[], &layout);
        assert_eq!(
            delta.actions,
            vec![
                SetupAction::ReplaceKind {
                    resource: "dest".into(),
                    expected: ResourceKind::Plate,
                    found: ResourceKind::Trough
                },
                SetupAction::Relocate { resource: "dest".into(), from: carrier, to: slot_chain() },
            ]
        );
    }

    #[test]
    fn machine_with_tips_must_eject() {
        let machines = vec![MachineRequirement { machine: "lh".into(), tips_empty: true }];
        let mut layout = PhysicalLayout::default();
        layout.machines.insert("lh".into(), MachineState { tips_loaded: true });
        let delta = resolve(&[], &machines, &layout);
        assert_eq!(delta.actions, vec![SetupAction::EjectTips { machine: "lh".into() }]);
    }

    #[test]
    fn layout_parses_from_json() {
        let layout: PhysicalLayout = serde_json::from_str(
            r#"{"resources": {"tips": {"kind": "TipRack", "chain": ["DeckSlot", "Deck"], "has_content": true}},
                "machines": {"lh": {}}}"#,
        )
        .unwrap();
        assert_eq!(layout.resources["tips"].kind, ResourceKind::TipRack);
        assert_eq!(layout.resources["tips"].chain, slot_chain());
        assert!(!layout.machines["lh"].tips_loaded);
    }
}
