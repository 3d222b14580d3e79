//! Method contract database.
//!
//! Maps (receiver kind, method name) to the method's signature and, when
//! the method is modeled, its contract: the state it requires before it
//! runs and the state changes it causes. The table is static and read-only
//! once built, so it is shared freely across analysis threads.
//!
//! A method with a signature but no contract is still accepted by the
//! structural check; the simulator treats it as a no-op and warns.

use std::fmt;

use indexmap::IndexMap;
use labtrace_core::{DeclaredType, ProtocolComputationGraph, ResourceId, ResourceKind, StateFact};
use serde::Serialize;
use tracing::debug;

/// Bumped whenever simulation semantics change in a way that invalidates
/// cached records.
pub const SIMULATION_VERSION: u32 = 1;

/// Revision of the built-in contract table.
pub const STANDARD_REVISION: u32 = 1;

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

/// A reference to one declared parameter of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ArgRef {
    pub name: &'static str,
    pub index: usize,
}

impl ArgRef {
    pub const fn new(name: &'static str, index: usize) -> Self {
        ArgRef { name, index }
    }
}

/// What a parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamRole {
    Resource,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub required: bool,
    pub role: ParamRole,
}

impl ParamSpec {
    pub const fn resource(name: &'static str) -> Self {
        ParamSpec { name, required: true, role: ParamRole::Resource }
    }

    pub const fn value(name: &'static str) -> Self {
        ParamSpec { name, required: true, role: ParamRole::Value }
    }

    pub const fn optional(name: &'static str) -> Self {
        ParamSpec { name, required: false, role: ParamRole::Value }
    }

    pub const fn optional_resource(name: &'static str) -> Self {
        ParamSpec { name, required: false, role: ParamRole::Resource }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodSignature {
    pub params: Vec<ParamSpec>,
    /// Accepts backend-specific keyword arguments beyond `params`.
    pub open_keywords: bool,
}

impl MethodSignature {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// A state fact a method requires before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Precondition {
    /// The receiving machine has (or, with `expected: false`, has no) tips.
    TipsLoaded { expected: bool },
    OnDeck { arg: ArgRef },
    HasContent { arg: ArgRef },
    HasCapacity { arg: ArgRef },
    SufficientContent { arg: ArgRef, volume: ArgRef },
    WithinCapacity { arg: ArgRef, volume: ArgRef },
    WithinTipVolume { volume: ArgRef },
    HoldingContent,
    SufficientHeld { volume: ArgRef },
}

impl Precondition {
    pub fn fact(&self) -> StateFact {
        match self {
            Precondition::TipsLoaded { expected: true } => StateFact::TipsLoaded,
            Precondition::TipsLoaded { expected: false } => StateFact::TipsEmpty,
            Precondition::OnDeck { .. } => StateFact::OnDeck,
            Precondition::HasContent { .. } => StateFact::HasContent,
            Precondition::HasCapacity { .. } => StateFact::HasCapacity,
            Precondition::SufficientContent { .. } => StateFact::SufficientContent,
            Precondition::WithinCapacity { .. } => StateFact::WithinCapacity,
            Precondition::WithinTipVolume { .. } => StateFact::WithinTipVolume,
            Precondition::HoldingContent => StateFact::HoldingContent,
            Precondition::SufficientHeld { .. } => StateFact::SufficientHeld,
        }
    }

    /// The argument the precondition is about; `None` for facts on the
    /// receiving machine.
    pub fn subject(&self) -> Option<ArgRef> {
        match self {
            Precondition::OnDeck { arg }
            | Precondition::HasContent { arg }
            | Precondition::HasCapacity { arg }
            | Precondition::SufficientContent { arg, .. }
            | Precondition::WithinCapacity { arg, .. } => Some(*arg),
            _ => None,
        }
    }

    /// True for facts tracked by the presence level; the rest concern
    /// quantities.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            Precondition::TipsLoaded { .. }
                | Precondition::OnDeck { .. }
                | Precondition::HasContent { .. }
                | Precondition::HasCapacity { .. }
                | Precondition::HoldingContent
        )
    }
}

/// Where dropped tips go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TipSink {
    Arg(ArgRef),
    /// Back to the spots they were picked up from.
    Origin,
    Trash,
}

/// A state change a method causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect {
    LoadTips { from: ArgRef },
    DropTips { to: TipSink },
    Aspirate { from: ArgRef, volume: ArgRef },
    Dispense { to: ArgRef, volume: ArgRef },
    Transfer { from: ArgRef, to: ArgRef, volume: ArgRef },
    Place { arg: ArgRef },
    Remove { arg: ArgRef },
    Move { arg: ArgRef },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodContract {
    /// "aspirating", "picking up tips"; used in fix suggestions.
    pub gerund: &'static str,
    pub preconditions: Vec<Precondition>,
    pub effects: Vec<Effect>,
}

/// Text naming a resource in messages: kind words plus source name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub kind: Option<ResourceKind>,
    pub name: String,
}

impl Subject {
    pub fn of(graph: &ProtocolComputationGraph, id: ResourceId) -> Self {
        match graph.resource(id) {
            Some(node) => Subject { kind: node.kind().or(node.placement_kind()), name: node.name.clone() },
            None => Subject { kind: None, name: id.to_string() },
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{} `{}`", kind.describe(), self.name),
            None => write!(f, "`{}`", self.name),
        }
    }
}

impl MethodContract {
    /// Human-readable fix for a violated precondition.
    pub fn suggested_fix(&self, precondition: &Precondition, subject: &Subject) -> String {
        let gerund = self.gerund;
        match precondition {
            Precondition::TipsLoaded { expected: true } => format!("pick up tips before {gerund}"),
            Precondition::TipsLoaded { expected: false } => format!("drop tips before {gerund}"),
            Precondition::OnDeck { .. } => format!("place {subject} on the deck first"),
            Precondition::HasContent { .. } => {
                let holds_tips = matches!(
                    subject.kind,
                    Some(ResourceKind::TipRack | ResourceKind::TipSpot | ResourceKind::Tip)
                );
                if holds_tips {
                    format!("load tips into {subject} before {gerund}")
                } else {
                    format!("fill {subject} before {gerund}")
                }
            }
            Precondition::HasCapacity { .. } => format!("empty {subject} before {gerund}"),
            Precondition::SufficientContent { .. } => {
                format!("add more liquid to {subject} or reduce the volume")
            }
            Precondition::WithinCapacity { .. } => {
                format!("reduce the volume dispensed into {subject}")
            }
            Precondition::WithinTipVolume { .. } => {
                "use larger tips or split the volume across several steps".to_string()
            }
            Precondition::HoldingContent => format!("aspirate before {gerund}"),
            Precondition::SufficientHeld { .. } => {
                format!("aspirate at least the dispensed volume before {gerund}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// One method on one receiver kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodEntry {
    pub receiver: ResourceKind,
    pub method: &'static str,
    pub signature: MethodSignature,
    pub contract: Option<MethodContract>,
}

impl MethodEntry {
    pub fn new(receiver: ResourceKind, method: &'static str, params: &[ParamSpec]) -> Self {
        MethodEntry {
            receiver,
            method,
            signature: MethodSignature { params: params.to_vec(), open_keywords: false },
            contract: None,
        }
    }

    pub fn open_keywords(mut self) -> Self {
        self.signature.open_keywords = true;
        self
    }

    pub fn with_contract(
        mut self,
        gerund: &'static str,
        preconditions: Vec<Precondition>,
        effects: Vec<Effect>,
    ) -> Self {
        self.contract = Some(MethodContract { gerund, preconditions, effects });
        self
    }

    /// A modeled method with no preconditions or effects.
    pub fn inert(self, gerund: &'static str) -> Self {
        self.with_contract(gerund, Vec::new(), Vec::new())
    }
}

/// The contract table, keyed by receiver kind then method name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractDatabase {
    revision: u32,
    entries: IndexMap<ResourceKind, IndexMap<&'static str, MethodEntry>>,
}

impl Default for ContractDatabase {
    fn default() -> Self {
        ContractDatabase::standard()
    }
}

impl ContractDatabase {
    pub fn empty(revision: u32) -> Self {
        ContractDatabase { revision, entries: IndexMap::new() }
    }

    /// Registers a method. When the (receiver, method) pair is already
    /// present the earlier registration is kept and `false` is returned.
    pub fn register(&mut self, entry: MethodEntry) -> bool {
        let methods = self.entries.entry(entry.receiver).or_default();
        if methods.contains_key(entry.method) {
            debug!(
                receiver = %entry.receiver,
                method = entry.method,
                "duplicate contract registration ignored"
            );
            return false;
        }
        methods.insert(entry.method, entry);
        true
    }

    pub fn lookup(&self, receiver: ResourceKind, method: &str) -> Option<&MethodEntry> {
        self.entries.get(&receiver)?.get(method)
    }

    /// Resolves a method on a possibly-union receiver type, trying the
    /// declared kinds in order.
    pub fn resolve(&self, receiver: &DeclaredType, method: &str) -> Option<&MethodEntry> {
        receiver.kinds.iter().find_map(|k| self.lookup(*k, method))
    }

    pub fn entries(&self) -> impl Iterator<Item = &MethodEntry> {
        self.entries.values().flat_map(|m| m.values())
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Version tag written into every analysis record.
    pub fn version(&self) -> String {
        format!("sim-{SIMULATION_VERSION}/contracts-r{}", self.revision)
    }

    /// The built-in table for liquid handlers, decks, plate readers and
    /// heater shakers.
    pub fn standard() -> Self {
        let mut db = ContractDatabase::empty(STANDARD_REVISION);
        for entry in liquid_handler()
            .into_iter()
            .chain(deck())
            .chain(plate_reader())
            .chain(heater_shaker())
        {
            db.register(entry);
        }
        db
    }
}

// ---- standard table ----

use Effect as E;
use ParamSpec as P;
use Precondition as Pre;

fn liquid_handler() -> Vec<MethodEntry> {
    let lh = ResourceKind::LiquidHandler;
    let tip_spots = ArgRef::new("tip_spots", 0);
    let resources = ArgRef::new("resources", 0);
    let vols = ArgRef::new("vols", 1);
    let source = ArgRef::new("source", 0);
    let targets = ArgRef::new("targets", 1);
    let source_vol = ArgRef::new("source_vol", 2);
    let tip_rack = ArgRef::new("tip_rack", 0);
    let resource = ArgRef::new("resource", 0);
    let volume = ArgRef::new("volume", 1);
    let plate = ArgRef::new("plate", 0);
    let lid = ArgRef::new("lid", 0);
    let to = ArgRef::new("to", 1);

    let aspirate_pre = |from: ArgRef, vol: ArgRef| {
        vec![
            Pre::TipsLoaded { expected: true },
            Pre::OnDeck { arg: from },
            Pre::HasContent { arg: from },
            Pre::WithinTipVolume { volume: vol },
            Pre::SufficientContent { arg: from, volume: vol },
        ]
    };
    let dispense_pre = |into: ArgRef, vol: ArgRef| {
        vec![
            Pre::TipsLoaded { expected: true },
            Pre::OnDeck { arg: into },
            Pre::HoldingContent,
            Pre::HasCapacity { arg: into },
            Pre::SufficientHeld { volume: vol },
            Pre::WithinCapacity { arg: into, volume: vol },
        ]
    };

    vec![
        MethodEntry::new(lh, "setup", &[]).open_keywords().inert("setting up"),
        MethodEntry::new(lh, "stop", &[]).inert("stopping"),
        MethodEntry::new(lh, "summary", &[]).inert("summarizing"),
        MethodEntry::new(
            lh,
            "pick_up_tips",
            &[P::resource("tip_spots"), P::optional("use_channels"), P::optional("offsets")],
        )
        .open_keywords()
        .with_contract(
            "picking up tips",
            vec![
                Pre::TipsLoaded { expected: false },
                Pre::OnDeck { arg: tip_spots },
                Pre::HasContent { arg: tip_spots },
            ],
            vec![E::LoadTips { from: tip_spots }],
        ),
        MethodEntry::new(
            lh,
            "drop_tips",
            &[
                P::resource("tip_spots"),
                P::optional("use_channels"),
                P::optional("offsets"),
                P::optional("allow_nonzero_volume"),
            ],
        )
        .open_keywords()
        .with_contract(
            "dropping tips",
            vec![Pre::TipsLoaded { expected: true }, Pre::OnDeck { arg: tip_spots }],
            vec![E::DropTips { to: TipSink::Arg(tip_spots) }],
        ),
        MethodEntry::new(lh, "return_tips", &[P::optional("use_channels")])
            .open_keywords()
            .with_contract(
                "returning tips",
                vec![Pre::TipsLoaded { expected: true }],
                vec![E::DropTips { to: TipSink::Origin }],
            ),
        MethodEntry::new(lh, "discard_tips", &[P::optional("use_channels")])
            .open_keywords()
            .with_contract(
                "discarding tips",
                vec![Pre::TipsLoaded { expected: true }],
                vec![E::DropTips { to: TipSink::Trash }],
            ),
        MethodEntry::new(
            lh,
            "aspirate",
            &[
                P::resource("resources"),
                P::value("vols"),
                P::optional("use_channels"),
                P::optional("flow_rates"),
                P::optional("offsets"),
                P::optional("liquid_height"),
                P::optional("blow_out_air_volume"),
            ],
        )
        .open_keywords()
        .with_contract(
            "aspirating",
            aspirate_pre(resources, vols),
            vec![E::Aspirate { from: resources, volume: vols }],
        ),
        MethodEntry::new(
            lh,
            "dispense",
            &[
                P::resource("resources"),
                P::value("vols"),
                P::optional("use_channels"),
                P::optional("flow_rates"),
                P::optional("offsets"),
                P::optional("liquid_height"),
                P::optional("blow_out_air_volume"),
            ],
        )
        .open_keywords()
        .with_contract(
            "dispensing",
            dispense_pre(resources, vols),
            vec![E::Dispense { to: resources, volume: vols }],
        ),
        MethodEntry::new(
            lh,
            "transfer",
            &[
                P::resource("source"),
                P::resource("targets"),
                P::optional("source_vol"),
                P::optional("ratios"),
                P::optional("target_vols"),
            ],
        )
        .open_keywords()
        .with_contract(
            "transferring",
            vec![
                Pre::TipsLoaded { expected: true },
                Pre::OnDeck { arg: source },
                Pre::OnDeck { arg: targets },
                Pre::HasContent { arg: source },
                Pre::HasCapacity { arg: targets },
                Pre::WithinTipVolume { volume: source_vol },
                Pre::SufficientContent { arg: source, volume: source_vol },
                Pre::WithinCapacity { arg: targets, volume: source_vol },
            ],
            vec![E::Transfer { from: source, to: targets, volume: source_vol }],
        ),
        MethodEntry::new(lh, "pick_up_tips96", &[P::resource("tip_rack"), P::optional("offset")])
            .open_keywords()
            .with_contract(
                "picking up tips",
                vec![
                    Pre::TipsLoaded { expected: false },
                    Pre::OnDeck { arg: tip_rack },
                    Pre::HasContent { arg: tip_rack },
                ],
                vec![E::LoadTips { from: tip_rack }],
            ),
        MethodEntry::new(
            lh,
            "drop_tips96",
            &[P::resource("resource"), P::optional("offset"), P::optional("allow_nonzero_volume")],
        )
        .open_keywords()
        .with_contract(
            "dropping tips",
            vec![Pre::TipsLoaded { expected: true }, Pre::OnDeck { arg: resource }],
            vec![E::DropTips { to: TipSink::Arg(resource) }],
        ),
        MethodEntry::new(
            lh,
            "aspirate96",
            &[
                P::resource("resource"),
                P::value("volume"),
                P::optional("offset"),
                P::optional("flow_rate"),
                P::optional("blow_out_air_volume"),
            ],
        )
        .open_keywords()
        .with_contract(
            "aspirating",
            aspirate_pre(resource, volume),
            vec![E::Aspirate { from: resource, volume }],
        ),
        MethodEntry::new(
            lh,
            "dispense96",
            &[
                P::resource("resource"),
                P::value("volume"),
                P::optional("offset"),
                P::optional("flow_rate"),
                P::optional("blow_out_air_volume"),
            ],
        )
        .open_keywords()
        .with_contract(
            "dispensing",
            dispense_pre(resource, volume),
            vec![E::Dispense { to: resource, volume }],
        ),
        MethodEntry::new(
            lh,
            "move_plate",
            &[P::resource("plate"), P::resource("to"), P::optional("intermediate_locations")],
        )
        .open_keywords()
        .with_contract(
            "moving the plate",
            vec![Pre::OnDeck { arg: plate }, Pre::OnDeck { arg: to }],
            vec![E::Move { arg: plate }],
        ),
        MethodEntry::new(
            lh,
            "move_resource",
            &[P::resource("resource"), P::resource("to"), P::optional("intermediate_locations")],
        )
        .open_keywords()
        .with_contract(
            "moving the resource",
            vec![Pre::OnDeck { arg: resource }, Pre::OnDeck { arg: to }],
            vec![E::Move { arg: resource }],
        ),
        MethodEntry::new(
            lh,
            "move_lid",
            &[P::resource("lid"), P::resource("to"), P::optional("intermediate_locations")],
        )
        .open_keywords()
        .with_contract(
            "moving the lid",
            vec![Pre::OnDeck { arg: lid }, Pre::OnDeck { arg: to }],
            vec![E::Move { arg: lid }],
        ),
    ]
}

fn deck() -> Vec<MethodEntry> {
    let deck = ResourceKind::Deck;
    let resource = ArgRef::new("resource", 0);
    vec![
        MethodEntry::new(
            deck,
            "assign_child_resource",
            &[P::resource("resource"), P::optional("location"), P::optional("reassign")],
        )
        .with_contract("placing the resource", Vec::new(), vec![E::Place { arg: resource }]),
        MethodEntry::new(deck, "unassign_child_resource", &[P::resource("resource")]).with_contract(
            "removing the resource",
            vec![Pre::OnDeck { arg: resource }],
            vec![E::Remove { arg: resource }],
        ),
    ]
}

// Plate readers and heater shakers are accepted but not modeled.

fn plate_reader() -> Vec<MethodEntry> {
    let pr = ResourceKind::PlateReader;
    vec![
        MethodEntry::new(pr, "setup", &[]).open_keywords(),
        MethodEntry::new(pr, "stop", &[]),
        MethodEntry::new(pr, "open", &[]),
        MethodEntry::new(pr, "close", &[P::optional_resource("plate")]),
        MethodEntry::new(pr, "read_absorbance", &[P::value("wavelength")]).open_keywords(),
        MethodEntry::new(
            pr,
            "read_fluorescence",
            &[
                P::value("excitation_wavelength"),
                P::value("emission_wavelength"),
                P::value("focal_height"),
            ],
        )
        .open_keywords(),
        MethodEntry::new(pr, "read_luminescence", &[P::value("focal_height")]).open_keywords(),
    ]
}

fn heater_shaker() -> Vec<MethodEntry> {
    let hs = ResourceKind::HeaterShaker;
    vec![
        MethodEntry::new(hs, "setup", &[]).open_keywords(),
        MethodEntry::new(hs, "stop", &[]),
        MethodEntry::new(hs, "set_temperature", &[P::value("temperature")]),
        MethodEntry::new(hs, "shake", &[P::value("speed")]).open_keywords(),
        MethodEntry::new(hs, "stop_shaking", &[]),
        MethodEntry::new(hs, "lock_plate", &[]),
        MethodEntry::new(hs, "unlock_plate", &[]),
    ]
}
