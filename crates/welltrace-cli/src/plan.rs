//! Run plans: a JSON description of a deck and an ordered list of calls.
//!
//! ```json
//! {
//!   "name": "plate fill",
//!   "labware": [
//!     { "label": "plate", "load_name": "corning_96_wellplate_360ul_flat",
//!       "slot": "2", "rows": 8, "columns": 12 }
//!   ],
//!   "pipettes": [
//!     { "name": "p300_single_gen2", "tip_racks": ["opentrons_96_tiprack_300ul"] }
//!   ],
//!   "tracking": [{ "labware": "plate", "capacity": 360, "initial_volume": 0 }],
//!   "steps": [
//!     { "instrument": "p300_single_gen2", "call": "pick_up_tip" },
//!     { "instrument": "p300_single_gen2", "call": "dispense",
//!       "args": [100, "plate:A1"], "kwargs": { "rate": 0.5 } }
//!   ]
//! }
//! ```
//!
//! String arguments of the form `label:WELL` refer to a well of a declared
//! labware, `slot:N` to a bare deck slot, and `{"x":..,"y":..,"z":..}` to raw
//! deck coordinates. `set_flow_rate` takes the rates to assign as kwargs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use welltrace_core::driver::ModuleKind;
use welltrace_core::labware::{Labware, Location};
use welltrace_core::operation::{ArgValue, CallArgs, Operation};
use welltrace_core::rates::{FlowRateProfile, RateKind};

fn default_plan_name() -> String {
    "run".to_string()
}

/// A run plan as written on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct RunPlan {
    #[serde(default = "default_plan_name")]
    pub name: String,
    #[serde(default)]
    pub labware: Vec<LabwareDecl>,
    #[serde(default)]
    pub pipettes: Vec<PipetteDecl>,
    #[serde(default)]
    pub modules: Vec<ModuleDecl>,
    #[serde(default)]
    pub tracking: Vec<TrackingDecl>,
    #[serde(default)]
    pub steps: Vec<StepDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabwareDecl {
    pub label: String,
    pub load_name: String,
    #[serde(default)]
    pub slot: Option<String>,
    /// Name of the module the labware sits on.
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub rows: Option<u8>,
    #[serde(default)]
    pub columns: Option<u8>,
    /// Explicit well names; used instead of `rows` x `columns`.
    #[serde(default)]
    pub wells: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipetteDecl {
    pub name: String,
    #[serde(default)]
    pub mount: Option<String>,
    #[serde(default)]
    pub tip_racks: Vec<String>,
    #[serde(default)]
    pub flow_rates: Option<FlowRateProfile>,
    /// Simulated response time per command.
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleDecl {
    pub name: String,
    pub kind: ModuleKind,
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingDecl {
    pub labware: String,
    pub capacity: f64,
    #[serde(default)]
    pub initial_volume: f64,
    #[serde(default)]
    pub overrides: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDecl {
    /// Pipette or module name. Omitted for calls no instrument owns.
    #[serde(default)]
    pub instrument: Option<String>,
    pub call: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

/// Errors loading or resolving a plan.
#[derive(Debug)]
pub enum PlanError {
    Io { path: String, source: std::io::Error },
    Parse(serde_json::Error),
    Duplicate { kind: &'static str, name: String },
    UnknownLabware { step: Option<usize>, label: String },
    UnknownWell { label: String, well: String },
    UnknownInstrument { step: usize, name: String },
    InvalidStep { step: usize, message: String },
}

impl PlanError {
    pub fn is_io(&self) -> bool {
        matches!(self, PlanError::Io { .. })
    }

    fn step(step: usize, message: impl Into<String>) -> Self {
        PlanError::InvalidStep {
            step,
            message: message.into(),
        }
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Io { path, source } => write!(f, "Cannot read {}: {}", path, source),
            PlanError::Parse(e) => write!(f, "Invalid plan JSON: {}", e),
            PlanError::Duplicate { kind, name } => write!(f, "Duplicate {} '{}'", kind, name),
            PlanError::UnknownLabware { step: Some(step), label } => {
                write!(f, "Step {}: unknown labware '{}'", step, label)
            }
            PlanError::UnknownLabware { step: None, label } => {
                write!(f, "Unknown labware '{}'", label)
            }
            PlanError::UnknownWell { label, well } => {
                write!(f, "Labware '{}' has no well '{}'", label, well)
            }
            PlanError::UnknownInstrument { step, name } => {
                write!(f, "Step {}: unknown instrument '{}'", step, name)
            }
            PlanError::InvalidStep { step, message } => write!(f, "Step {}: {}", step, message),
        }
    }
}

impl std::error::Error for PlanError {}

/// Who a resolved step is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Pipette(String),
    Module(String),
    Unbound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Call(Operation),
    SetFlowRate(Vec<(RateKind, f64)>),
}

/// A step with its target and arguments resolved. `index` is 1-based.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub index: usize,
    pub target: Target,
    pub action: Action,
}

impl Step {
    pub fn call_name(&self) -> &str {
        match &self.action {
            Action::Call(op) => op.name(),
            Action::SetFlowRate(_) => "set_flow_rate",
        }
    }
}

/// A plan whose names have all been resolved against its deck.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub name: String,
    pub labware: BTreeMap<String, Labware>,
    pub pipettes: Vec<PipetteDecl>,
    pub modules: Vec<ModuleDecl>,
    pub tracking: Vec<TrackingDecl>,
    pub steps: Vec<Step>,
}

impl RunPlan {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        serde_json::from_str(json).map_err(PlanError::Parse)
    }

    /// Builds labware and checks every step against the deck.
    pub fn resolve(self) -> Result<ResolvedPlan, PlanError> {
        let mut labware = BTreeMap::new();
        for decl in &self.labware {
            if labware.contains_key(&decl.label) {
                return Err(PlanError::Duplicate {
                    kind: "labware",
                    name: decl.label.clone(),
                });
            }
            labware.insert(decl.label.clone(), build_labware(decl));
        }

        let mut instruments: HashMap<&str, bool> = HashMap::new();
        for pipette in &self.pipettes {
            if instruments.insert(&pipette.name, true).is_some() {
                return Err(PlanError::Duplicate {
                    kind: "instrument",
                    name: pipette.name.clone(),
                });
            }
        }
        for module in &self.modules {
            if instruments.insert(&module.name, false).is_some() {
                return Err(PlanError::Duplicate {
                    kind: "instrument",
                    name: module.name.clone(),
                });
            }
        }

        for tracking in &self.tracking {
            if !labware.contains_key(&tracking.labware) {
                return Err(PlanError::UnknownLabware {
                    step: None,
                    label: tracking.labware.clone(),
                });
            }
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for (i, decl) in self.steps.iter().enumerate() {
            let index = i + 1;
            let target = match decl.instrument.as_deref() {
                None => Target::Unbound,
                Some(name) => match instruments.get(name) {
                    Some(true) => Target::Pipette(name.to_string()),
                    Some(false) => Target::Module(name.to_string()),
                    None => {
                        return Err(PlanError::UnknownInstrument {
                            step: index,
                            name: name.to_string(),
                        })
                    }
                },
            };
            let action = resolve_action(index, decl, &labware)?;
            check_target(index, &target, &action)?;
            steps.push(Step {
                index,
                target,
                action,
            });
        }

        Ok(ResolvedPlan {
            name: self.name,
            labware,
            pipettes: self.pipettes,
            modules: self.modules,
            tracking: self.tracking,
            steps,
        })
    }
}

fn build_labware(decl: &LabwareDecl) -> Labware {
    let labware = match &decl.wells {
        Some(wells) => Labware::new(&decl.load_name, &decl.label, decl.slot.clone(), wells.clone()),
        None => {
            let mut grid = Labware::grid(
                &decl.load_name,
                &decl.label,
                decl.slot.clone().unwrap_or_default(),
                decl.rows.unwrap_or(8),
                decl.columns.unwrap_or(12),
            );
            grid.slot = decl.slot.clone();
            grid
        }
    };
    match &decl.module {
        Some(module) => labware.on_module(module),
        None => labware,
    }
}

fn resolve_action(
    step: usize,
    decl: &StepDecl,
    labware: &BTreeMap<String, Labware>,
) -> Result<Action, PlanError> {
    if decl.call == "set_flow_rate" {
        return resolve_flow_rates(step, decl);
    }
    let mut args = CallArgs::new();
    for value in &decl.args {
        args = args.arg(to_arg(step, value, labware)?);
    }
    for (name, value) in &decl.kwargs {
        args = args.named(name, to_arg(step, value, labware)?);
    }
    let op = Operation::from_call(&decl.call, &args)
        .map_err(|e| PlanError::step(step, e.to_string()))?;
    match &op {
        Operation::Aspirate { location: None, .. } | Operation::Dispense { location: None, .. } => {
            Err(PlanError::step(step, format!("{} requires a location", op.name())))
        }
        _ => Ok(Action::Call(op)),
    }
}

fn resolve_flow_rates(step: usize, decl: &StepDecl) -> Result<Action, PlanError> {
    if decl.kwargs.is_empty() {
        return Err(PlanError::step(
            step,
            "set_flow_rate needs at least one of aspirate, dispense, blow_out",
        ));
    }
    let mut rates = Vec::new();
    for (name, value) in &decl.kwargs {
        let kind = match name.as_str() {
            "aspirate" => RateKind::Aspirate,
            "dispense" => RateKind::Dispense,
            "blow_out" => RateKind::BlowOut,
            other => {
                return Err(PlanError::step(step, format!("unknown flow rate '{}'", other)));
            }
        };
        let value = value
            .as_f64()
            .ok_or_else(|| PlanError::step(step, format!("{} flow rate must be a number", name)))?;
        rates.push((kind, value));
    }
    Ok(Action::SetFlowRate(rates))
}

fn check_target(step: usize, target: &Target, action: &Action) -> Result<(), PlanError> {
    let name = match action {
        Action::Call(op) => op.name(),
        Action::SetFlowRate(_) => "set_flow_rate",
    };
    let pipette_only = match action {
        Action::Call(Operation::Other { .. }) => return Ok(()),
        Action::Call(op) => op.is_pipetting(),
        Action::SetFlowRate(_) => true,
    };
    match target {
        Target::Module(module) if pipette_only => Err(PlanError::step(
            step,
            format!("{} is not a module operation ({})", name, module),
        )),
        Target::Pipette(pipette) if !pipette_only => Err(PlanError::step(
            step,
            format!("{} is not a pipette operation ({})", name, pipette),
        )),
        Target::Unbound if matches!(action, Action::SetFlowRate(_)) => Err(PlanError::step(
            step,
            "set_flow_rate needs an instrument",
        )),
        _ => Ok(()),
    }
}

fn to_arg(
    step: usize,
    value: &Value,
    labware: &BTreeMap<String, Labware>,
) -> Result<ArgValue, PlanError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(ArgValue::Number)
            .ok_or_else(|| PlanError::step(step, format!("unsupported number {}", n))),
        Value::Bool(b) => Ok(ArgValue::Bool(*b)),
        Value::String(s) => match s.split_once(':') {
            Some(("slot", slot)) => Ok(ArgValue::Location(Location::slot(slot))),
            Some((label, well)) => {
                let lw = labware.get(label).ok_or_else(|| PlanError::UnknownLabware {
                    step: Some(step),
                    label: label.to_string(),
                })?;
                lw.well(well)
                    .map(ArgValue::Location)
                    .ok_or_else(|| PlanError::UnknownWell {
                        label: label.to_string(),
                        well: well.to_string(),
                    })
            }
            None => Ok(ArgValue::Text(s.clone())),
        },
        Value::Object(map) => {
            let coord = |axis: &str| map.get(axis).and_then(Value::as_f64);
            match (coord("x"), coord("y"), coord("z")) {
                (Some(x), Some(y), Some(z)) => Ok(ArgValue::Location(Location::point(x, y, z))),
                _ => Err(PlanError::step(step, "coordinates need numeric x, y and z")),
            }
        }
        Value::Null | Value::Array(_) => Err(PlanError::step(
            step,
            format!("unsupported argument {}", value),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"{
        "name": "fill",
        "labware": [
            { "label": "plate", "load_name": "corning_96_wellplate_360ul_flat", "slot": "2" },
            { "label": "tc_plate", "load_name": "nest_96_wellplate_100ul_pcr_full_skirt",
              "slot": "7", "module": "thermocycler" }
        ],
        "pipettes": [{ "name": "p300_single_gen2", "tip_racks": ["opentrons_96_tiprack_300ul"] }],
        "modules": [{ "name": "thermocycler", "kind": "thermocycler" }],
        "tracking": [{ "labware": "plate", "capacity": 360 }],
        "steps": [
            { "instrument": "p300_single_gen2", "call": "pick_up_tip" },
            { "instrument": "p300_single_gen2", "call": "dispense",
              "args": [50, "plate:A1"], "kwargs": { "rate": 0.5 } },
            { "instrument": "p300_single_gen2", "call": "set_flow_rate",
              "kwargs": { "aspirate": 150 } },
            { "instrument": "thermocycler", "call": "set_block_temperature",
              "args": [4], "kwargs": { "hold_time_seconds": 60 } },
            { "call": "aspirate", "args": [10, "tc_plate:B3"] }
        ]
    }"#;

    #[test]
    fn resolves_steps_against_deck() {
        let plan = RunPlan::from_json(PLAN).unwrap().resolve().unwrap();
        assert_eq!(plan.steps.len(), 5);
        assert_eq!(plan.labware["plate"].wells().len(), 96);

        match &plan.steps[1].action {
            Action::Call(Operation::Dispense { volume, location, rate }) => {
                assert_eq!(*volume, 50.0);
                assert_eq!(*rate, Some(0.5));
                assert_eq!(location.as_ref().unwrap().to_string(), "A1 of plate (slot 2)");
            }
            other => panic!("Expected Dispense, got {:?}", other),
        }
        assert_eq!(
            plan.steps[2].action,
            Action::SetFlowRate(vec![(RateKind::Aspirate, 150.0)])
        );
        assert_eq!(plan.steps[3].target, Target::Module("thermocycler".to_string()));
        assert_eq!(plan.steps[4].target, Target::Unbound);
        match &plan.steps[4].action {
            Action::Call(Operation::Aspirate { location: Some(l), .. }) => {
                assert_eq!(l.to_string(), "B3 of tc_plate on thermocycler (slot 7)");
            }
            other => panic!("Expected Aspirate, got {:?}", other),
        }
    }

    #[test]
    fn unknown_names_are_plan_errors() {
        let plan = r#"{ "steps": [{ "instrument": "p1000", "call": "pick_up_tip" }] }"#;
        let err = RunPlan::from_json(plan).unwrap().resolve().unwrap_err();
        assert!(matches!(err, PlanError::UnknownInstrument { step: 1, .. }));

        let plan = r#"{
            "pipettes": [{ "name": "p20", "tip_racks": [] }],
            "steps": [{ "instrument": "p20", "call": "aspirate", "args": [5, "reservoir:A1"] }]
        }"#;
        let err = RunPlan::from_json(plan).unwrap().resolve().unwrap_err();
        assert_eq!(err.to_string(), "Step 1: unknown labware 'reservoir'");
    }

    #[test]
    fn operations_must_match_instrument_type() {
        let plan = r#"{
            "pipettes": [{ "name": "p20", "tip_racks": [] }],
            "modules": [{ "name": "magdeck", "kind": "magnetic" }],
            "steps": [{ "instrument": "magdeck", "call": "pick_up_tip" }]
        }"#;
        let err = RunPlan::from_json(plan).unwrap().resolve().unwrap_err();
        assert!(err.to_string().contains("not a module operation"));

        let plan = r#"{
            "pipettes": [{ "name": "p20", "tip_racks": [] }],
            "steps": [{ "instrument": "p20", "call": "engage" }]
        }"#;
        let err = RunPlan::from_json(plan).unwrap().resolve().unwrap_err();
        assert!(err.to_string().contains("not a pipette operation"));
    }

    #[test]
    fn aspirate_needs_location_and_volume() {
        let plan = r#"{
            "pipettes": [{ "name": "p20", "tip_racks": [] }],
            "steps": [{ "instrument": "p20", "call": "aspirate", "args": [5] }]
        }"#;
        let err = RunPlan::from_json(plan).unwrap().resolve().unwrap_err();
        assert_eq!(err.to_string(), "Step 1: aspirate requires a location");

        let plan = r#"{
            "labware": [{ "label": "plate", "load_name": "x", "rows": 1, "columns": 1 }],
            "pipettes": [{ "name": "p20", "tip_racks": [] }],
            "steps": [{ "instrument": "p20", "call": "dispense", "kwargs": { "location": "plate:A1" } }]
        }"#;
        let err = RunPlan::from_json(plan).unwrap().resolve().unwrap_err();
        assert!(err.to_string().contains("missing required argument 'volume'"));
    }

    #[test]
    fn slot_and_coordinate_arguments() {
        let labware = BTreeMap::new();
        let slot = to_arg(1, &serde_json::json!("slot:12"), &labware).unwrap();
        assert_eq!(slot, ArgValue::Location(Location::slot("12")));
        let point = to_arg(1, &serde_json::json!({"x": 1, "y": 2.5, "z": 3}), &labware).unwrap();
        assert_eq!(point.to_string(), "custom coordinates (x=1, y=2.5, z=3)");
        assert_eq!(
            to_arg(1, &serde_json::json!("slow"), &labware).unwrap(),
            ArgValue::Text("slow".to_string())
        );
        assert!(to_arg(1, &serde_json::json!(null), &labware).is_err());
    }
}
