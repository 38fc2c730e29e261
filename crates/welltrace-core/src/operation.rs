//! The closed set of instrument and module operations the tracker understands.
//!
//! Wrappers build an [`Operation`] from their typed method arguments. Hosts
//! that dispatch by name (script runners, the run-plan CLI) can build one from
//! a name and loosely typed [`CallArgs`] with [`Operation::from_call`].
//! Anything unrecognized becomes [`Operation::Other`], which the tracker logs
//! generically and forwards.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::labware::Location;

/// A single argument value in a by-name call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Location(Location),
}

impl ArgValue {
    /// Numeric value, if this argument is a finite number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ArgValue::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }

    pub fn as_location(&self) -> Option<&Location> {
        match self {
            ArgValue::Location(location) => Some(location),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Number(n) => write!(f, "{}", n),
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Text(s) => write!(f, "{:?}", s),
            ArgValue::Location(l) => write!(f, "{}", l),
        }
    }
}

/// Positional and named arguments of a by-name call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub positional: Vec<ArgValue>,
    #[serde(default)]
    pub named: BTreeMap<String, ArgValue>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: ArgValue) -> Self {
        self.positional.push(value);
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.named.insert(name.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Looks up a parameter by name, falling back to its position. A named
    /// argument wins when both are present.
    pub fn get(&self, name: &str, position: Option<usize>) -> Option<&ArgValue> {
        self.named
            .get(name)
            .or_else(|| position.and_then(|i| self.positional.get(i)))
    }

    fn number(&self, name: &str, position: Option<usize>) -> Option<f64> {
        self.get(name, position).and_then(ArgValue::as_number)
    }

    fn location(&self, name: &str, position: Option<usize>) -> Option<Location> {
        self.get(name, position)
            .and_then(ArgValue::as_location)
            .cloned()
    }

    fn required_number(
        &self,
        operation: &str,
        name: &'static str,
        position: Option<usize>,
    ) -> Result<f64, CallError> {
        match self.get(name, position) {
            None => Err(CallError::MissingArgument {
                operation: operation.to_string(),
                argument: name,
            }),
            Some(value) => value.as_number().ok_or_else(|| CallError::InvalidArgument {
                operation: operation.to_string(),
                argument: name,
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.positional.iter().map(ToString::to_string).collect();
        parts.extend(self.named.iter().map(|(k, v)| format!("{}={}", k, v)));
        write!(f, "({})", parts.join(", "))
    }
}

/// Errors building an [`Operation`] from a by-name call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("{operation}: missing required argument '{argument}'")]
    MissingArgument {
        operation: String,
        argument: &'static str,
    },

    #[error("{operation}: argument '{argument}' must be a number, got {value}")]
    InvalidArgument {
        operation: String,
        argument: &'static str,
        value: String,
    },
}

/// An operation issued to a pipette or module.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Aspirate {
        volume: f64,
        location: Option<Location>,
        rate: Option<f64>,
    },
    Dispense {
        volume: f64,
        location: Option<Location>,
        rate: Option<f64>,
    },
    Mix {
        repetitions: u32,
        volume: f64,
        location: Option<Location>,
        rate: Option<f64>,
    },
    BlowOut {
        location: Option<Location>,
        rate: Option<f64>,
    },
    PickUpTip,
    DropTip,
    SetBlockTemperature {
        temperature: f64,
        hold_time: Option<f64>,
    },
    SetLidTemperature {
        temperature: f64,
    },
    OpenLid,
    CloseLid,
    Engage {
        height_from_base: Option<f64>,
    },
    Disengage,
    /// Anything without a dedicated handler.
    Other { name: String, args: CallArgs },
}

impl Operation {
    /// Short, static-ish name of the operation for spans and messages.
    pub fn name(&self) -> &str {
        match self {
            Operation::Aspirate { .. } => "aspirate",
            Operation::Dispense { .. } => "dispense",
            Operation::Mix { .. } => "mix",
            Operation::BlowOut { .. } => "blow_out",
            Operation::PickUpTip => "pick_up_tip",
            Operation::DropTip => "drop_tip",
            Operation::SetBlockTemperature { .. } => "set_block_temperature",
            Operation::SetLidTemperature { .. } => "set_lid_temperature",
            Operation::OpenLid => "open_lid",
            Operation::CloseLid => "close_lid",
            Operation::Engage { .. } => "engage",
            Operation::Disengage => "disengage",
            Operation::Other { name, .. } => name.as_str(),
        }
    }

    /// True for operations a pipette performs; false for module operations.
    pub fn is_pipetting(&self) -> bool {
        matches!(
            self,
            Operation::Aspirate { .. }
                | Operation::Dispense { .. }
                | Operation::Mix { .. }
                | Operation::BlowOut { .. }
                | Operation::PickUpTip
                | Operation::DropTip
        )
    }

    /// Builds an operation from a name and by-name arguments.
    ///
    /// Positional layouts follow the instrument methods: `aspirate(volume,
    /// location, rate)`, `mix(repetitions, volume, location, rate)`,
    /// `blow_out(location)`, `set_block_temperature(temperature, hold_time)`,
    /// `engage(height_from_base)`. A rate that is not a number is treated as
    /// absent.
    pub fn from_call(name: &str, args: &CallArgs) -> Result<Self, CallError> {
        let op = match name {
            "aspirate" => Operation::Aspirate {
                volume: args.required_number(name, "volume", Some(0))?,
                location: args.location("location", Some(1)),
                rate: args.number("rate", Some(2)),
            },
            "dispense" => Operation::Dispense {
                volume: args.required_number(name, "volume", Some(0))?,
                location: args.location("location", Some(1)),
                rate: args.number("rate", Some(2)),
            },
            "mix" => Operation::Mix {
                repetitions: args
                    .number("repetitions", Some(0))
                    .map(|n| n.max(0.0).round() as u32)
                    .unwrap_or(1),
                volume: args.required_number(name, "volume", Some(1))?,
                location: args.location("location", Some(2)),
                rate: args.number("rate", Some(3)),
            },
            "blow_out" => Operation::BlowOut {
                location: args.location("location", Some(0)),
                rate: args.number("rate", None),
            },
            "pick_up_tip" => Operation::PickUpTip,
            "drop_tip" => Operation::DropTip,
            "set_block_temperature" => Operation::SetBlockTemperature {
                temperature: args.required_number(name, "temperature", Some(0))?,
                hold_time: args
                    .number("hold_time_seconds", None)
                    .or_else(|| args.number("hold_time", Some(1))),
            },
            "set_lid_temperature" => Operation::SetLidTemperature {
                temperature: args.required_number(name, "temperature", Some(0))?,
            },
            "open_lid" => Operation::OpenLid,
            "close_lid" => Operation::CloseLid,
            "engage" => Operation::Engage {
                height_from_base: args.number("height_from_base", Some(0)),
            },
            "disengage" => Operation::Disengage,
            other => Operation::Other {
                name: other.to_string(),
                args: args.clone(),
            },
        };
        Ok(op)
    }

    /// By-name arguments equivalent to this operation. Every parameter is
    /// passed by name, so [`Operation::from_call`] reads the same values back.
    pub fn call_args(&self) -> CallArgs {
        let number = |args: CallArgs, name: &str, value: Option<f64>| match value {
            Some(v) => args.named(name, ArgValue::Number(v)),
            None => args,
        };
        let location = |args: CallArgs, value: &Option<Location>| match value {
            Some(l) => args.named("location", ArgValue::Location(l.clone())),
            None => args,
        };
        match self {
            Operation::Aspirate { volume, location: l, rate }
            | Operation::Dispense { volume, location: l, rate } => {
                let args = number(CallArgs::new(), "volume", Some(*volume));
                number(location(args, l), "rate", *rate)
            }
            Operation::Mix { repetitions, volume, location: l, rate } => {
                let args = number(CallArgs::new(), "repetitions", Some(f64::from(*repetitions)));
                let args = number(args, "volume", Some(*volume));
                number(location(args, l), "rate", *rate)
            }
            Operation::BlowOut { location: l, rate } => number(location(CallArgs::new(), l), "rate", *rate),
            Operation::SetBlockTemperature { temperature, hold_time } => {
                let args = number(CallArgs::new(), "temperature", Some(*temperature));
                number(args, "hold_time", *hold_time)
            }
            Operation::SetLidTemperature { temperature } => {
                number(CallArgs::new(), "temperature", Some(*temperature))
            }
            Operation::Engage { height_from_base } => {
                number(CallArgs::new(), "height_from_base", *height_from_base)
            }
            Operation::PickUpTip
            | Operation::DropTip
            | Operation::OpenLid
            | Operation::CloseLid
            | Operation::Disengage => CallArgs::new(),
            Operation::Other { args, .. } => args.clone(),
        }
    }
}

/// `touch_tip` → `Touch tip`
pub(crate) fn humanize(name: &str) -> String {
    let spaced = name.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
