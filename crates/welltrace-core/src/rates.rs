//! Flow-rate profiles per tip type.
//!
//! The [`RateTable`] holds one [`FlowRateProfile`] per [`TipType`]. Profiles
//! are captured when an instrument is first wrapped and updated whenever a new
//! nominal rate is assigned through a tracked instrument. Effective rates are
//! the nominal rate scaled by an optional per-call multiplier.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Tip type reported for instruments whose tip racks carry no volume class.
pub const UNKNOWN_TIP_TYPE: &str = "unknown tip type";

/// Classification of a pipette tip by volume class, e.g. `p300`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TipType(String);

impl TipType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_TIP_TYPE.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_TIP_TYPE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the tip type from a tip-rack load name.
    ///
    /// The first underscore-separated token of the form `<N>ul` yields `p<N>`,
    /// so `opentrons_96_tiprack_300ul` becomes `p300`.
    pub fn from_rack_load_name(load_name: &str) -> Self {
        load_name
            .split('_')
            .filter_map(|part| part.strip_suffix("ul"))
            .find_map(|digits| digits.parse::<u32>().ok())
            .map(|volume| Self(format!("p{}", volume)))
            .unwrap_or_else(Self::unknown)
    }

    /// Derives the tip type from an instrument's tip racks. Only the first
    /// rack is considered.
    pub fn from_racks<S: AsRef<str>>(racks: &[S]) -> Self {
        racks
            .first()
            .map(|rack| Self::from_rack_load_name(rack.as_ref()))
            .unwrap_or_else(Self::unknown)
    }
}

impl fmt::Display for TipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which of the three nominal rates an action uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateKind {
    Aspirate,
    Dispense,
    BlowOut,
}

impl RateKind {
    pub fn name(&self) -> &'static str {
        match self {
            RateKind::Aspirate => "aspirate",
            RateKind::Dispense => "dispense",
            RateKind::BlowOut => "blow_out",
        }
    }
}

impl fmt::Display for RateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Nominal flow rates of an instrument, in µL/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowRateProfile {
    pub aspirate: f64,
    pub dispense: f64,
    pub blow_out: f64,
}

impl FlowRateProfile {
    pub fn get(&self, kind: RateKind) -> f64 {
        match kind {
            RateKind::Aspirate => self.aspirate,
            RateKind::Dispense => self.dispense,
            RateKind::BlowOut => self.blow_out,
        }
    }

    pub fn set(&mut self, kind: RateKind, value: f64) {
        match kind {
            RateKind::Aspirate => self.aspirate = value,
            RateKind::Dispense => self.dispense = value,
            RateKind::BlowOut => self.blow_out = value,
        }
    }
}

/// Returns true if `value` can be used as a nominal flow rate.
pub fn is_valid_rate(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Scales a nominal rate by an optional multiplier.
///
/// A missing or non-finite multiplier leaves the nominal rate unchanged.
pub fn effective_rate(nominal: f64, multiplier: Option<f64>) -> f64 {
    match multiplier {
        Some(m) if m.is_finite() => nominal * m,
        _ => nominal,
    }
}

/// Formats an optional rate for log messages.
pub fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:.2} µL/s", r),
        None => "unknown rate".to_string(),
    }
}

/// Flow-rate profiles keyed by tip type.
#[derive(Debug, Default, Clone)]
pub struct RateTable {
    profiles: HashMap<TipType, FlowRateProfile>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the nominal profile observed on an instrument.
    pub fn observe(&mut self, tip_type: &TipType, profile: FlowRateProfile) {
        self.profiles.insert(tip_type.clone(), profile);
    }

    /// Updates one rate of a tip type's profile.
    ///
    /// If the tip type has never been observed, `fallback` seeds its profile
    /// first. Returns `false` and leaves the table untouched for unusable
    /// values.
    pub fn update(
        &mut self,
        tip_type: &TipType,
        kind: RateKind,
        value: f64,
        fallback: FlowRateProfile,
    ) -> bool {
        if !is_valid_rate(value) {
            return false;
        }
        self.profiles
            .entry(tip_type.clone())
            .or_insert(fallback)
            .set(kind, value);
        true
    }

    pub fn profile(&self, tip_type: &TipType) -> Option<&FlowRateProfile> {
        self.profiles.get(tip_type)
    }

    /// Nominal rate for an action, or `None` if the tip type was never
    /// observed.
    pub fn resolve(&self, tip_type: &TipType, kind: RateKind) -> Option<f64> {
        self.profiles.get(tip_type).map(|p| p.get(kind))
    }

    /// Nominal rate scaled by the per-call multiplier.
    pub fn resolve_effective(
        &self,
        tip_type: &TipType,
        kind: RateKind,
        multiplier: Option<f64>,
    ) -> Option<f64> {
        self.resolve(tip_type, kind)
            .map(|nominal| effective_rate(nominal, multiplier))
    }
}
