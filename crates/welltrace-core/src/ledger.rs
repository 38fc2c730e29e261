//! Simulated per-well volume accounting.
//!
//! The [`WellLedger`] never rejects an operation. Aspirates take at most what
//! a well holds and dispenses stop at capacity; the returned outcome says
//! whether clamping happened so the caller can report it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::labware::{Labware, WellKey};

/// Capacity and current volume of one well, in µL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WellState {
    pub capacity: f64,
    pub current_volume: f64,
}

impl Default for WellState {
    fn default() -> Self {
        Self {
            capacity: f64::INFINITY,
            current_volume: 0.0,
        }
    }
}

/// Result of an aspirate against the ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AspirateOutcome {
    pub requested: f64,
    pub available: f64,
    pub aspirated: f64,
    pub remaining: f64,
}

impl AspirateOutcome {
    pub fn is_shortfall(&self) -> bool {
        self.available < self.requested
    }
}

/// Result of a dispense against the ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispenseOutcome {
    pub requested: f64,
    pub dispensed: f64,
    pub total: f64,
    pub capacity: f64,
    /// Volume the well would hold without clamping.
    pub unclamped_total: f64,
}

impl DispenseOutcome {
    pub fn is_overflow(&self) -> bool {
        self.unclamped_total > self.capacity
    }
}

/// What [`WellLedger::configure`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigureReport {
    pub wells: usize,
    /// Wells whose existing capacity differed from the requested one and was
    /// kept.
    pub capacity_kept: Vec<String>,
}

/// Clamps a requested amount to a usable volume: negative values and NaN
/// move nothing.
fn usable(volume: f64) -> f64 {
    if volume.is_nan() {
        0.0
    } else {
        volume.max(0.0)
    }
}

/// Per-well capacity and volume for one run.
#[derive(Debug, Default, Clone)]
pub struct WellLedger {
    wells: HashMap<WellKey, WellState>,
}

impl WellLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds every well of `labware` with `capacity` and a starting volume.
    ///
    /// `overrides` maps well names to starting volumes and takes precedence
    /// over `initial_volume`. A capacity, once set, is never changed.
    pub fn configure(
        &mut self,
        labware: &Labware,
        capacity: f64,
        initial_volume: f64,
        overrides: &HashMap<String, f64>,
    ) -> ConfigureReport {
        let capacity = if capacity.is_nan() {
            f64::INFINITY
        } else {
            capacity.max(0.0)
        };
        let mut report = ConfigureReport::default();
        for well in labware.wells() {
            let volume = usable(overrides.get(well).copied().unwrap_or(initial_volume));
            let key = labware.well_key(well);
            match self.wells.get_mut(&key) {
                Some(state) => {
                    if state.capacity != capacity {
                        report.capacity_kept.push(well.clone());
                    }
                    state.current_volume = volume.min(state.capacity);
                }
                None => {
                    self.wells.insert(
                        key,
                        WellState {
                            capacity,
                            current_volume: volume.min(capacity),
                        },
                    );
                }
            }
            report.wells += 1;
        }
        report
    }

    /// State of a well. Wells never configured report the default state.
    pub fn state(&self, key: &WellKey) -> WellState {
        self.wells.get(key).copied().unwrap_or_default()
    }

    pub fn volume(&self, key: &WellKey) -> f64 {
        self.state(key).current_volume
    }

    pub fn is_tracked(&self, key: &WellKey) -> bool {
        self.wells.contains_key(key)
    }

    /// Withdraws up to `volume` from a well. Negative or NaN requests
    /// withdraw nothing.
    pub fn aspirate(&mut self, key: &WellKey, volume: f64) -> AspirateOutcome {
        let volume = usable(volume);
        let state = self.wells.entry(key.clone()).or_default();
        let available = state.current_volume;
        let aspirated = available.min(volume);
        state.current_volume = (available - aspirated).max(0.0);
        AspirateOutcome {
            requested: volume,
            available,
            aspirated,
            remaining: state.current_volume,
        }
    }

    /// Deposits `volume` into a well, stopping at capacity. Negative or NaN
    /// requests deposit nothing.
    pub fn dispense(&mut self, key: &WellKey, volume: f64) -> DispenseOutcome {
        let volume = usable(volume);
        let state = self.wells.entry(key.clone()).or_default();
        let current = state.current_volume;
        let capacity = state.capacity;
        let unclamped_total = current + volume;
        let dispensed = volume.min(capacity - current);
        state.current_volume = unclamped_total.min(capacity);
        DispenseOutcome {
            requested: volume,
            dispensed,
            total: state.current_volume,
            capacity,
            unclamped_total,
        }
    }

    pub fn len(&self) -> usize {
        self.wells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wells.is_empty()
    }
}
