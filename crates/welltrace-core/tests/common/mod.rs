//! Shared test helpers for welltrace-core integration tests.
//!
//! Provides deck fixtures, simulated instruments wired to a tracker, and a
//! scripted driver whose every command fails.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use welltrace_core::driver::{DriverError, PipetteDriver};
use welltrace_core::instrument::TrackedPipette;
use welltrace_core::labware::{Labware, Location};
use welltrace_core::log::{LogLevel, MemorySink};
use welltrace_core::rates::{FlowRateProfile, RateKind};
use welltrace_core::sim::SimulatedPipette;
use welltrace_core::tracker::Tracker;

// ---------------------------------------------------------------------------
// Deck fixtures
// ---------------------------------------------------------------------------

pub fn plate() -> Labware {
    Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12)
}

pub fn reservoir() -> Labware {
    Labware::new(
        "nest_12_reservoir_15ml",
        "reservoir",
        Some("1".to_string()),
        (1..=12).map(|i| format!("A{}", i)).collect(),
    )
}

pub fn p300_sim() -> SimulatedPipette {
    SimulatedPipette::new(
        "p300_single_gen2",
        vec!["opentrons_96_tiprack_300ul".to_string()],
    )
}

pub fn p20_sim() -> SimulatedPipette {
    SimulatedPipette::new(
        "p20_single_gen2",
        vec!["opentrons_96_tiprack_20ul".to_string()],
    )
}

// ---------------------------------------------------------------------------
// Tracker harness
// ---------------------------------------------------------------------------

/// A tracker with a memory sink attached, plus a wrapped p300 and a plate
/// configured to `capacity` / `initial`.
pub struct Bench {
    pub tracker: Arc<Tracker>,
    pub sink: Arc<MemorySink>,
    pub p300: TrackedPipette<SimulatedPipette>,
    pub plate: Labware,
}

impl Bench {
    pub fn new(capacity: f64, initial: f64) -> Self {
        let sink = Arc::new(MemorySink::new());
        let tracker = Tracker::with_sinks(vec![Box::new(sink.clone())]);
        let plate = plate();
        tracker.configure_well_tracking(&plate, capacity, initial, &HashMap::new());
        let p300 = tracker.wrap_instrument(p300_sim());
        Self {
            tracker,
            sink,
            p300,
            plate,
        }
    }

    pub fn well(&self, name: &str) -> Location {
        self.plate
            .well(name)
            .unwrap_or_else(|| panic!("plate has no well {}", name))
    }

    pub fn volume(&self, name: &str) -> f64 {
        self.tracker.well_volume(&self.well(name)).unwrap()
    }

    /// Messages of all entries at `level`, in order.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.tracker
            .get_logs()
            .into_iter()
            .filter(|e| e.level == level)
            .map(|e| e.message)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Failing driver
// ---------------------------------------------------------------------------

/// A pipette whose device rejects every command.
pub struct JammedPipette;

fn jammed() -> DriverError {
    DriverError::CommandFailed("plunger jammed".to_string())
}

#[async_trait]
impl PipetteDriver for JammedPipette {
    fn name(&self) -> &str {
        "p300_jammed"
    }

    fn tip_rack_load_names(&self) -> Vec<String> {
        vec!["opentrons_96_tiprack_300ul".to_string()]
    }

    fn flow_rates(&self) -> FlowRateProfile {
        FlowRateProfile {
            aspirate: 50.0,
            dispense: 50.0,
            blow_out: 50.0,
        }
    }

    async fn set_flow_rate(&self, _kind: RateKind, _value: f64) -> Result<(), DriverError> {
        Err(jammed())
    }

    async fn aspirate(&self, _: f64, _: &Location, _: Option<f64>) -> Result<(), DriverError> {
        Err(jammed())
    }

    async fn dispense(&self, _: f64, _: &Location, _: Option<f64>) -> Result<(), DriverError> {
        Err(jammed())
    }

    async fn mix(
        &self,
        _: u32,
        _: f64,
        _: Option<&Location>,
        _: Option<f64>,
    ) -> Result<(), DriverError> {
        Err(jammed())
    }

    async fn blow_out(&self, _: Option<&Location>, _: Option<f64>) -> Result<(), DriverError> {
        Err(jammed())
    }

    async fn pick_up_tip(&self) -> Result<(), DriverError> {
        Err(jammed())
    }

    async fn drop_tip(&self) -> Result<(), DriverError> {
        Err(jammed())
    }
}
