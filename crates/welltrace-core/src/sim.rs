//! In-memory instrument backend.
//!
//! [`SimulatedPipette`] and [`SimulatedModule`] implement the driver traits
//! without hardware. They enforce the same basic preconditions a robot would
//! (a tip must be attached to move liquid, temperatures must be in range) and
//! keep a human-readable run log of every command they accepted.
//!
//! The run log is the backend's own account of what happened and is separate
//! from the tracker's log. An optional per-command latency makes the backend
//! behave like a device that takes time to respond.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{DriverError, ModuleDriver, ModuleKind, PipetteDriver};
use crate::labware::Location;
use crate::operation::CallArgs;
use crate::rates::{is_valid_rate, FlowRateProfile, RateKind};

/// Default nominal flow rates for a pipette model, in µL/s.
///
/// Models are recognized by their volume class prefix (`p20_`, `p300_`,
/// `p1000_`); anything else gets the p300 defaults.
pub fn default_flow_rates(model: &str) -> FlowRateProfile {
    let rate = if model.starts_with("p20_") {
        7.56
    } else if model.starts_with("p1000_") {
        274.7
    } else {
        92.86
    };
    FlowRateProfile {
        aspirate: rate,
        dispense: rate,
        blow_out: rate,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn check_volume(volume: f64) -> Result<(), DriverError> {
    if volume.is_finite() && volume >= 0.0 {
        Ok(())
    } else {
        Err(DriverError::InvalidArgument(format!(
            "volume must be a non-negative number, got {}",
            volume
        )))
    }
}

#[derive(Debug)]
struct PipetteState {
    flow_rates: FlowRateProfile,
    has_tip: bool,
    commands: Vec<String>,
}

/// A pipette that only keeps state in memory.
#[derive(Debug)]
pub struct SimulatedPipette {
    name: String,
    tip_racks: Vec<String>,
    latency: Duration,
    state: Mutex<PipetteState>,
}

impl SimulatedPipette {
    /// Creates a pipette with the default flow rates for its model.
    pub fn new(name: impl Into<String>, tip_racks: Vec<String>) -> Self {
        let name = name.into();
        let flow_rates = default_flow_rates(&name);
        Self::with_flow_rates(name, tip_racks, flow_rates)
    }

    pub fn with_flow_rates(
        name: impl Into<String>,
        tip_racks: Vec<String>,
        flow_rates: FlowRateProfile,
    ) -> Self {
        Self {
            name: name.into(),
            tip_racks,
            latency: Duration::ZERO,
            state: Mutex::new(PipetteState {
                flow_rates,
                has_tip: false,
                commands: Vec::new(),
            }),
        }
    }

    /// Delays every command by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn has_tip(&self) -> bool {
        lock(&self.state).has_tip
    }

    /// Commands accepted so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Runs `record` against the state if a tip is attached.
    fn with_tip(
        &self,
        operation: &str,
        record: impl FnOnce(&PipetteState) -> String,
    ) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        if !state.has_tip {
            return Err(DriverError::CommandFailed(format!(
                "Cannot {} without a tip attached to {}",
                operation, self.name
            )));
        }
        let line = record(&state);
        state.commands.push(line);
        Ok(())
    }
}

async fn settle(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

fn scaled(nominal: f64, rate: Option<f64>) -> f64 {
    nominal * rate.filter(|r| r.is_finite()).unwrap_or(1.0)
}

#[async_trait]
impl PipetteDriver for SimulatedPipette {
    fn name(&self) -> &str {
        &self.name
    }

    fn tip_rack_load_names(&self) -> Vec<String> {
        self.tip_racks.clone()
    }

    fn flow_rates(&self) -> FlowRateProfile {
        lock(&self.state).flow_rates
    }

    async fn set_flow_rate(&self, kind: RateKind, value: f64) -> Result<(), DriverError> {
        settle(self.latency).await;
        if !is_valid_rate(value) {
            return Err(DriverError::InvalidArgument(format!(
                "{} flow rate must be positive, got {}",
                kind, value
            )));
        }
        let mut state = lock(&self.state);
        state.flow_rates.set(kind, value);
        state
            .commands
            .push(format!("Setting {} flow rate to {} uL/sec", kind, value));
        Ok(())
    }

    async fn aspirate(
        &self,
        volume: f64,
        location: &Location,
        rate: Option<f64>,
    ) -> Result<(), DriverError> {
        settle(self.latency).await;
        check_volume(volume)?;
        self.with_tip("aspirate", |state| {
            format!(
                "Aspirating {} uL from {} at {:.2} uL/sec",
                volume,
                location,
                scaled(state.flow_rates.aspirate, rate)
            )
        })
    }

    async fn dispense(
        &self,
        volume: f64,
        location: &Location,
        rate: Option<f64>,
    ) -> Result<(), DriverError> {
        settle(self.latency).await;
        check_volume(volume)?;
        self.with_tip("dispense", |state| {
            format!(
                "Dispensing {} uL into {} at {:.2} uL/sec",
                volume,
                location,
                scaled(state.flow_rates.dispense, rate)
            )
        })
    }

    async fn mix(
        &self,
        repetitions: u32,
        volume: f64,
        location: Option<&Location>,
        rate: Option<f64>,
    ) -> Result<(), DriverError> {
        settle(self.latency).await;
        check_volume(volume)?;
        let place = location
            .map(ToString::to_string)
            .unwrap_or_else(|| "current position".to_string());
        self.with_tip("mix", |state| {
            format!(
                "Mixing {} times with a volume of {} uL in {} at {:.2} uL/sec",
                repetitions,
                volume,
                place,
                scaled(state.flow_rates.aspirate, rate)
            )
        })
    }

    async fn blow_out(
        &self,
        location: Option<&Location>,
        rate: Option<f64>,
    ) -> Result<(), DriverError> {
        settle(self.latency).await;
        let place = location
            .map(ToString::to_string)
            .unwrap_or_else(|| "current position".to_string());
        self.with_tip("blow out", |state| {
            format!(
                "Blowing out at {} at {:.2} uL/sec",
                place,
                scaled(state.flow_rates.blow_out, rate)
            )
        })
    }

    async fn pick_up_tip(&self) -> Result<(), DriverError> {
        settle(self.latency).await;
        let mut state = lock(&self.state);
        if state.has_tip {
            return Err(DriverError::CommandFailed(format!(
                "{} already has a tip attached",
                self.name
            )));
        }
        let rack = self
            .tip_racks
            .first()
            .map(String::as_str)
            .unwrap_or("tip rack");
        state.has_tip = true;
        state.commands.push(format!("Picking up tip from {}", rack));
        Ok(())
    }

    async fn drop_tip(&self) -> Result<(), DriverError> {
        settle(self.latency).await;
        let mut state = lock(&self.state);
        state.has_tip = false;
        state.commands.push("Dropping tip into trash".to_string());
        Ok(())
    }

    /// Accepts `touch_tip`, `air_gap`, `move_to` and `home`.
    async fn invoke(&self, name: &str, args: &CallArgs) -> Result<(), DriverError> {
        settle(self.latency).await;
        let line = if args.is_empty() {
            format!("{} {}", self.name, name)
        } else {
            format!("{} {} {}", self.name, name, args)
        };
        match name {
            "touch_tip" | "air_gap" => self.with_tip(name, |_| line),
            "move_to" | "home" => {
                lock(&self.state).commands.push(line);
                Ok(())
            }
            _ => Err(DriverError::unsupported(&self.name, name)),
        }
    }
}

#[derive(Debug, Default)]
struct ModuleState {
    block_temperature: Option<f64>,
    lid_temperature: Option<f64>,
    lid_open: bool,
    engaged_height: Option<f64>,
    commands: Vec<String>,
}

/// A deck module that only keeps state in memory.
///
/// Operations outside the module's [`ModuleKind`] are rejected as
/// unsupported.
#[derive(Debug)]
pub struct SimulatedModule {
    name: String,
    kind: ModuleKind,
    latency: Duration,
    state: Mutex<ModuleState>,
}

/// Magnet height used when `engage` is called without one, in mm.
pub const DEFAULT_ENGAGE_HEIGHT: f64 = 10.0;

impl SimulatedModule {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            latency: Duration::ZERO,
            state: Mutex::new(ModuleState::default()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    pub fn block_temperature(&self) -> Option<f64> {
        lock(&self.state).block_temperature
    }

    pub fn is_lid_open(&self) -> bool {
        lock(&self.state).lid_open
    }

    pub fn engaged_height(&self) -> Option<f64> {
        lock(&self.state).engaged_height
    }

    fn require(&self, operation: &str, kinds: &[ModuleKind]) -> Result<(), DriverError> {
        if kinds.contains(&self.kind) {
            Ok(())
        } else {
            Err(DriverError::unsupported(&self.name, operation))
        }
    }

    fn check_range(&self, what: &str, value: f64, min: f64, max: f64) -> Result<(), DriverError> {
        if value.is_finite() && (min..=max).contains(&value) {
            Ok(())
        } else {
            Err(DriverError::InvalidArgument(format!(
                "{} for {} must be between {} and {}, got {}",
                what, self.name, min, max, value
            )))
        }
    }
}

#[async_trait]
impl ModuleDriver for SimulatedModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ModuleKind {
        self.kind
    }

    async fn set_block_temperature(
        &self,
        temperature: f64,
        hold_time: Option<f64>,
    ) -> Result<(), DriverError> {
        settle(self.latency).await;
        self.require(
            "set_block_temperature",
            &[ModuleKind::Thermocycler, ModuleKind::Temperature],
        )?;
        let max = match self.kind {
            ModuleKind::Thermocycler => 99.0,
            _ => 95.0,
        };
        self.check_range("block temperature", temperature, 4.0, max)?;
        let mut state = lock(&self.state);
        state.block_temperature = Some(temperature);
        let line = match hold_time {
            Some(hold) => format!(
                "Setting block temperature to {} °C and holding for {} s",
                temperature, hold
            ),
            None => format!("Setting block temperature to {} °C", temperature),
        };
        state.commands.push(line);
        Ok(())
    }

    async fn set_lid_temperature(&self, temperature: f64) -> Result<(), DriverError> {
        settle(self.latency).await;
        self.require("set_lid_temperature", &[ModuleKind::Thermocycler])?;
        self.check_range("lid temperature", temperature, 37.0, 110.0)?;
        let mut state = lock(&self.state);
        state.lid_temperature = Some(temperature);
        state
            .commands
            .push(format!("Setting lid temperature to {} °C", temperature));
        Ok(())
    }

    async fn open_lid(&self) -> Result<(), DriverError> {
        settle(self.latency).await;
        self.require("open_lid", &[ModuleKind::Thermocycler])?;
        let mut state = lock(&self.state);
        state.lid_open = true;
        state.commands.push("Opening lid".to_string());
        Ok(())
    }

    async fn close_lid(&self) -> Result<(), DriverError> {
        settle(self.latency).await;
        self.require("close_lid", &[ModuleKind::Thermocycler])?;
        let mut state = lock(&self.state);
        state.lid_open = false;
        state.commands.push("Closing lid".to_string());
        Ok(())
    }

    async fn engage(&self, height_from_base: Option<f64>) -> Result<(), DriverError> {
        settle(self.latency).await;
        self.require("engage", &[ModuleKind::Magnetic])?;
        let height = height_from_base.unwrap_or(DEFAULT_ENGAGE_HEIGHT);
        self.check_range("engage height", height, 0.0, 25.0)?;
        let mut state = lock(&self.state);
        state.engaged_height = Some(height);
        state
            .commands
            .push(format!("Engaging magnets at {} mm from base", height));
        Ok(())
    }

    async fn disengage(&self) -> Result<(), DriverError> {
        settle(self.latency).await;
        self.require("disengage", &[ModuleKind::Magnetic])?;
        let mut state = lock(&self.state);
        state.engaged_height = None;
        state.commands.push("Disengaging magnets".to_string());
        Ok(())
    }

    async fn invoke(&self, name: &str, args: &CallArgs) -> Result<(), DriverError> {
        settle(self.latency).await;
        match name {
            "deactivate" | "deactivate_block" | "deactivate_lid" => {
                let mut state = lock(&self.state);
                if name != "deactivate_lid" {
                    state.block_temperature = None;
                }
                if name != "deactivate_block" {
                    state.lid_temperature = None;
                }
                let line = if args.is_empty() {
                    format!("{} {}", self.name, name)
                } else {
                    format!("{} {} {}", self.name, name, args)
                };
                state.commands.push(line);
                Ok(())
            }
            _ => Err(DriverError::unsupported(&self.name, name)),
        }
    }
}
