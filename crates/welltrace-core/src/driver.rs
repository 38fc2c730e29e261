//! Instrument capability traits.
//!
//! [`PipetteDriver`] and [`ModuleDriver`] describe what a liquid-handling
//! backend can do. The tracker never implements the physics itself: it wraps
//! a driver (see [`crate::instrument`]) and forwards every call to it.
//!
//! Methods are async so a backend may talk to a robot over the network; the
//! in-memory [`crate::sim`] backend completes immediately.

use async_trait::async_trait;
use thiserror::Error;

use crate::labware::Location;
use crate::operation::CallArgs;
use crate::rates::{FlowRateProfile, RateKind};

/// Errors reported by an instrument backend.
///
/// The tracking wrappers return these to the caller unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The command was rejected or failed on the device.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// The backend does not implement this operation.
    #[error("Operation not supported by {instrument}: {operation}")]
    Unsupported {
        instrument: String,
        operation: String,
    },

    /// An argument was out of range for the device.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend is not available or not connected.
    #[error("Not connected to instrument backend")]
    NotConnected,
}

impl DriverError {
    pub fn unsupported(instrument: &str, operation: &str) -> Self {
        DriverError::Unsupported {
            instrument: instrument.to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Trait for a pipetting instrument.
///
/// # Required Methods
///
/// Implementors must provide everything except [`invoke`](PipetteDriver::invoke)
/// and [`is_tracked`](PipetteDriver::is_tracked).
#[async_trait]
pub trait PipetteDriver: Send + Sync {
    /// Instrument name, e.g. `p300_single_gen2`.
    fn name(&self) -> &str;

    /// Load names of the tip racks assigned to this instrument.
    fn tip_rack_load_names(&self) -> Vec<String>;

    /// Current nominal flow rates.
    fn flow_rates(&self) -> FlowRateProfile;

    /// Assigns a new nominal flow rate.
    async fn set_flow_rate(&self, kind: RateKind, value: f64) -> Result<(), DriverError>;

    /// Withdraws `volume` µL at `location`. `rate` multiplies the nominal
    /// aspirate rate.
    async fn aspirate(
        &self,
        volume: f64,
        location: &Location,
        rate: Option<f64>,
    ) -> Result<(), DriverError>;

    /// Deposits `volume` µL at `location`.
    async fn dispense(
        &self,
        volume: f64,
        location: &Location,
        rate: Option<f64>,
    ) -> Result<(), DriverError>;

    /// Aspirates and dispenses `volume` µL at `location`, `repetitions` times.
    /// With no location the mix happens at the current position.
    async fn mix(
        &self,
        repetitions: u32,
        volume: f64,
        location: Option<&Location>,
        rate: Option<f64>,
    ) -> Result<(), DriverError>;

    /// Expels remaining liquid, at the current position if `location` is
    /// `None`.
    async fn blow_out(
        &self,
        location: Option<&Location>,
        rate: Option<f64>,
    ) -> Result<(), DriverError>;

    async fn pick_up_tip(&self) -> Result<(), DriverError>;

    async fn drop_tip(&self) -> Result<(), DriverError>;

    /// Runs an operation this trait has no dedicated method for
    /// (`touch_tip`, `move_to`, `home`, ...).
    ///
    /// The default implementation reports it as unsupported.
    async fn invoke(&self, name: &str, args: &CallArgs) -> Result<(), DriverError> {
        let _ = args;
        Err(DriverError::unsupported(self.name(), name))
    }

    /// True if this handle already records its operations with a tracker.
    fn is_tracked(&self) -> bool {
        false
    }
}

/// Hardware family of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Thermocycler,
    Magnetic,
    Temperature,
}

impl ModuleKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            ModuleKind::Thermocycler => "thermocycler",
            ModuleKind::Magnetic => "magnetic module",
            ModuleKind::Temperature => "temperature module",
        }
    }
}

/// Trait for a deck module.
///
/// Every operation defaults to [`DriverError::Unsupported`]; a backend
/// overrides the ones its hardware has.
#[async_trait]
pub trait ModuleDriver: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ModuleKind;

    async fn set_block_temperature(
        &self,
        temperature: f64,
        hold_time: Option<f64>,
    ) -> Result<(), DriverError> {
        let _ = (temperature, hold_time);
        Err(DriverError::unsupported(self.name(), "set_block_temperature"))
    }

    async fn set_lid_temperature(&self, temperature: f64) -> Result<(), DriverError> {
        let _ = temperature;
        Err(DriverError::unsupported(self.name(), "set_lid_temperature"))
    }

    async fn open_lid(&self) -> Result<(), DriverError> {
        Err(DriverError::unsupported(self.name(), "open_lid"))
    }

    async fn close_lid(&self) -> Result<(), DriverError> {
        Err(DriverError::unsupported(self.name(), "close_lid"))
    }

    /// Raises the magnets; `None` uses the labware's default height.
    async fn engage(&self, height_from_base: Option<f64>) -> Result<(), DriverError> {
        let _ = height_from_base;
        Err(DriverError::unsupported(self.name(), "engage"))
    }

    async fn disengage(&self) -> Result<(), DriverError> {
        Err(DriverError::unsupported(self.name(), "disengage"))
    }

    async fn invoke(&self, name: &str, args: &CallArgs) -> Result<(), DriverError> {
        let _ = args;
        Err(DriverError::unsupported(self.name(), name))
    }

    fn is_tracked(&self) -> bool {
        false
    }
}
