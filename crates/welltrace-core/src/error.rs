//! Anomalies detected by the tracking layer.
//!
//! None of these abort a run. Each one is recorded as an ERROR entry in the
//! tracker's log and the tracker carries on, clamping or skipping bookkeeping
//! as needed, before the intercepted call is forwarded to the device.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rates::RateKind;

/// A recoverable anomaly observed while tracking an operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    /// An aspirate asked for more liquid than the well holds.
    #[error(
        "Tried to aspirate {requested} µL from {location}, but only {available} µL was available. Aspirated what was left."
    )]
    VolumeShortfall {
        location: String,
        requested: f64,
        available: f64,
    },

    /// A dispense would push a well past its capacity.
    #[error(
        "Tried to dispense {requested} µL into {location}, but it exceeds capacity. Adjusted to the maximum capacity of {capacity} µL."
    )]
    CapacityExceeded {
        location: String,
        requested: f64,
        capacity: f64,
    },

    /// The operation is not bound to any tracked instrument.
    #[error("Unable to identify instrument for method {operation}.")]
    UnresolvedInstrument { operation: String },

    /// The target of the operation has no well identity.
    #[error("{operation} requires a location with a well; got {location}.")]
    UnresolvedLocation { operation: String, location: String },

    /// A flow rate assignment was not a usable number.
    #[error("{kind} flow rate must be a positive number in µL/s, got {value}.")]
    InvalidRateValue { kind: RateKind, value: String },

    /// A volume that is negative or not a finite number. The ledger is left
    /// untouched.
    #[error("{operation} volume must be a finite, non-negative number of µL, got {value}.")]
    InvalidVolume { operation: String, value: String },

    /// A by-name call whose arguments could not be read.
    #[error("Could not read arguments of {operation}: {reason}.")]
    InvalidArguments { operation: String, reason: String },
}

/// Discriminant of [`TrackingError`], stored on log entries so consumers can
/// count anomalies by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    VolumeShortfall,
    CapacityExceeded,
    UnresolvedInstrument,
    UnresolvedLocation,
    InvalidRateValue,
    InvalidVolume,
    InvalidArguments,
}

impl TrackingError {
    pub fn kind(&self) -> AnomalyKind {
        match self {
            TrackingError::VolumeShortfall { .. } => AnomalyKind::VolumeShortfall,
            TrackingError::CapacityExceeded { .. } => AnomalyKind::CapacityExceeded,
            TrackingError::UnresolvedInstrument { .. } => AnomalyKind::UnresolvedInstrument,
            TrackingError::UnresolvedLocation { .. } => AnomalyKind::UnresolvedLocation,
            TrackingError::InvalidRateValue { .. } => AnomalyKind::InvalidRateValue,
            TrackingError::InvalidVolume { .. } => AnomalyKind::InvalidVolume,
            TrackingError::InvalidArguments { .. } => AnomalyKind::InvalidArguments,
        }
    }
}
