//! # welltrace-core
//!
//! Instrumentation and simulated-state tracking for liquid-handling robot
//! runs.
//!
//! Protocol code drives pipettes and deck modules through the driver traits.
//! Wrapping those handles with a [`tracker::Tracker`] records every call as a
//! human-readable log entry, keeps a per-well volume ledger, resolves the
//! flow rate each liquid-handling step ran at, and counts tips used per tip
//! type. Anomalies such as overfilling a well are logged and the run carries
//! on; the wrapped device always sees the call exactly as issued.
//!
//! ## Modules
//!
//! - [`labware`] - Labware, well identity and structured locations
//! - [`ledger`] - Per-well capacity and volume bookkeeping
//! - [`rates`] - Tip types and flow-rate resolution
//! - [`tips`] - Tip pick-up counter
//! - [`log`] - Log entries and sinks (console, JSONL, memory)
//! - [`operation`] - The closed set of tracked operations
//! - [`driver`] - Pipette and module driver traits
//! - [`instrument`] - Tracking wrappers implementing the driver traits
//! - [`tracker`] - The per-run tracking context
//! - [`sim`] - In-memory instrument backend
//! - [`config`] - Persistent user configuration
//! - [`error`] - Tracking anomaly taxonomy
//!
//! ## Example
//!
//! ```
//! use std::collections::HashMap;
//! use welltrace_core::driver::PipetteDriver;
//! use welltrace_core::labware::Labware;
//! use welltrace_core::sim::SimulatedPipette;
//! use welltrace_core::tracker::Tracker;
//!
//! #[tokio::main]
//! async fn main() {
//!     let tracker = Tracker::new();
//!     let plate = Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12);
//!     tracker.configure_well_tracking(&plate, 360.0, 360.0, &HashMap::new());
//!
//!     let p300 = tracker.wrap_instrument(SimulatedPipette::new(
//!         "p300_single_gen2",
//!         vec!["opentrons_96_tiprack_300ul".to_string()],
//!     ));
//!     p300.pick_up_tip().await.unwrap();
//!     p300.aspirate(20.0, &plate.well("A1").unwrap(), None).await.unwrap();
//!
//!     for entry in tracker.get_logs() {
//!         println!("{}", entry);
//!     }
//! }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod instrument;
pub mod labware;
pub mod ledger;
pub mod log;
pub mod operation;
pub mod rates;
pub mod sim;
pub mod tips;
pub mod tracker;
