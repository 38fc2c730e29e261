//! The tracking context for one run.
//!
//! A [`Tracker`] owns the well ledger, the flow-rate table, the tip counter
//! and the ordered log. It is created once at the start of a run, shared as an
//! `Arc<Tracker>` with every instrument wrapper, and read at the end for the
//! audit summary.
//!
//! # Architecture
//!
//! - Wrappers call [`Tracker::intercept`] with the instrument identity, the
//!   [`Operation`] and the future that performs the real call
//! - Bookkeeping runs to completion under one exclusive lock before the
//!   forward future is polled; the lock is never held across an `.await`
//! - Every log entry is appended in call order and mirrored to `tracing`;
//!   the configured [`LogSink`]s receive entries in the same order after the
//!   lock is released
//! - Anomalies are logged as ERROR entries and never surface as `Err`
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use welltrace_core::labware::Labware;
//! use welltrace_core::operation::Operation;
//! use welltrace_core::tracker::Tracker;
//!
//! #[tokio::main]
//! async fn main() {
//!     let tracker = Tracker::new();
//!     let plate = Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12);
//!     tracker.configure_well_tracking(&plate, 360.0, 0.0, &HashMap::new());
//!
//!     // An operation nobody owns is still forwarded.
//!     let op = Operation::Aspirate { volume: 20.0, location: plate.well("A1"), rate: None };
//!     let result = tracker.intercept(None, &op, async { 42 }).await;
//!
//!     assert_eq!(result, 42);
//!     assert_eq!(tracker.errors().len(), 1);
//! }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::driver::{ModuleDriver, ModuleKind, PipetteDriver};
use crate::error::{AnomalyKind, TrackingError};
use crate::instrument::{TrackedModule, TrackedPipette};
use crate::labware::{Labware, Location, WellKey};
use crate::ledger::{WellLedger, WellState};
use crate::log::{LogEntry, LogLevel, LogSink};
use crate::operation::{humanize, Operation};
use crate::rates::{format_rate, is_valid_rate, FlowRateProfile, RateKind, RateTable, TipType};
use crate::tips::TipUsage;

/// Who issued an intercepted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentIdentity {
    Pipette { name: String, tip_type: TipType },
    Module { name: String, kind: ModuleKind },
}

impl InstrumentIdentity {
    pub fn name(&self) -> &str {
        match self {
            InstrumentIdentity::Pipette { name, .. } => name.as_str(),
            InstrumentIdentity::Module { name, .. } => name.as_str(),
        }
    }

    /// Tip type of a pipette; modules report the unknown sentinel.
    pub fn tip_type(&self) -> TipType {
        match self {
            InstrumentIdentity::Pipette { tip_type, .. } => tip_type.clone(),
            InstrumentIdentity::Module { .. } => TipType::unknown(),
        }
    }

    /// Name used in module messages, e.g. `thermocycler`.
    fn module_label(&self) -> &str {
        match self {
            InstrumentIdentity::Module { kind, .. } => kind.display_name(),
            InstrumentIdentity::Pipette { name, .. } => name.as_str(),
        }
    }
}

impl fmt::Display for InstrumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counts over a finished (or in-progress) run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub entries: usize,
    pub actions: usize,
    pub infos: usize,
    pub errors: usize,
    pub anomalies: BTreeMap<AnomalyKind, usize>,
    pub tip_usage: BTreeMap<TipType, u32>,
}

#[derive(Debug, Default)]
struct TrackerState {
    ledger: WellLedger,
    rates: RateTable,
    tips: TipUsage,
    log: Vec<LogEntry>,
}

/// Tracking context: ledger, rate table, tip counter and log for one run.
pub struct Tracker {
    /// Unique identifier for this run.
    pub id: Uuid,

    /// When this run started.
    pub created_at: DateTime<Utc>,

    state: Mutex<TrackerState>,

    sinks: Vec<Box<dyn LogSink>>,

    /// Entries logged but not yet handed to the sinks, in log order.
    outbox: Mutex<VecDeque<LogEntry>>,

    /// Held while draining `outbox`.
    sink_order: Mutex<()>,
}

impl Tracker {
    /// Creates a tracker that keeps its log in memory only.
    pub fn new() -> Arc<Self> {
        Self::with_sinks(Vec::new())
    }

    /// Creates a tracker that also hands every entry to `sinks`, in order.
    ///
    /// Sinks run after the tracker state has been unlocked, one at a time,
    /// and must not log through the tracker themselves.
    pub fn with_sinks(sinks: Vec<Box<dyn LogSink>>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            state: Mutex::new(TrackerState::default()),
            sinks,
            outbox: Mutex::new(VecDeque::new()),
            sink_order: Mutex::new(()),
        })
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        lock(&self.state)
    }

    /// Runs one bookkeeping step under the state lock, then hands the entries
    /// it logged to the sinks once the state is unlocked.
    ///
    /// Entries are queued while the state is still locked, so the sinks see
    /// them in log order even when several threads record at once. A sink
    /// that blocks holds up other threads' sink delivery only; bookkeeping
    /// and reads carry on.
    fn record<R>(&self, step: impl FnOnce(&mut Recorder<'_>) -> R) -> R {
        let output = {
            let mut state = self.state();
            let mut rec = Recorder {
                state: &mut state,
                pending: Vec::new(),
            };
            let output = step(&mut rec);
            if !self.sinks.is_empty() {
                lock(&self.outbox).extend(rec.pending);
            }
            output
        };
        if !self.sinks.is_empty() {
            let _order = lock(&self.sink_order);
            loop {
                // Outbox guard is dropped before the sinks run
                let next = lock(&self.outbox).pop_front();
                let Some(entry) = next else { break };
                for sink in &self.sinks {
                    sink.emit(&entry);
                }
            }
        }
        output
    }

    /// Wraps a pipette so every operation on it is tracked.
    ///
    /// The pipette's nominal flow rates are captured under its tip type.
    /// Wrapping a handle that is already tracked yields a pass-through
    /// wrapper that does no bookkeeping of its own.
    pub fn wrap_instrument<D: PipetteDriver>(self: &Arc<Self>, driver: D) -> TrackedPipette<D> {
        let tip_type = TipType::from_racks(&driver.tip_rack_load_names());
        let identity = InstrumentIdentity::Pipette {
            name: driver.name().to_string(),
            tip_type: tip_type.clone(),
        };
        if driver.is_tracked() {
            self.record(|rec| {
                rec.info(format!("{} is already tracked; not wrapping again.", driver.name()))
            });
            return TrackedPipette::passthrough(self.clone(), driver, identity);
        }
        let profile = driver.flow_rates();
        self.record(|rec| {
            rec.state.rates.observe(&tip_type, profile);
            rec.info(format!(
                "Initial flow rates for {}: Aspirate={} µL/s, Dispense={} µL/s, Blow-out={} µL/s.",
                tip_type, profile.aspirate, profile.dispense, profile.blow_out
            ));
        });
        TrackedPipette::new(self.clone(), driver, identity)
    }

    /// Wraps a module so its operations are logged.
    pub fn wrap_module<M: ModuleDriver>(self: &Arc<Self>, module: M) -> TrackedModule<M> {
        let identity = InstrumentIdentity::Module {
            name: module.name().to_string(),
            kind: module.kind(),
        };
        if module.is_tracked() {
            self.record(|rec| {
                rec.info(format!("{} is already tracked; not wrapping again.", module.name()))
            });
            return TrackedModule::passthrough(self.clone(), module, identity);
        }
        TrackedModule::new(self.clone(), module, identity)
    }

    /// Seeds the ledger for every well of `labware`.
    ///
    /// `overrides` maps well names to starting volumes and wins over
    /// `initial_volume`.
    pub fn configure_well_tracking(
        &self,
        labware: &Labware,
        capacity: f64,
        initial_volume: f64,
        overrides: &HashMap<String, f64>,
    ) {
        self.record(|rec| {
            let report = rec
                .state
                .ledger
                .configure(labware, capacity, initial_volume, overrides);
            rec.info(format!(
                "Tracking {} wells of {} (capacity {} µL, initial {} µL, {} overrides).",
                report.wells,
                labware.label,
                capacity,
                initial_volume,
                overrides.len()
            ));
            if !report.capacity_kept.is_empty() {
                rec.info(format!(
                    "Kept existing capacity for {} wells of {}.",
                    report.capacity_kept.len(),
                    labware.label
                ));
            }
        })
    }

    /// Appends an entry to the log.
    pub fn emit(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        self.record(|rec| rec.push(entry));
    }

    /// Records a tracking anomaly as an ERROR entry.
    pub fn report(&self, error: TrackingError) {
        self.record(|rec| rec.anomaly(error));
    }

    /// Runs the bookkeeping for `op`, then awaits `forward` and returns its
    /// output unchanged.
    ///
    /// `forward` is not polled until bookkeeping has finished. With no
    /// `owner`, one `UnresolvedInstrument` error is logged and no other
    /// bookkeeping happens.
    pub async fn intercept<T, F>(
        &self,
        owner: Option<&InstrumentIdentity>,
        op: &Operation,
        forward: F,
    ) -> T
    where
        F: Future<Output = T>,
    {
        let span = info_span!(
            "intercept",
            op = op.name(),
            instrument = owner.map(InstrumentIdentity::name).unwrap_or("<unbound>")
        );
        span.in_scope(|| self.observe(owner, op));
        let start = Instant::now();
        let output = forward.instrument(span).await;
        debug!(op = op.name(), elapsed_ms = start.elapsed().as_millis() as u64, "forwarded");
        output
    }

    /// Bookkeeping for one operation, without forwarding anything.
    pub fn observe(&self, owner: Option<&InstrumentIdentity>, op: &Operation) {
        self.record(|rec| {
            let Some(owner) = owner else {
                rec.anomaly(TrackingError::UnresolvedInstrument {
                    operation: op.name().to_string(),
                });
                return;
            };
            let tip_type = owner.tip_type();
            match op {
                Operation::Aspirate { volume, location: Some(location), rate } => {
                    rec.track_volume(*volume, Some(location), None, *rate, &tip_type);
                }
                Operation::Dispense { volume, location: Some(location), rate } => {
                    rec.track_volume(*volume, None, Some(location), *rate, &tip_type);
                }
                Operation::Aspirate { location: None, .. } | Operation::Dispense { location: None, .. } => {
                    rec.anomaly(TrackingError::UnresolvedLocation {
                        operation: op.name().to_string(),
                        location: "no location".to_string(),
                    });
                }
                Operation::Mix { repetitions, volume, location, rate } => {
                    rec.mix(*repetitions, *volume, location.as_ref(), *rate, &tip_type);
                }
                Operation::BlowOut { location, rate } => {
                    rec.blow_out(location.as_ref(), *rate, &tip_type);
                }
                Operation::PickUpTip => {
                    rec.pick_up(&tip_type);
                }
                Operation::DropTip => rec.action(format!("Dropped a {} tip.", tip_type)),
                Operation::SetBlockTemperature { temperature, hold_time } => {
                    let hold = hold_time
                        .map(|h| format!(" and hold for {} s", h))
                        .unwrap_or_default();
                    rec.action(format!(
                        "Set {} block temperature to {} °C{}.",
                        owner.module_label(),
                        temperature,
                        hold
                    ));
                }
                Operation::SetLidTemperature { temperature } => rec.action(format!(
                    "Set {} lid temperature to {} °C.",
                    owner.module_label(),
                    temperature
                )),
                Operation::OpenLid => rec.action(format!("Opened {} lid.", owner.module_label())),
                Operation::CloseLid => rec.action(format!("Closed {} lid.", owner.module_label())),
                Operation::Engage { height_from_base } => {
                    let height = height_from_base
                        .map(|h| format!("{} mm from base", h))
                        .unwrap_or_else(|| "default height".to_string());
                    rec.action(format!("Engaged {} at {}.", owner.module_label(), height));
                }
                Operation::Disengage => rec.action(format!("Disengaged {}.", owner.module_label())),
                Operation::Other { name, args } => {
                    let args = if args.is_empty() {
                        String::new()
                    } else {
                        format!(" {}", args)
                    };
                    rec.action(format!("Executing: {}{} on {}", humanize(name), args, owner.name()));
                }
            }
        })
    }

    /// Updates the ledger for an aspirate from `source` and/or a dispense into
    /// `destination`, logging the outcome.
    ///
    /// A volume that is negative or not finite is logged as `InvalidVolume`
    /// and leaves the ledger untouched.
    pub fn track_volume(
        &self,
        volume: f64,
        source: Option<&Location>,
        destination: Option<&Location>,
        rate: Option<f64>,
        tip_type: &TipType,
    ) {
        self.record(|rec| rec.track_volume(volume, source, destination, rate, tip_type));
    }

    /// Records a nominal flow-rate assignment for a pipette.
    ///
    /// Unusable values are logged as `InvalidRateValue` and leave the table
    /// unchanged. Returns whether the value was recorded.
    pub fn record_flow_rate(
        &self,
        tip_type: &TipType,
        kind: RateKind,
        value: f64,
        current: FlowRateProfile,
    ) -> bool {
        self.record(|rec| {
            if !is_valid_rate(value) {
                rec.anomaly(TrackingError::InvalidRateValue {
                    kind,
                    value: value.to_string(),
                });
                return false;
            }
            rec.state.rates.update(tip_type, kind, value, current);
            rec.info(format!(
                "Flow rate for {} updated to {} µL/s for {}.",
                kind, value, tip_type
            ));
            true
        })
    }

    /// Records a tip pick-up and returns the running total for the tip type.
    pub fn on_pick_up(&self, tip_type: &TipType) -> u32 {
        self.record(|rec| rec.pick_up(tip_type))
    }

    pub fn on_drop(&self, tip_type: &TipType) {
        self.record(|rec| rec.action(format!("Dropped a {} tip.", tip_type)));
    }

    /// Nominal rate of `kind` for a tip type, if it has been observed.
    pub fn resolve_rate(&self, tip_type: &TipType, kind: RateKind) -> Option<f64> {
        self.state().rates.resolve(tip_type, kind)
    }

    pub fn flow_rates(&self, tip_type: &TipType) -> Option<FlowRateProfile> {
        self.state().rates.profile(tip_type).copied()
    }

    pub fn well_state(&self, key: &WellKey) -> WellState {
        self.state().ledger.state(key)
    }

    /// Current tracked volume at a location, or `None` if it has no well.
    pub fn well_volume(&self, location: &Location) -> Option<f64> {
        location
            .well_key()
            .map(|key| self.state().ledger.volume(&key))
    }

    /// The full ordered log.
    pub fn get_logs(&self) -> Vec<LogEntry> {
        self.state().log.clone()
    }

    /// ERROR entries only, in order.
    pub fn errors(&self) -> Vec<LogEntry> {
        self.state()
            .log
            .iter()
            .filter(|e| e.is_error())
            .cloned()
            .collect()
    }

    pub fn anomaly_count(&self, kind: AnomalyKind) -> usize {
        self.state()
            .log
            .iter()
            .filter(|e| e.anomaly == Some(kind))
            .count()
    }

    /// Pick-ups per tip type.
    pub fn get_tip_usage(&self) -> BTreeMap<TipType, u32> {
        self.state().tips.summary()
    }

    pub fn summary(&self) -> RunSummary {
        let state = self.state();
        let log = &state.log;
        let count = |level: LogLevel| log.iter().filter(|e| e.level == level).count();
        let mut anomalies = BTreeMap::new();
        for kind in log.iter().filter_map(|e| e.anomaly) {
            *anomalies.entry(kind).or_insert(0) += 1;
        }
        RunSummary {
            run_id: self.id,
            started_at: self.created_at,
            entries: log.len(),
            actions: count(LogLevel::Action),
            infos: count(LogLevel::Info),
            errors: count(LogLevel::Error),
            anomalies,
            tip_usage: state.tips.summary(),
        }
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("state", &"<Mutex<TrackerState>>")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One bookkeeping step: exclusive access to the tracker state, plus the
/// entries logged so far for the sinks.
struct Recorder<'a> {
    state: &'a mut TrackerState,
    pending: Vec<LogEntry>,
}

impl Recorder<'_> {
    fn push(&mut self, entry: LogEntry) {
        match entry.level {
            LogLevel::Error => warn!(anomaly = ?entry.anomaly, "{}", entry.message),
            LogLevel::Action | LogLevel::Info => info!(level = ?entry.level, "{}", entry.message),
        }
        self.pending.push(entry.clone());
        self.state.log.push(entry);
    }

    fn action(&mut self, message: String) {
        self.push(LogEntry::new(LogLevel::Action, message));
    }

    fn info(&mut self, message: String) {
        self.push(LogEntry::new(LogLevel::Info, message));
    }

    fn anomaly(&mut self, error: TrackingError) {
        self.push(LogEntry::anomaly(&error));
    }

    fn pick_up(&mut self, tip_type: &TipType) -> u32 {
        let total = self.state.tips.pick_up(tip_type);
        self.action(format!(
            "Picked up a new {tip} tip. Total {tip} tips used: {total}.",
            tip = tip_type
        ));
        total
    }

    fn track_volume(
        &mut self,
        volume: f64,
        source: Option<&Location>,
        destination: Option<&Location>,
        rate: Option<f64>,
        tip_type: &TipType,
    ) {
        if !(volume.is_finite() && volume >= 0.0) {
            let operation = if source.is_some() { "aspirate" } else { "dispense" };
            self.anomaly(TrackingError::InvalidVolume {
                operation: operation.to_string(),
                value: volume.to_string(),
            });
            return;
        }

        if let Some(source) = source {
            let Some(key) = source.well_key() else {
                self.anomaly(TrackingError::UnresolvedLocation {
                    operation: "aspirate".to_string(),
                    location: source.to_string(),
                });
                return;
            };
            let outcome = self.state.ledger.aspirate(&key, volume);
            let effective = self.state.rates.resolve_effective(tip_type, RateKind::Aspirate, rate);
            self.action(format!(
                "{} aspirated {} µL from {} at {}. Remaining: {} µL.",
                tip_type,
                outcome.aspirated,
                source,
                format_rate(effective),
                outcome.remaining
            ));
            if outcome.is_shortfall() {
                self.anomaly(TrackingError::VolumeShortfall {
                    location: source.to_string(),
                    requested: outcome.requested,
                    available: outcome.available,
                });
            }
        }

        if let Some(destination) = destination {
            let Some(key) = destination.well_key() else {
                self.anomaly(TrackingError::UnresolvedLocation {
                    operation: "dispense".to_string(),
                    location: destination.to_string(),
                });
                return;
            };
            let outcome = self.state.ledger.dispense(&key, volume);
            let effective = self.state.rates.resolve_effective(tip_type, RateKind::Dispense, rate);
            self.action(format!(
                "{} dispensed {} µL into {} at {}. Total: {} µL.",
                tip_type,
                outcome.dispensed,
                destination,
                format_rate(effective),
                outcome.total
            ));
            if outcome.is_overflow() {
                self.anomaly(TrackingError::CapacityExceeded {
                    location: destination.to_string(),
                    requested: outcome.requested,
                    capacity: outcome.capacity,
                });
            }
        }
    }

    fn mix(
        &mut self,
        repetitions: u32,
        volume: f64,
        location: Option<&Location>,
        rate: Option<f64>,
        tip_type: &TipType,
    ) {
        let Some(location) = location.filter(|l| l.well_key().is_some()) else {
            self.anomaly(TrackingError::UnresolvedLocation {
                operation: "mix".to_string(),
                location: location
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "no location".to_string()),
            });
            return;
        };
        let multiplier = rate.filter(|r| r.is_finite()).unwrap_or(1.0);
        let effective = self
            .state
            .rates
            .resolve_effective(tip_type, RateKind::Aspirate, Some(multiplier));
        self.action(format!(
            "{} mixed {} times with {} µL in {} at {:.2}x speed ({}).",
            tip_type,
            repetitions,
            volume,
            location,
            multiplier,
            format_rate(effective)
        ));
    }

    fn blow_out(&mut self, location: Option<&Location>, rate: Option<f64>, tip_type: &TipType) {
        let place = match location {
            None => "current position".to_string(),
            Some(l) if l.well_key().is_some() => l.to_string(),
            Some(l) => {
                self.anomaly(TrackingError::UnresolvedLocation {
                    operation: "blow_out".to_string(),
                    location: l.to_string(),
                });
                "unknown location".to_string()
            }
        };
        let effective = self.state.rates.resolve_effective(tip_type, RateKind::BlowOut, rate);
        self.action(format!(
            "Performed blow_out at {} at {} for {}.",
            place,
            format_rate(effective),
            tip_type
        ));
    }
}
