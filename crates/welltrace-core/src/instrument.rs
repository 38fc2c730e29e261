//! Tracking wrappers for pipettes and modules.
//!
//! [`TrackedPipette`] and [`TrackedModule`] implement the same driver trait as
//! the handle they wrap, so a protocol uses them exactly as it would use the
//! bare handle. Each call is recorded by the shared [`Tracker`] and then
//! forwarded, with its arguments unchanged, to the wrapped handle. The
//! wrapped handle's result is returned verbatim.
//!
//! # Example
//!
//! ```
//! use welltrace_core::driver::PipetteDriver;
//! use welltrace_core::labware::Labware;
//! use welltrace_core::sim::SimulatedPipette;
//! use welltrace_core::tracker::Tracker;
//!
//! #[tokio::main]
//! async fn main() {
//!     let tracker = Tracker::new();
//!     let p300 = tracker.wrap_instrument(SimulatedPipette::new(
//!         "p300_single_gen2",
//!         vec!["opentrons_96_tiprack_300ul".to_string()],
//!     ));
//!     let plate = Labware::grid("corning_96_wellplate_360ul_flat", "plate", "2", 8, 12);
//!
//!     p300.pick_up_tip().await.unwrap();
//!     p300.dispense(50.0, &plate.well("A1").unwrap(), None).await.unwrap();
//!
//!     assert_eq!(tracker.well_volume(&plate.well("A1").unwrap()), Some(50.0));
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::driver::{DriverError, ModuleDriver, ModuleKind, PipetteDriver};
use crate::error::TrackingError;
use crate::labware::Location;
use crate::operation::{CallArgs, Operation};
use crate::rates::{FlowRateProfile, RateKind, TipType};
use crate::tracker::{InstrumentIdentity, Tracker};

/// Reads a by-name call. Arguments that cannot be read are logged as an
/// ERROR (unless the wrapper is a pass-through) and yield `None`; the caller
/// still forwards the call unchanged.
fn read_call(
    tracker: &Tracker,
    passthrough: bool,
    name: &str,
    args: &CallArgs,
) -> Option<Operation> {
    match Operation::from_call(name, args) {
        Ok(op) => Some(op),
        Err(e) => {
            if !passthrough {
                tracker.report(TrackingError::InvalidArguments {
                    operation: name.to_string(),
                    reason: e.to_string(),
                });
            }
            None
        }
    }
}

/// A pipette whose operations are recorded by a [`Tracker`].
///
/// Created with [`Tracker::wrap_instrument`].
pub struct TrackedPipette<D> {
    tracker: Arc<Tracker>,
    inner: D,
    identity: InstrumentIdentity,
    /// Set when `inner` already records its own operations.
    passthrough: bool,
}

impl<D: PipetteDriver> TrackedPipette<D> {
    pub(crate) fn new(tracker: Arc<Tracker>, inner: D, identity: InstrumentIdentity) -> Self {
        Self {
            tracker,
            inner,
            identity,
            passthrough: false,
        }
    }

    pub(crate) fn passthrough(tracker: Arc<Tracker>, inner: D, identity: InstrumentIdentity) -> Self {
        Self {
            tracker,
            inner,
            identity,
            passthrough: true,
        }
    }

    pub fn identity(&self) -> &InstrumentIdentity {
        &self.identity
    }

    pub fn tip_type(&self) -> TipType {
        self.identity.tip_type()
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// The wrapped handle.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    async fn run<T, F>(&self, op: &Operation, forward: F) -> T
    where
        F: Future<Output = T>,
    {
        if self.passthrough {
            return forward.await;
        }
        self.tracker.intercept(Some(&self.identity), op, forward).await
    }

    /// Performs an [`Operation`] through the matching typed method.
    ///
    /// An aspirate or dispense without a location has no typed method; it is
    /// recorded as unresolved and forwarded by name. Module operations are
    /// not pipette operations and are rejected without being recorded.
    pub async fn call(&self, op: Operation) -> Result<(), DriverError> {
        match op {
            Operation::Aspirate { volume, location: Some(location), rate } => {
                self.aspirate(volume, &location, rate).await
            }
            Operation::Dispense { volume, location: Some(location), rate } => {
                self.dispense(volume, &location, rate).await
            }
            Operation::Aspirate { location: None, .. } | Operation::Dispense { location: None, .. } => {
                let args = op.call_args();
                self.run(&op, self.inner.invoke(op.name(), &args)).await
            }
            Operation::Mix { repetitions, volume, location, rate } => {
                self.mix(repetitions, volume, location.as_ref(), rate).await
            }
            Operation::BlowOut { location, rate } => self.blow_out(location.as_ref(), rate).await,
            Operation::PickUpTip => self.pick_up_tip().await,
            Operation::DropTip => self.drop_tip().await,
            Operation::Other { ref name, ref args } => {
                self.run(&op, self.inner.invoke(name, args)).await
            }
            Operation::SetBlockTemperature { .. }
            | Operation::SetLidTemperature { .. }
            | Operation::OpenLid
            | Operation::CloseLid
            | Operation::Engage { .. }
            | Operation::Disengage => Err(DriverError::unsupported(self.inner.name(), op.name())),
        }
    }
}

#[async_trait]
impl<D: PipetteDriver> PipetteDriver for TrackedPipette<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn tip_rack_load_names(&self) -> Vec<String> {
        self.inner.tip_rack_load_names()
    }

    fn flow_rates(&self) -> FlowRateProfile {
        self.inner.flow_rates()
    }

    async fn set_flow_rate(&self, kind: RateKind, value: f64) -> Result<(), DriverError> {
        if !self.passthrough {
            self.tracker
                .record_flow_rate(&self.tip_type(), kind, value, self.inner.flow_rates());
        }
        self.inner.set_flow_rate(kind, value).await
    }

    async fn aspirate(
        &self,
        volume: f64,
        location: &Location,
        rate: Option<f64>,
    ) -> Result<(), DriverError> {
        let op = Operation::Aspirate {
            volume,
            location: Some(location.clone()),
            rate,
        };
        self.run(&op, self.inner.aspirate(volume, location, rate)).await
    }

    async fn dispense(
        &self,
        volume: f64,
        location: &Location,
        rate: Option<f64>,
    ) -> Result<(), DriverError> {
        let op = Operation::Dispense {
            volume,
            location: Some(location.clone()),
            rate,
        };
        self.run(&op, self.inner.dispense(volume, location, rate)).await
    }

    async fn mix(
        &self,
        repetitions: u32,
        volume: f64,
        location: Option<&Location>,
        rate: Option<f64>,
    ) -> Result<(), DriverError> {
        let op = Operation::Mix {
            repetitions,
            volume,
            location: location.cloned(),
            rate,
        };
        self.run(&op, self.inner.mix(repetitions, volume, location, rate)).await
    }

    async fn blow_out(
        &self,
        location: Option<&Location>,
        rate: Option<f64>,
    ) -> Result<(), DriverError> {
        let op = Operation::BlowOut {
            location: location.cloned(),
            rate,
        };
        self.run(&op, self.inner.blow_out(location, rate)).await
    }

    async fn pick_up_tip(&self) -> Result<(), DriverError> {
        self.run(&Operation::PickUpTip, self.inner.pick_up_tip()).await
    }

    async fn drop_tip(&self) -> Result<(), DriverError> {
        self.run(&Operation::DropTip, self.inner.drop_tip()).await
    }

    /// Routes known operation names to their typed methods so by-name calls
    /// are accounted for like typed ones. Everything else, including calls
    /// whose arguments cannot be read, goes to the wrapped `invoke` as given.
    async fn invoke(&self, name: &str, args: &CallArgs) -> Result<(), DriverError> {
        let op = match read_call(&self.tracker, self.passthrough, name, args) {
            Some(op) => op,
            None => return self.inner.invoke(name, args).await,
        };
        match op {
            Operation::Aspirate { location: Some(_), .. }
            | Operation::Dispense { location: Some(_), .. }
            | Operation::Mix { .. }
            | Operation::BlowOut { .. }
            | Operation::PickUpTip
            | Operation::DropTip => self.call(op).await,
            Operation::Aspirate { .. } | Operation::Dispense { .. } => {
                self.run(&op, self.inner.invoke(name, args)).await
            }
            _ => {
                let op = Operation::Other {
                    name: name.to_string(),
                    args: args.clone(),
                };
                self.run(&op, self.inner.invoke(name, args)).await
            }
        }
    }

    fn is_tracked(&self) -> bool {
        true
    }
}

/// A module whose operations are recorded by a [`Tracker`].
///
/// Created with [`Tracker::wrap_module`].
pub struct TrackedModule<M> {
    tracker: Arc<Tracker>,
    inner: M,
    identity: InstrumentIdentity,
    passthrough: bool,
}

impl<M: ModuleDriver> TrackedModule<M> {
    pub(crate) fn new(tracker: Arc<Tracker>, inner: M, identity: InstrumentIdentity) -> Self {
        Self {
            tracker,
            inner,
            identity,
            passthrough: false,
        }
    }

    pub(crate) fn passthrough(tracker: Arc<Tracker>, inner: M, identity: InstrumentIdentity) -> Self {
        Self {
            tracker,
            inner,
            identity,
            passthrough: true,
        }
    }

    pub fn identity(&self) -> &InstrumentIdentity {
        &self.identity
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn into_inner(self) -> M {
        self.inner
    }

    async fn run<T, F>(&self, op: &Operation, forward: F) -> T
    where
        F: Future<Output = T>,
    {
        if self.passthrough {
            return forward.await;
        }
        self.tracker.intercept(Some(&self.identity), op, forward).await
    }

    /// Performs an [`Operation`] through the matching typed method.
    pub async fn call(&self, op: Operation) -> Result<(), DriverError> {
        match op {
            Operation::SetBlockTemperature { temperature, hold_time } => {
                self.set_block_temperature(temperature, hold_time).await
            }
            Operation::SetLidTemperature { temperature } => {
                self.set_lid_temperature(temperature).await
            }
            Operation::OpenLid => self.open_lid().await,
            Operation::CloseLid => self.close_lid().await,
            Operation::Engage { height_from_base } => self.engage(height_from_base).await,
            Operation::Disengage => self.disengage().await,
            Operation::Other { ref name, ref args } => {
                self.run(&op, self.inner.invoke(name, args)).await
            }
            _ => Err(DriverError::unsupported(self.inner.name(), op.name())),
        }
    }
}

#[async_trait]
impl<M: ModuleDriver> ModuleDriver for TrackedModule<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> ModuleKind {
        self.inner.kind()
    }

    async fn set_block_temperature(
        &self,
        temperature: f64,
        hold_time: Option<f64>,
    ) -> Result<(), DriverError> {
        let op = Operation::SetBlockTemperature {
            temperature,
            hold_time,
        };
        self.run(&op, self.inner.set_block_temperature(temperature, hold_time))
            .await
    }

    async fn set_lid_temperature(&self, temperature: f64) -> Result<(), DriverError> {
        let op = Operation::SetLidTemperature { temperature };
        self.run(&op, self.inner.set_lid_temperature(temperature)).await
    }

    async fn open_lid(&self) -> Result<(), DriverError> {
        self.run(&Operation::OpenLid, self.inner.open_lid()).await
    }

    async fn close_lid(&self) -> Result<(), DriverError> {
        self.run(&Operation::CloseLid, self.inner.close_lid()).await
    }

    async fn engage(&self, height_from_base: Option<f64>) -> Result<(), DriverError> {
        let op = Operation::Engage { height_from_base };
        self.run(&op, self.inner.engage(height_from_base)).await
    }

    async fn disengage(&self) -> Result<(), DriverError> {
        self.run(&Operation::Disengage, self.inner.disengage()).await
    }

    async fn invoke(&self, name: &str, args: &CallArgs) -> Result<(), DriverError> {
        match read_call(&self.tracker, self.passthrough, name, args) {
            Some(op) if !op.is_pipetting() && !matches!(op, Operation::Other { .. }) => {
                self.call(op).await
            }
            Some(_) => {
                let op = Operation::Other {
                    name: name.to_string(),
                    args: args.clone(),
                };
                self.run(&op, self.inner.invoke(name, args)).await
            }
            None => self.inner.invoke(name, args).await,
        }
    }

    fn is_tracked(&self) -> bool {
        true
    }
}
