//! Executes a resolved plan against simulated instruments.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use welltrace_core::driver::{DriverError, PipetteDriver};
use welltrace_core::instrument::{TrackedModule, TrackedPipette};
use welltrace_core::sim::{SimulatedModule, SimulatedPipette};
use welltrace_core::tracker::Tracker;

use crate::plan::{Action, ResolvedPlan, Step, Target};

/// The step that stopped a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub step: usize,
    pub call: String,
    pub instrument: Option<String>,
    pub error: String,
}

/// Tracked simulated instruments for one run.
pub struct Deck {
    pipettes: BTreeMap<String, TrackedPipette<SimulatedPipette>>,
    modules: BTreeMap<String, TrackedModule<SimulatedModule>>,
}

impl Deck {
    /// Configures well tracking and wraps every instrument the plan declares.
    pub fn load(tracker: &Arc<Tracker>, plan: &ResolvedPlan) -> Self {
        for tracking in &plan.tracking {
            if let Some(labware) = plan.labware.get(&tracking.labware) {
                tracker.configure_well_tracking(
                    labware,
                    tracking.capacity,
                    tracking.initial_volume,
                    &tracking.overrides,
                );
            }
        }

        let pipettes = plan
            .pipettes
            .iter()
            .map(|decl| {
                let sim = match decl.flow_rates {
                    Some(rates) => SimulatedPipette::with_flow_rates(
                        &decl.name,
                        decl.tip_racks.clone(),
                        rates,
                    ),
                    None => SimulatedPipette::new(&decl.name, decl.tip_racks.clone()),
                }
                .with_latency(Duration::from_millis(decl.latency_ms));
                debug!(pipette = %decl.name, mount = ?decl.mount, "loading pipette");
                (decl.name.clone(), tracker.wrap_instrument(sim))
            })
            .collect();

        let modules = plan
            .modules
            .iter()
            .map(|decl| {
                let sim = SimulatedModule::new(&decl.name, decl.kind)
                    .with_latency(Duration::from_millis(decl.latency_ms));
                (decl.name.clone(), tracker.wrap_module(sim))
            })
            .collect();

        Self { pipettes, modules }
    }

    /// Runs the steps in order, stopping at the first device failure.
    pub async fn execute(&self, tracker: &Tracker, steps: &[Step]) -> Result<usize, StepFailure> {
        for step in steps {
            debug!(step = step.index, call = step.call_name(), "executing step");
            self.execute_step(tracker, step)
                .await
                .map_err(|e| StepFailure {
                    step: step.index,
                    call: step.call_name().to_string(),
                    instrument: match &step.target {
                        Target::Pipette(name) | Target::Module(name) => Some(name.clone()),
                        Target::Unbound => None,
                    },
                    error: e.to_string(),
                })?;
        }
        info!(steps = steps.len(), "run complete");
        Ok(steps.len())
    }

    async fn execute_step(&self, tracker: &Tracker, step: &Step) -> Result<(), DriverError> {
        match (&step.target, &step.action) {
            (Target::Pipette(name), Action::Call(op)) => {
                self.pipette(name)?.call(op.clone()).await
            }
            (Target::Pipette(name), Action::SetFlowRate(rates)) => {
                let pipette = self.pipette(name)?;
                for (kind, value) in rates {
                    pipette.set_flow_rate(*kind, *value).await?;
                }
                Ok(())
            }
            (Target::Module(name), Action::Call(op)) => self.module(name)?.call(op.clone()).await,
            // Nothing to forward to: the tracker records the call as unattributed
            (Target::Unbound, Action::Call(op)) => {
                tracker
                    .intercept(None, op, async { Ok::<(), DriverError>(()) })
                    .await
            }
            (_, Action::SetFlowRate(_)) => Err(DriverError::InvalidArgument(
                "set_flow_rate needs a pipette".to_string(),
            )),
        }
    }

    fn pipette(&self, name: &str) -> Result<&TrackedPipette<SimulatedPipette>, DriverError> {
        self.pipettes.get(name).ok_or(DriverError::NotConnected)
    }

    fn module(&self, name: &str) -> Result<&TrackedModule<SimulatedModule>, DriverError> {
        self.modules.get(name).ok_or(DriverError::NotConnected)
    }

    /// Each simulated instrument's own record of accepted commands.
    pub fn run_log(&self) -> BTreeMap<String, Vec<String>> {
        let pipettes = self
            .pipettes
            .iter()
            .map(|(name, p)| (name.clone(), p.inner().commands()));
        let modules = self
            .modules
            .iter()
            .map(|(name, m)| (name.clone(), m.inner().commands()));
        pipettes.chain(modules).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RunPlan;
    use welltrace_core::error::AnomalyKind;
    use welltrace_core::rates::TipType;

    fn resolve(json: &str) -> ResolvedPlan {
        RunPlan::from_json(json).unwrap().resolve().unwrap()
    }

    #[tokio::test]
    async fn runs_plan_through_tracker() {
        let plan = resolve(
            r#"{
                "labware": [{ "label": "plate", "load_name": "corning_96_wellplate_360ul_flat", "slot": "2" }],
                "pipettes": [{ "name": "p300_single_gen2", "tip_racks": ["opentrons_96_tiprack_300ul"] }],
                "tracking": [{ "labware": "plate", "capacity": 200 }],
                "steps": [
                    { "instrument": "p300_single_gen2", "call": "pick_up_tip" },
                    { "instrument": "p300_single_gen2", "call": "dispense", "args": [150, "plate:A1"] },
                    { "instrument": "p300_single_gen2", "call": "dispense", "args": [80, "plate:A1"] },
                    { "call": "blow_out" },
                    { "instrument": "p300_single_gen2", "call": "drop_tip" }
                ]
            }"#,
        );
        let tracker = Tracker::new();
        let deck = Deck::load(&tracker, &plan);

        let completed = deck.execute(&tracker, &plan.steps).await.unwrap();

        assert_eq!(completed, 5);
        let a1 = plan.labware["plate"].well("A1").unwrap();
        assert_eq!(tracker.well_volume(&a1), Some(200.0));
        assert_eq!(tracker.anomaly_count(AnomalyKind::CapacityExceeded), 1);
        assert_eq!(tracker.anomaly_count(AnomalyKind::UnresolvedInstrument), 1);
        assert_eq!(tracker.get_tip_usage().get(&TipType::new("p300")), Some(&1));
        assert_eq!(deck.run_log()["p300_single_gen2"].len(), 4);
    }

    #[tokio::test]
    async fn stops_at_first_driver_failure() {
        let plan = resolve(
            r#"{
                "labware": [{ "label": "plate", "load_name": "corning_96_wellplate_360ul_flat", "slot": "2" }],
                "pipettes": [{ "name": "p20_single_gen2", "tip_racks": ["opentrons_96_tiprack_20ul"] }],
                "steps": [
                    { "instrument": "p20_single_gen2", "call": "aspirate", "args": [10, "plate:A1"] },
                    { "instrument": "p20_single_gen2", "call": "pick_up_tip" }
                ]
            }"#,
        );
        let tracker = Tracker::new();
        let deck = Deck::load(&tracker, &plan);

        let failure = deck.execute(&tracker, &plan.steps).await.unwrap_err();

        assert_eq!(failure.step, 1);
        assert_eq!(failure.call, "aspirate");
        assert!(failure.error.contains("without a tip"));
        assert!(tracker.get_tip_usage().is_empty());
    }
}
