//! End-to-end tests: simulated instruments driven through the tracking
//! wrappers, checking the ledger, tip counter, rates and the ordered log.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{p20_sim, p300_sim, reservoir, Bench, JammedPipette};

use welltrace_core::driver::{DriverError, PipetteDriver};
use welltrace_core::error::AnomalyKind;
use welltrace_core::log::{JsonlSink, LogEntry, LogLevel};
use welltrace_core::operation::Operation;
use welltrace_core::rates::{RateKind, TipType};
use welltrace_core::tracker::Tracker;

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_repeated_aspirate_from_full_well() {
    let bench = Bench::new(360.0, 360.0);
    let a1 = bench.well("A1");
    bench.p300.pick_up_tip().await.unwrap();

    let mut volumes = Vec::new();
    for _ in 0..3 {
        bench.p300.aspirate(20.0, &a1, None).await.unwrap();
        volumes.push(bench.volume("A1"));
    }

    assert_eq!(volumes, [340.0, 320.0, 300.0]);
    assert!(bench.tracker.errors().is_empty());
}

#[tokio::test]
async fn test_dispense_past_capacity_clamps_once() {
    let bench = Bench::new(200.0, 0.0);
    let a1 = bench.well("A1");
    bench.p300.pick_up_tip().await.unwrap();

    bench.p300.dispense(150.0, &a1, None).await.unwrap();
    assert_eq!(bench.volume("A1"), 150.0);
    assert_eq!(bench.tracker.anomaly_count(AnomalyKind::CapacityExceeded), 0);

    bench.p300.dispense(80.0, &a1, None).await.unwrap();
    assert_eq!(bench.volume("A1"), 200.0);
    assert_eq!(bench.tracker.anomaly_count(AnomalyKind::CapacityExceeded), 1);

    let errors = bench.tracker.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("maximum capacity of 200 µL"));
}

#[tokio::test]
async fn test_invalid_volumes_are_logged_and_forwarded() {
    let bench = Bench::new(200.0, 0.0);
    let a1 = bench.well("A1");
    let b1 = bench.well("B1");
    bench.p300.pick_up_tip().await.unwrap();
    bench.p300.dispense(120.0, &b1, None).await.unwrap();

    for volume in [-50.0, f64::NAN, f64::INFINITY] {
        let err = bench.p300.dispense(volume, &a1, None).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }
    let err = bench.p300.aspirate(f64::NAN, &b1, None).await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidArgument(_)));

    assert_eq!(bench.volume("A1"), 0.0);
    assert_eq!(bench.volume("B1"), 120.0);
    assert_eq!(bench.tracker.anomaly_count(AnomalyKind::InvalidVolume), 4);
    assert_eq!(bench.tracker.anomaly_count(AnomalyKind::VolumeShortfall), 0);
    assert_eq!(bench.tracker.errors().len(), 4);
}

#[tokio::test]
async fn test_sequential_dispenses_within_capacity() {
    let bench = Bench::new(360.0, 0.0);
    let b2 = bench.well("B2");
    bench.p300.pick_up_tip().await.unwrap();

    for volume in [50.0, 75.0, 100.0, 135.0] {
        bench.p300.dispense(volume, &b2, None).await.unwrap();
    }

    assert_eq!(bench.volume("B2"), 360.0);
    assert_eq!(bench.tracker.anomaly_count(AnomalyKind::CapacityExceeded), 0);
}

#[tokio::test]
async fn test_aspirate_more_than_available() {
    let bench = Bench::new(360.0, 30.0);
    let c3 = bench.well("C3");
    bench.p300.pick_up_tip().await.unwrap();

    bench.p300.aspirate(50.0, &c3, None).await.unwrap();

    assert_eq!(bench.volume("C3"), 0.0);
    assert_eq!(bench.tracker.anomaly_count(AnomalyKind::VolumeShortfall), 1);
    let actions = bench.messages(LogLevel::Action);
    assert_eq!(
        actions.last().unwrap(),
        "p300 aspirated 30 µL from C3 of plate (slot 2) at 92.86 µL/s. Remaining: 0 µL."
    );
}

#[tokio::test]
async fn test_transfer_between_labware() {
    let bench = Bench::new(360.0, 0.0);
    let reservoir = reservoir();
    let mut overrides = HashMap::new();
    overrides.insert("A1".to_string(), 10_000.0);
    bench
        .tracker
        .configure_well_tracking(&reservoir, 15_000.0, 0.0, &overrides);

    let source = reservoir.well("A1").unwrap();
    bench.p300.pick_up_tip().await.unwrap();
    for well in ["A1", "B1", "C1", "D1"] {
        bench.p300.aspirate(100.0, &source, None).await.unwrap();
        bench.p300.dispense(100.0, &bench.well(well), None).await.unwrap();
    }
    bench.p300.drop_tip().await.unwrap();

    assert_eq!(bench.tracker.well_volume(&source), Some(9_600.0));
    assert_eq!(bench.volume("D1"), 100.0);
    assert_eq!(bench.tracker.well_volume(&reservoir.well("A2").unwrap()), Some(0.0));
    assert!(bench.tracker.errors().is_empty());
}

#[tokio::test]
async fn test_configure_twice_is_idempotent() {
    let bench = Bench::new(360.0, 100.0);
    let state_before = bench
        .tracker
        .well_state(&bench.plate.well_key("H12"));

    bench
        .tracker
        .configure_well_tracking(&bench.plate, 360.0, 100.0, &HashMap::new());

    assert_eq!(bench.tracker.well_state(&bench.plate.well_key("H12")), state_before);
    assert!(bench
        .messages(LogLevel::Info)
        .iter()
        .all(|m| !m.starts_with("Kept existing capacity")));
}

#[tokio::test]
async fn test_reconfigure_keeps_capacity() {
    let bench = Bench::new(200.0, 0.0);
    bench
        .tracker
        .configure_well_tracking(&bench.plate, 500.0, 50.0, &HashMap::new());

    let state = bench.tracker.well_state(&bench.plate.well_key("A1"));
    assert_eq!(state.capacity, 200.0);
    assert_eq!(state.current_volume, 50.0);
    assert_eq!(
        bench.messages(LogLevel::Info).last().unwrap(),
        "Kept existing capacity for 96 wells of plate."
    );
}

// ---------------------------------------------------------------------------
// Tips and rates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_tip_usage_per_tip_type() {
    let tracker = Tracker::new();
    let p300 = tracker.wrap_instrument(p300_sim());
    let p20 = tracker.wrap_instrument(p20_sim());

    for _ in 0..3 {
        p300.pick_up_tip().await.unwrap();
        p300.drop_tip().await.unwrap();
    }
    p20.pick_up_tip().await.unwrap();
    p20.drop_tip().await.unwrap();
    p20.drop_tip().await.unwrap();

    let usage = tracker.get_tip_usage();
    assert_eq!(usage.get(&TipType::new("p300")), Some(&3));
    assert_eq!(usage.get(&TipType::new("p20")), Some(&1));
}

#[tokio::test]
async fn test_rates_follow_flow_rate_changes() {
    let bench = Bench::new(360.0, 360.0);
    let a1 = bench.well("A1");
    bench.p300.pick_up_tip().await.unwrap();

    bench.p300.set_flow_rate(RateKind::Aspirate, 150.0).await.unwrap();
    bench.p300.aspirate(10.0, &a1, Some(0.5)).await.unwrap();

    let actions = bench.messages(LogLevel::Action);
    assert!(actions.last().unwrap().contains("at 75.00 µL/s"));
    assert_eq!(
        bench.tracker.resolve_rate(&TipType::new("p300"), RateKind::Dispense),
        Some(92.86)
    );
}

#[tokio::test]
async fn test_invalid_flow_rate_is_logged_and_forwarded() {
    let bench = Bench::new(360.0, 0.0);

    let result = bench.p300.set_flow_rate(RateKind::BlowOut, -5.0).await;

    assert!(matches!(result, Err(DriverError::InvalidArgument(_))));
    assert_eq!(bench.tracker.anomaly_count(AnomalyKind::InvalidRateValue), 1);
    assert_eq!(
        bench.tracker.resolve_rate(&TipType::new("p300"), RateKind::BlowOut),
        Some(92.86)
    );
}

// ---------------------------------------------------------------------------
// Interception guarantees
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unbound_aspirate_returns_forwarded_result() {
    let bench = Bench::new(360.0, 100.0);
    let before = bench.tracker.get_logs().len();
    let op = Operation::Aspirate {
        volume: 20.0,
        location: Some(bench.well("A1")),
        rate: None,
    };

    let result = bench
        .tracker
        .intercept(None, &op, async { Ok::<_, DriverError>("done") })
        .await;

    assert_eq!(result, Ok("done"));
    assert_eq!(bench.tracker.get_logs().len(), before + 1);
    assert_eq!(bench.tracker.anomaly_count(AnomalyKind::UnresolvedInstrument), 1);
    assert_eq!(bench.volume("A1"), 100.0);
}

#[tokio::test]
async fn test_actions_keep_call_order() {
    let bench = Bench::new(360.0, 200.0);
    let a1 = bench.well("A1");
    let b1 = bench.well("B1");

    bench.p300.pick_up_tip().await.unwrap();
    bench.p300.aspirate(50.0, &a1, None).await.unwrap();
    bench.p300.dispense(50.0, &b1, None).await.unwrap();
    bench.p300.mix(3, 20.0, Some(&b1), None).await.unwrap();
    bench.p300.blow_out(None, None).await.unwrap();
    bench.p300.drop_tip().await.unwrap();

    let actions = bench.messages(LogLevel::Action);
    let prefixes = [
        "Picked up",
        "p300 aspirated",
        "p300 dispensed",
        "p300 mixed",
        "Performed blow_out",
        "Dropped",
    ];
    assert_eq!(actions.len(), prefixes.len());
    for (message, prefix) in actions.iter().zip(prefixes) {
        assert!(message.starts_with(prefix), "{} should start with {}", message, prefix);
    }
    assert!(bench.tracker.get_logs().len() >= prefixes.len());
}

#[tokio::test]
async fn test_sink_sees_every_entry() {
    let bench = Bench::new(100.0, 0.0);
    bench.p300.pick_up_tip().await.unwrap();
    bench.p300.dispense(150.0, &bench.well("A1"), None).await.unwrap();

    let seen: Vec<String> = bench.sink.entries().into_iter().map(|e| e.message).collect();
    let kept: Vec<String> = bench.tracker.get_logs().into_iter().map(|e| e.message).collect();
    assert_eq!(seen, kept);
}

#[tokio::test]
async fn test_driver_failure_keeps_logged_entries() {
    let tracker = Tracker::new();
    let pipette = tracker.wrap_instrument(JammedPipette);
    let plate = common::plate();
    tracker.configure_well_tracking(&plate, 360.0, 0.0, &HashMap::new());
    let a1 = plate.well("A1").unwrap();

    let err = pipette.dispense(40.0, &a1, None).await.unwrap_err();
    assert_eq!(err, DriverError::CommandFailed("plunger jammed".to_string()));

    // No rollback: the ledger and the log reflect the attempted call.
    assert_eq!(tracker.well_volume(&a1), Some(40.0));
    let last = tracker.get_logs().pop().unwrap();
    assert_eq!(last.level, LogLevel::Action);
    assert!(last.message.starts_with("p300 dispensed 40 µL"));

    assert!(pipette.pick_up_tip().await.is_err());
    assert_eq!(tracker.get_tip_usage().get(&TipType::new("p300")), Some(&1));
}

#[tokio::test]
async fn test_rewrapped_pipette_counts_once() {
    let tracker = Tracker::new();
    let wrapped = tracker.wrap_instrument(p300_sim());
    let rewrapped = tracker.wrap_instrument(wrapped);
    let plate = common::plate();
    tracker.configure_well_tracking(&plate, 360.0, 0.0, &HashMap::new());
    let a1 = plate.well("A1").unwrap();

    rewrapped.pick_up_tip().await.unwrap();
    rewrapped.dispense(25.0, &a1, None).await.unwrap();

    assert_eq!(tracker.get_tip_usage().get(&TipType::new("p300")), Some(&1));
    assert_eq!(tracker.well_volume(&a1), Some(25.0));
    let dispenses = tracker
        .get_logs()
        .into_iter()
        .filter(|e| e.message.contains("dispensed"))
        .count();
    assert_eq!(dispenses, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_pipettes_share_ledger() {
    let tracker = Tracker::new();
    let plate = Arc::new(common::plate());
    tracker.configure_well_tracking(&plate, 1_000.0, 0.0, &HashMap::new());

    let mut handles = Vec::new();
    for sim in [p300_sim(), p20_sim()] {
        let pipette = tracker.wrap_instrument(sim);
        let plate = plate.clone();
        handles.push(tokio::spawn(async move {
            let a1 = plate.well("A1").unwrap();
            pipette.pick_up_tip().await.unwrap();
            for _ in 0..25 {
                pipette.dispense(10.0, &a1, None).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(tracker.well_volume(&plate.well("A1").unwrap()), Some(500.0));
    let dispenses = tracker
        .get_logs()
        .into_iter()
        .filter(|e| e.message.contains("dispensed 10 µL"))
        .count();
    assert_eq!(dispenses, 50);
}

#[tokio::test]
async fn test_jsonl_audit_trail() {
    let path = std::env::temp_dir().join(format!("welltrace_audit_{}.jsonl", uuid::Uuid::new_v4()));
    let tracker = Tracker::with_sinks(vec![Box::new(JsonlSink::create(&path).unwrap())]);
    let p300 = tracker.wrap_instrument(p300_sim());
    p300.pick_up_tip().await.unwrap();
    p300.drop_tip().await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let entries: Vec<LogEntry> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let kept = tracker.get_logs();
    assert_eq!(entries.len(), kept.len());
    assert_eq!(entries[1].id, kept[1].id);
    assert_eq!(entries[1].level, LogLevel::Action);
    std::fs::remove_file(&path).ok();
}
