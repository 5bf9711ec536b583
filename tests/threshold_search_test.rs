//! OVP/OCP trip-point searches through the execution host.

mod common;

use power_bench::instrument::capabilities::ProtectionKind;
use power_bench::instrument::mock::SimulatedBench;
use power_bench::measurement::{SampleRecord, SearchOutcome};
use power_bench::procedures::ThresholdSearchProcedure;
use power_bench::TestExecutionHost;

fn outcome_of(records: Vec<SampleRecord>) -> SearchOutcome {
    records
        .into_iter()
        .find_map(|record| match record {
            SampleRecord::Threshold(outcome) => Some(outcome),
            _ => None,
        })
        .expect("No threshold record emitted")
}

#[tokio::test]
async fn test_ocp_search_converges_on_trip_point() {
    let bench = SimulatedBench::default();
    bench.set_trip_point(ProtectionKind::Ocp, 10.3);
    let host = TestExecutionHost::new(bench.instrument_set(false, false));
    let config = common::config(&[
        ("protection.kind", "ocp"),
        ("protection.level", "10"),
        ("protection.delta_min", "0.01"),
        ("protection.compliance", "5"),
        ("protection.load_voltage", "1"),
        ("protection.tolerance.gain", "0.05"),
    ]);

    let handle = host
        .start(Box::new(ThresholdSearchProcedure::new()), config)
        .expect("Failed to start search");
    let (outcome, events) = handle.collect().await.expect("Run supervisor failed");

    assert!(outcome.is_completed());
    assert!(outcome.result().success, "{}", outcome.result().summary());
    assert_eq!(common::terminal_count(&events), 1);

    let search = outcome_of(common::records(&events));
    assert_eq!(search.target, 10.0);
    assert!(
        (search.trip_point - 10.3).abs() < 0.01,
        "trip point {}",
        search.trip_point
    );
    assert!(search.trip_point >= 9.0 && search.trip_point <= 11.0 + 1e-9);
    assert!(search.pass);

    // Every probe clears the latch it may have set.
    let counters = bench.counters();
    assert!(counters.protection_clears >= search.iterations);
    assert_eq!(bench.tripped(), None);
    assert!(!bench.output_on());
}

#[tokio::test]
async fn test_ovp_search_converges_on_trip_point() {
    let bench = SimulatedBench::default();
    bench.set_trip_point(ProtectionKind::Ovp, 10.2);
    let host = TestExecutionHost::new(bench.instrument_set(false, false));
    let config = common::config(&[
        ("protection.kind", "ovp"),
        ("protection.level", "10"),
        ("protection.compliance", "1"),
        ("protection.tolerance.gain", "0.05"),
    ]);

    let handle = host
        .start(Box::new(ThresholdSearchProcedure::new()), config)
        .expect("Failed to start search");
    let (outcome, events) = handle.collect().await.expect("Run supervisor failed");

    assert!(outcome.is_completed());
    let search = outcome_of(common::records(&events));
    assert!(
        (search.trip_point - 10.2).abs() < 0.01,
        "trip point {}",
        search.trip_point
    );
    assert_eq!(search.iterations, 12);
}

#[tokio::test]
async fn test_trip_point_outside_tolerance_fails_check() {
    let bench = SimulatedBench::default();
    bench.set_trip_point(ProtectionKind::Ovp, 10.8);
    let host = TestExecutionHost::new(bench.instrument_set(false, false));
    let config = common::config(&[
        ("protection.kind", "ovp"),
        ("protection.level", "10"),
        ("protection.compliance", "1"),
        ("protection.tolerance.gain", "0.02"),
    ]);

    let handle = host
        .start(Box::new(ThresholdSearchProcedure::new()), config)
        .expect("Failed to start search");
    let (outcome, events) = handle.collect().await.expect("Run supervisor failed");

    // The run completes; the verdict is a failed check, not an abort.
    assert!(outcome.is_completed());
    assert!(!outcome.result().success);
    assert_eq!(outcome.result().quality.checks_failed, 1);
    assert!(!outcome_of(common::records(&events)).pass);
}

#[tokio::test]
async fn test_ocp_without_load_voltage_is_rejected() {
    let bench = SimulatedBench::default();
    let host = TestExecutionHost::new(bench.instrument_set(false, false));
    let config = common::config(&[
        ("protection.kind", "ocp"),
        ("protection.level", "10"),
        ("protection.compliance", "5"),
    ]);

    let err = host
        .start(Box::new(ThresholdSearchProcedure::new()), config)
        .unwrap_err();

    assert!(err.to_string().contains("load_voltage"));
    assert_eq!(bench.counters().outputs_enabled, 0);
}
