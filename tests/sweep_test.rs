//! Sweep runs through the execution host against the simulated bench.

mod common;

use power_bench::instrument::mock::SimulatedBench;
use power_bench::measurement::{Sample, SampleRecord};
use power_bench::procedures::{ResultValue, SweepProcedure};
use power_bench::TestExecutionHost;

fn sweep_samples(records: Vec<SampleRecord>) -> Vec<Sample> {
    records
        .into_iter()
        .filter_map(|record| match record {
            SampleRecord::Sweep(sample) => Some(sample),
            _ => None,
        })
        .collect()
}

fn grid(current: &'static str, power_limit: &'static str) -> Vec<(&'static str, &'static str)> {
    vec![
        ("sweep.voltage.min", "0"),
        ("sweep.voltage.max", "10"),
        ("sweep.voltage.step", "5"),
        ("sweep.current.min", current),
        ("sweep.current.max", current),
        ("sweep.current.step", "1"),
        ("sweep.power_limit", power_limit),
        ("sweep.readback_tolerance.offset", "0.05"),
    ]
}

#[tokio::test]
async fn test_grid_without_truncation() {
    let bench = SimulatedBench::default();
    let host = TestExecutionHost::new(bench.instrument_set(true, false));
    let config = common::config(&grid("1", "1000"));

    let handle = host
        .start(Box::new(SweepProcedure::new()), config)
        .expect("Failed to start sweep");
    let (outcome, events) = handle.collect().await.expect("Run supervisor failed");

    assert!(outcome.is_completed());
    assert!(outcome.result().success, "{}", outcome.result().summary());
    assert_eq!(common::terminal_count(&events), 1);
    assert!(events.last().is_some_and(|e| e.is_terminal()));

    let samples = sweep_samples(common::records(&events));
    let voltages: Vec<f64> = samples.iter().map(|s| s.programmed.voltage).collect();
    assert_eq!(voltages, vec![0.0, 5.0, 10.0]);
    for (index, sample) in samples.iter().enumerate() {
        assert_eq!(sample.index, index);
        assert_eq!(sample.programmed.current, 1.0);
        assert!((sample.measured_at_source.current - 1.0).abs() < 1e-9);
        assert!((sample.measured_at_meter - sample.measured_at_source.voltage).abs() < 1e-9);
        assert!(sample.ripple_pp.is_some());
    }
    assert_eq!(
        outcome.result().data.get("truncated_rows"),
        Some(&ResultValue::Count(0))
    );

    // Safe state after the run.
    assert!(!bench.output_on());
    assert!(!bench.input_on());
    assert_eq!(bench.counters().topology_resets, 1);
}

#[tokio::test]
async fn test_power_limit_truncates_row() {
    let bench = SimulatedBench::default();
    let host = TestExecutionHost::new(bench.instrument_set(false, false));
    let config = common::config(&grid("8", "40"));

    let handle = host
        .start(Box::new(SweepProcedure::new()), config)
        .expect("Failed to start sweep");
    let (outcome, events) = handle.collect().await.expect("Run supervisor failed");

    assert!(outcome.is_completed());
    let samples = sweep_samples(common::records(&events));
    let voltages: Vec<f64> = samples.iter().map(|s| s.programmed.voltage).collect();
    assert_eq!(voltages, vec![0.0, 5.0]);
    for sample in &samples {
        assert!(sample.programmed.power() <= 40.0);
        assert!(sample.ripple_pp.is_none());
    }

    let result = outcome.result();
    assert_eq!(result.data.get("samples"), Some(&ResultValue::Count(2)));
    assert_eq!(result.data.get("truncated_rows"), Some(&ResultValue::Count(1)));
    assert!(result.warnings.iter().any(|w| w.contains("truncated")));
}

#[tokio::test]
async fn test_power_mode_loads_in_constant_power() {
    let bench = SimulatedBench::default();
    let host = TestExecutionHost::new(bench.instrument_set(false, false));
    let config = common::config(&[
        ("sweep.mode", "power"),
        ("sweep.voltage.min", "10"),
        ("sweep.voltage.max", "20"),
        ("sweep.voltage.step", "10"),
        ("sweep.current.max", "5"),
        ("sweep.power.min", "0"),
        ("sweep.power.max", "50"),
        ("sweep.power.step", "25"),
        ("sweep.power_limit", "1000"),
        ("sweep.readback_tolerance.offset", "0.05"),
    ]);

    let handle = host
        .start(Box::new(SweepProcedure::new()), config)
        .expect("Failed to start sweep");
    let (outcome, events) = handle.collect().await.expect("Run supervisor failed");

    assert!(outcome.is_completed());
    assert!(outcome.result().success, "{}", outcome.result().summary());
    let samples = sweep_samples(common::records(&events));
    assert_eq!(samples.len(), 6);

    // First power point is biased off zero: 1 W at 10 V.
    assert!((samples[0].measured_at_source.current - 0.1).abs() < 1e-9);
    assert!((samples[2].measured_at_source.current - 5.0).abs() < 1e-9);
    assert!(samples[3..].iter().all(|s| s.programmed.voltage == 20.0));
}

#[tokio::test]
async fn test_progress_reaches_completion() {
    let bench = SimulatedBench::default();
    let host = TestExecutionHost::new(bench.instrument_set(false, false));
    let config = common::config(&grid("1", "1000"));

    let handle = host
        .start(Box::new(SweepProcedure::new()), config)
        .expect("Failed to start sweep");
    let (_, events) = handle.collect().await.expect("Run supervisor failed");

    let percents: Vec<u8> = events
        .iter()
        .filter_map(|event| match event {
            power_bench::HostEvent::ProgressPercent(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));
    assert!(common::progress_lines(&events)
        .iter()
        .any(|line| line.contains("3 planned points")));
}

#[tokio::test]
async fn test_power_mode_keeps_current_inside_axis() {
    let bench = SimulatedBench::default();
    let host = TestExecutionHost::new(bench.instrument_set(false, false));
    let config = common::config(&[
        ("sweep.mode", "power"),
        ("sweep.voltage.min", "10"),
        ("sweep.voltage.max", "10"),
        ("sweep.current.min", "1"),
        ("sweep.current.max", "5"),
        ("sweep.power.min", "20"),
        ("sweep.power.max", "80"),
        ("sweep.power.step", "20"),
        ("sweep.power_limit", "1000"),
        ("sweep.readback_tolerance.offset", "0.05"),
    ]);

    let handle = host
        .start(Box::new(SweepProcedure::new()), config)
        .expect("Failed to start sweep");
    let (outcome, events) = handle.collect().await.expect("Run supervisor failed");

    assert!(outcome.is_completed());
    assert!(outcome.result().success, "{}", outcome.result().summary());
    let samples = sweep_samples(common::records(&events));
    let currents: Vec<f64> = samples.iter().map(|s| s.programmed.current).collect();
    assert_eq!(currents, vec![2.0, 4.0]);
    for sample in &samples {
        // The source stays in CV: no collapse to 0 V at the current limit.
        assert!(sample.measured_at_source.voltage > 9.9);
        assert!(sample.pass);
    }
    assert_eq!(
        outcome.result().data.get("truncated_rows"),
        Some(&ResultValue::Count(1))
    );
}

#[tokio::test]
async fn test_sample_records_carry_deltas_and_verdict() {
    let bench = SimulatedBench::default();
    let host = TestExecutionHost::new(bench.instrument_set(false, false));
    let mut entries = grid("2", "1000");
    entries.push(("sweep.current_tolerance.offset", "0.01"));
    let config = common::config(&entries);

    let handle = host
        .start(Box::new(SweepProcedure::new()), config)
        .expect("Failed to start sweep");
    let (outcome, events) = handle.collect().await.expect("Run supervisor failed");
    assert!(outcome.is_completed());

    let records = common::records(&events);
    assert_eq!(records.len(), 3);
    for record in &records {
        let json = serde_json::to_value(record).expect("Record is not serializable");
        assert_eq!(json["kind"], "sweep");
        assert_eq!(json["pass"], true);
        for field in ["voltage_delta", "current_delta", "meter_delta"] {
            assert!(json[field].is_f64(), "{field} missing from {json}");
        }
    }

    // 2 A through 2 mΩ drops 4 mV at the source terminals.
    let samples = sweep_samples(records);
    assert!((samples[1].voltage_delta + 0.004).abs() < 1e-9);
    assert!(samples[1].current_delta.abs() < 1e-12);
    assert!(samples[1].meter_delta.abs() < 1e-9);
    // Three checks per sample: voltage, current, meter.
    assert_eq!(outcome.result().quality.checks_passed, 9);
}
