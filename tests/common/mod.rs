//! Shared helpers for the integration tests.
#![allow(dead_code)]

use power_bench::measurement::SampleRecord;
use power_bench::{HostEvent, TestConfig};
use std::sync::Arc;

/// Simulated instruments, no settling delays, fast meter polling.
pub fn config(extra: &[(&str, &str)]) -> Arc<TestConfig> {
    let mut entries = vec![
        ("instruments.source.kind", "simulated"),
        ("instruments.load.kind", "simulated"),
        ("instruments.meter.kind", "simulated"),
        ("delays.settle", "0ms"),
        ("delays.output_enable", "0ms"),
        ("delays.protection_clear", "0ms"),
        ("sync.poll_interval", "1ms"),
    ];
    entries.extend_from_slice(extra);
    Arc::new(TestConfig::from_flat_map(entries).expect("Failed to build test config"))
}

/// Sample records in emission order.
pub fn records(events: &[HostEvent]) -> Vec<SampleRecord> {
    events
        .iter()
        .filter_map(|event| match event {
            HostEvent::Sample(record) => Some(record.clone()),
            _ => None,
        })
        .collect()
}

/// Terminal events seen.
pub fn terminal_count(events: &[HostEvent]) -> usize {
    events.iter().filter(|event| event.is_terminal()).count()
}

/// Progress lines seen.
pub fn progress_lines(events: &[HostEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            HostEvent::ProgressText(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}
