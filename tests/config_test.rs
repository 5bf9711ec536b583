//! Loading and validating configuration files.

use power_bench::config::{HistoryMode, RegulationKind, SweepMode, TestConfig, TestKind};
use power_bench::instrument::capabilities::ProtectionKind;
use power_bench::instrument::registry::InstrumentKind;
use power_bench::BenchError;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write temp file");
    file
}

#[test]
fn test_load_toml_file() {
    let file = write_config(
        r#"
        [application]
        log_level = "debug"

        [instruments.source]
        kind = "simulated"

        [instruments.load]
        kind = "simulated"

        [instruments.meter]
        kind = "simulated"
        nplc = 10.0

        [delays]
        settle = "250ms"

        [protection]
        kind = "ocp"
        level = 5.0
        compliance = 12.0
        load_voltage = 2.0
        history = "latched"
        "#,
    );

    let config = TestConfig::load_from(file.path()).expect("Failed to load config");
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.instruments.meter.nplc, 10.0);
    assert_eq!(config.delays.settle, Duration::from_millis(250));
    // Untouched delays keep their defaults.
    assert_eq!(config.delays.output_enable, Duration::from_millis(200));

    let protection = config.protection.as_ref().expect("protection section");
    assert_eq!(protection.kind, ProtectionKind::Ocp);
    assert_eq!(protection.history, HistoryMode::Latched);
    assert_eq!(protection.delta_min, 0.01);
    assert!(config.validate_for(TestKind::Protection).is_ok());
    assert!(config.validate_for(TestKind::Sweep).is_err());
}

#[test]
fn test_missing_file_is_reported() {
    let err = TestConfig::load_from("does/not/exist.toml").unwrap_err();
    assert!(matches!(err, BenchError::ConfigValidation(_)));
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_unknown_instrument_kind_is_rejected() {
    let file = write_config(
        r#"
        [instruments.source]
        kind = "acme_9000"
        [instruments.load]
        kind = "simulated"
        [instruments.meter]
        kind = "simulated"
        "#,
    );

    let err = TestConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, BenchError::Config(_)));
}

#[test]
fn test_role_mismatch_is_rejected() {
    let file = write_config(
        r#"
        [instruments.source]
        kind = "chroma_63600"
        address = "10.0.0.1:2101"
        [instruments.load]
        kind = "simulated"
        [instruments.meter]
        kind = "simulated"
        "#,
    );

    let config = TestConfig::load_from(file.path()).expect("Failed to load config");
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("cannot act as source"));
}

#[test]
fn test_shipped_bench_config_is_valid() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/bench.toml");
    let config = TestConfig::load_from(&path).expect("Failed to load bench.toml");

    config.validate().expect("bench.toml does not validate");
    for kind in [TestKind::Sweep, TestKind::Protection, TestKind::Regulation] {
        assert!(config.validate_for(kind).is_ok());
    }
    assert_eq!(config.instruments.source.kind, InstrumentKind::KeysightN6700);
    assert_eq!(
        config.sweep.as_ref().map(|s| s.mode),
        Some(SweepMode::CurrentVoltage)
    );
    assert_eq!(
        config.regulation.as_ref().map(|r| r.kind),
        Some(RegulationKind::LoadCv)
    );

    let simulated = config.simulated();
    assert_eq!(simulated.instruments.meter.kind, InstrumentKind::Simulated);
    assert_eq!(
        simulated.instruments.line_supply.map(|def| def.kind),
        Some(InstrumentKind::Simulated)
    );
}
