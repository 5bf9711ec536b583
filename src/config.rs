//! Test configuration using Figment
//!
//! A [`TestConfig`] is built once per run and never mutated afterwards.
//! It is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `POWER_BENCH_`, nested keys split
//!    on `__` (`POWER_BENCH_APPLICATION__LOG_LEVEL=debug`)
//!
//! or from a flat dotted key/value map, which is what a form-based front end
//! naturally produces:
//!
//! ```no_run
//! use power_bench::config::TestConfig;
//!
//! let config = TestConfig::from_flat_map([
//!     ("instruments.source.kind", "simulated"),
//!     ("instruments.load.kind", "simulated"),
//!     ("instruments.meter.kind", "simulated"),
//!     ("sweep.voltage.max", "10"),
//! ])?;
//! # Ok::<(), power_bench::error::BenchError>(())
//! ```
//!
//! Validation happens separately through [`TestConfig::validate`] and
//! [`TestConfig::validate_for`]; the host calls both before touching any
//! instrument.

use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::{ProtectionKind, TriggerSource};
use crate::instrument::registry::InstrumentKind;
use crate::measurement::{ReadbackTolerance, Tolerance};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "POWER_BENCH_";

/// Most points a single sweep axis may plan.
pub const MAX_AXIS_POINTS: usize = 100_000;

/// Top-level test configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument assignments by role.
    pub instruments: InstrumentsConfig,
    /// Settling delays.
    #[serde(default)]
    pub delays: DelayConfig,
    /// Meter synchronization bounds.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Behaviour of simulated instruments.
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Sweep parameters.
    #[serde(default)]
    pub sweep: Option<SweepConfig>,
    /// OVP/OCP search parameters.
    #[serde(default)]
    pub protection: Option<ProtectionConfig>,
    /// Regulation check parameters.
    #[serde(default)]
    pub regulation: Option<RegulationConfig>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where JSON diagnostic traces are written when a run errors.
    #[serde(default)]
    pub diagnostics_dir: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            diagnostics_dir: None,
        }
    }
}

/// Instruments by bench role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentsConfig {
    /// The device under test.
    pub source: InstrumentDefinition,
    /// Electronic load.
    pub load: InstrumentDefinition,
    /// Reference meter.
    pub meter: InstrumentDefinition,
    /// Optional oscilloscope for ripple.
    #[serde(default)]
    pub scope: Option<InstrumentDefinition>,
    /// Supply feeding the DUT input, required for line regulation.
    #[serde(default)]
    pub line_supply: Option<InstrumentDefinition>,
}

/// One instrument assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Vendor model family; selects the command dialect.
    pub kind: InstrumentKind,
    /// `host:port` of the raw SCPI socket. Ignored for simulated instruments.
    #[serde(default)]
    pub address: String,
    /// Output/input/measurement channel, 1-based.
    #[serde(default = "default_channel")]
    pub channel: u32,
    /// Per-read transport timeout.
    #[serde(with = "humantime_serde", default = "default_io_timeout")]
    pub timeout: Duration,
    /// Meter integration time in power-line cycles.
    #[serde(default = "default_nplc")]
    pub nplc: f64,
    /// Meter trigger source.
    #[serde(default)]
    pub trigger: TriggerSource,
}

/// Settling delays applied after programming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    /// After programming a set-point, before measuring.
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
    /// After switching an output or input on.
    #[serde(with = "humantime_serde", default = "default_output_enable")]
    pub output_enable: Duration,
    /// After clearing a protection latch.
    #[serde(with = "humantime_serde", default = "default_protection_clear")]
    pub protection_clear: Duration,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            settle: default_settle(),
            output_enable: default_output_enable(),
            protection_clear: default_protection_clear(),
        }
    }
}

impl DelayConfig {
    /// All delays zero. Used by tests against simulated instruments.
    pub fn none() -> Self {
        Self {
            settle: Duration::ZERO,
            output_enable: Duration::ZERO,
            protection_clear: Duration::ZERO,
        }
    }
}

/// Bounds for meter acquisition polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum status polls per acquisition.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    /// Sleep between polls.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Wall-clock bound per acquisition.
    #[serde(with = "humantime_serde", default = "default_sync_timeout")]
    pub timeout: Duration,
    /// Extra attempts after a measurement timeout during a sweep.
    #[serde(default = "default_measurement_retries")]
    pub measurement_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_polls: default_max_polls(),
            poll_interval: default_poll_interval(),
            timeout: default_sync_timeout(),
            measurement_retries: default_measurement_retries(),
        }
    }
}

/// Knobs for [`InstrumentKind::Simulated`] instruments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Protection trips at `level × trip_ratio`.
    #[serde(default = "default_trip_ratio")]
    pub trip_ratio: f64,
    /// Status polls before a simulated acquisition completes.
    #[serde(default = "default_acquisition_polls")]
    pub acquisition_polls: u32,
    /// Output resistance used to model load regulation, in ohms.
    #[serde(default = "default_output_resistance")]
    pub output_resistance: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            trip_ratio: default_trip_ratio(),
            acquisition_polls: default_acquisition_polls(),
            output_resistance: default_output_resistance(),
        }
    }
}

// =============================================================================
// Sweep
// =============================================================================

/// Closed range stepped from `min` to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// First value.
    #[serde(default)]
    pub min: f64,
    /// Last value; every stepped value is clamped to it.
    pub max: f64,
    /// Increment. Ignored when `min == max`.
    #[serde(default = "default_step")]
    pub step: f64,
}

impl AxisRange {
    /// A single-point axis.
    pub fn fixed(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            step: 1.0,
        }
    }

    /// Number of points: `ceil((max - min) / step) + 1`, or 1 for a fixed axis.
    pub fn points(&self) -> usize {
        if self.max <= self.min || self.step <= 0.0 {
            return 1;
        }
        // Guard against 10.000000001 / 5 style float noise.
        let spans = ((self.max - self.min) / self.step - 1e-9).ceil();
        (spans.max(0.0) as usize).saturating_add(1)
    }

    /// Value at `index`, clamped to `max`.
    pub fn value_at(&self, index: usize) -> f64 {
        (self.min + index as f64 * self.step).min(self.max)
    }
}

/// What a sweep steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    /// Voltage × current grid.
    #[default]
    CurrentVoltage,
    /// Load in constant power, one row per source voltage.
    Power,
}

/// Which side regulates during a current/voltage sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    /// Source programs voltage, load sinks current in CC.
    #[default]
    SourceCv,
    /// Source programs current, load holds voltage in CV.
    SourceCc,
}

/// The axis stepped by the inner loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InnerAxis {
    /// Voltage is inner, current outer.
    #[default]
    Voltage,
    /// Current is inner, voltage outer.
    Current,
}

/// Sweep parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Grid or constant-power sweep.
    #[serde(default)]
    pub mode: SweepMode,
    /// Regulating side.
    #[serde(default)]
    pub role: SourceRole,
    /// Inner axis of a current/voltage grid.
    #[serde(default)]
    pub inner_axis: InnerAxis,
    /// Voltage axis. In power mode each value is one row.
    pub voltage: AxisRange,
    /// Current axis. In power mode it bounds the current the load draws and
    /// `max` is the source limit.
    pub current: AxisRange,
    /// Power axis, required in power mode.
    #[serde(default)]
    pub power: Option<AxisRange>,
    /// Projected power above which a row is truncated, in watts.
    pub power_limit: f64,
    /// Source current limit. Defaults to `current.max + sink_margin`.
    #[serde(default)]
    pub source_current_limit: Option<f64>,
    /// Head-room between the source limit and the sink ceiling.
    #[serde(default = "default_sink_margin")]
    pub sink_margin: f64,
    /// Added to a load-driven axis that starts at 0.
    #[serde(default = "default_zero_bias")]
    pub zero_bias: f64,
    /// Source voltage above `voltage.max` while the load holds voltage.
    #[serde(default = "default_voltage_headroom")]
    pub voltage_headroom: f64,
    /// Source read-back voltage tolerance, also applied to the meter reading.
    #[serde(default)]
    pub readback_tolerance: Tolerance,
    /// Source read-back current tolerance.
    #[serde(default)]
    pub current_tolerance: Tolerance,
}

impl SweepConfig {
    /// Programmed source current limit.
    pub fn effective_source_current_limit(&self) -> f64 {
        self.source_current_limit
            .unwrap_or(self.current.max + self.sink_margin)
    }

    /// Tolerances every sample is graded against.
    pub fn readback(&self) -> ReadbackTolerance {
        ReadbackTolerance {
            voltage: self.readback_tolerance,
            current: self.current_tolerance,
        }
    }

    /// Highest current the load may be asked to sink.
    pub fn sink_ceiling(&self) -> f64 {
        let limit = self.effective_source_current_limit();
        if (limit - self.current.max).abs() < f64::EPSILON {
            self.current.max - self.sink_margin
        } else {
            self.current.max
        }
    }
}

// =============================================================================
// Protection search
// =============================================================================

/// How the search remembers the previous probe status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// Previous status follows the last observed status.
    #[default]
    Tracking,
    /// Previous status stays at its initial `Normal`.
    Latched,
}

/// OVP/OCP trip-point search parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Circuit under test.
    pub kind: ProtectionKind,
    /// Programmed protection level.
    pub level: f64,
    /// Search stops once the step is at or below this.
    #[serde(default = "default_delta_min")]
    pub delta_min: f64,
    /// Accepted trip-point deviation.
    #[serde(default)]
    pub tolerance: Tolerance,
    /// Previous-status bookkeeping.
    #[serde(default)]
    pub history: HistoryMode,
    /// The other source set-point: current limit during OVP, voltage during OCP.
    pub compliance: f64,
    /// CV set-point the load holds during OCP so the source enters CC.
    #[serde(default)]
    pub load_voltage: Option<f64>,
}

// =============================================================================
// Regulation
// =============================================================================

/// Which regulation figure is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegulationKind {
    /// Source in CV; load current stepped; output voltage compared.
    LoadCv,
    /// Source in CC; load voltage stepped; output current compared.
    LoadCc,
    /// Source in CV; line supply voltage stepped; output voltage compared.
    Line,
}

/// Regulation check parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulationConfig {
    /// Figure under test.
    pub kind: RegulationKind,
    /// Rated output the tolerance is scaled from.
    pub rated: f64,
    /// Source regulating set-point (V for CV kinds, A for CC).
    pub setpoint: f64,
    /// Source limit on the other axis (A for CV kinds, V for CC).
    pub limit: f64,
    /// Perturbation at the reference condition.
    pub reference: f64,
    /// Perturbation at the stressed condition.
    pub perturbed: f64,
    /// Load current held during a line regulation check.
    #[serde(default)]
    pub load_setpoint: f64,
    /// Allowed deviation, scaled from `rated`.
    #[serde(default)]
    pub tolerance: Tolerance,
    /// Backoff attempts when the source leaves its mode.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fractional reduction of the perturbation per retry.
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

// =============================================================================
// Test kinds
// =============================================================================

/// Test families the host can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    /// Current/voltage or power sweep.
    Sweep,
    /// OVP/OCP trip-point search.
    Protection,
    /// Load or line regulation.
    Regulation,
}

// Default value functions
fn default_app_name() -> String {
    "power_bench".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel() -> u32 {
    1
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_nplc() -> f64 {
    1.0
}

fn default_settle() -> Duration {
    Duration::from_millis(500)
}

fn default_output_enable() -> Duration {
    Duration::from_millis(200)
}

fn default_protection_clear() -> Duration {
    Duration::from_millis(500)
}

fn default_max_polls() -> u32 {
    100
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_sync_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_measurement_retries() -> u32 {
    2
}

fn default_trip_ratio() -> f64 {
    1.02
}

fn default_acquisition_polls() -> u32 {
    2
}

fn default_output_resistance() -> f64 {
    0.002
}

fn default_step() -> f64 {
    1.0
}

fn default_sink_margin() -> f64 {
    0.1
}

fn default_zero_bias() -> f64 {
    1.0
}

fn default_voltage_headroom() -> f64 {
    1.0
}

fn default_delta_min() -> f64 {
    0.01
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff() -> f64 {
    0.05
}

impl TestConfig {
    /// Load configuration from a TOML file plus `POWER_BENCH_` overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BenchError::ConfigValidation(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Build configuration from dotted keys such as `sweep.voltage.max`.
    ///
    /// Values are parsed as bool, integer or float where possible and kept
    /// as strings otherwise. Environment overrides still apply.
    pub fn from_flat_map<I, K, V>(entries: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut root = toml::Table::new();
        for (key, value) in entries {
            insert_dotted(&mut root, key.as_ref(), parse_scalar(value.as_ref()))?;
        }
        let config = Figment::from(Serialized::defaults(toml::Value::Table(root)))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate everything that does not depend on the test kind.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let instruments = &self.instruments;
        for (role, def) in instruments.assignments() {
            def.kind.check_role(role)?;
            if def.kind != InstrumentKind::Simulated && def.address.trim().is_empty() {
                return invalid(format!("instruments.{role}.address is required"));
            }
            if def.channel == 0 {
                return invalid(format!("instruments.{role}.channel is 1-based"));
            }
            if def.timeout.is_zero() {
                return invalid(format!("instruments.{role}.timeout must be non-zero"));
            }
        }
        if instruments.meter.nplc <= 0.0 {
            return invalid("instruments.meter.nplc must be positive");
        }

        if self.sync.max_polls == 0 {
            return invalid("sync.max_polls must be at least 1");
        }
        if self.sync.timeout.is_zero() {
            return invalid("sync.timeout must be non-zero");
        }
        if self.simulation.trip_ratio <= 0.0 {
            return invalid("simulation.trip_ratio must be positive");
        }

        if let Some(sweep) = &self.sweep {
            validate_sweep(sweep)?;
        }
        if let Some(protection) = &self.protection {
            validate_protection(protection)?;
        }
        if let Some(regulation) = &self.regulation {
            validate_regulation(regulation, instruments.line_supply.is_some())?;
        }
        Ok(())
    }

    /// Validate and require the section `kind` needs.
    pub fn validate_for(&self, kind: TestKind) -> AppResult<()> {
        self.validate()?;
        let present = match kind {
            TestKind::Sweep => self.sweep.is_some(),
            TestKind::Protection => self.protection.is_some(),
            TestKind::Regulation => self.regulation.is_some(),
        };
        if !present {
            let section = match kind {
                TestKind::Sweep => "sweep",
                TestKind::Protection => "protection",
                TestKind::Regulation => "regulation",
            };
            return invalid(format!("[{section}] section is required for this test"));
        }
        Ok(())
    }

    /// Force every instrument to [`InstrumentKind::Simulated`].
    pub fn simulated(mut self) -> Self {
        let instruments = &mut self.instruments;
        instruments.source.kind = InstrumentKind::Simulated;
        instruments.load.kind = InstrumentKind::Simulated;
        instruments.meter.kind = InstrumentKind::Simulated;
        if let Some(scope) = instruments.scope.as_mut() {
            scope.kind = InstrumentKind::Simulated;
        }
        if let Some(line) = instruments.line_supply.as_mut() {
            line.kind = InstrumentKind::Simulated;
        }
        self
    }
}

fn invalid<T>(message: impl Into<String>) -> AppResult<T> {
    Err(BenchError::ConfigValidation(message.into()))
}

fn validate_tolerance(name: &str, tolerance: &Tolerance) -> AppResult<()> {
    if tolerance.gain < 0.0 || tolerance.offset < 0.0 {
        return invalid(format!("{name}: gain and offset must not be negative"));
    }
    Ok(())
}

fn validate_axis(name: &str, axis: &AxisRange) -> AppResult<()> {
    if !axis.min.is_finite() || !axis.max.is_finite() {
        return invalid(format!("sweep.{name}: bounds must be finite"));
    }
    if axis.min < 0.0 {
        return invalid(format!("sweep.{name}.min must not be negative"));
    }
    if axis.min > axis.max {
        return invalid(format!(
            "sweep.{name}: min {} exceeds max {}",
            axis.min, axis.max
        ));
    }
    if axis.min < axis.max && axis.step <= 0.0 {
        return invalid(format!("sweep.{name}.step must be positive"));
    }
    if axis.min < axis.max && (axis.max - axis.min) / axis.step >= MAX_AXIS_POINTS as f64 {
        return invalid(format!(
            "sweep.{name}: step {} plans more than {MAX_AXIS_POINTS} points",
            axis.step
        ));
    }
    Ok(())
}

fn validate_sweep(sweep: &SweepConfig) -> AppResult<()> {
    validate_axis("voltage", &sweep.voltage)?;
    validate_axis("current", &sweep.current)?;
    if sweep.mode == SweepMode::Power {
        match &sweep.power {
            Some(power) => validate_axis("power", power)?,
            None => return invalid("sweep.power is required in power mode"),
        }
    }
    if sweep.power_limit <= 0.0 {
        return invalid("sweep.power_limit must be positive");
    }
    if sweep.sink_margin < 0.0 {
        return invalid("sweep.sink_margin must not be negative");
    }
    if sweep.zero_bias < 0.0 {
        return invalid("sweep.zero_bias must not be negative");
    }
    if sweep.voltage_headroom <= 0.0 {
        return invalid("sweep.voltage_headroom must be positive");
    }
    if let Some(limit) = sweep.source_current_limit {
        if limit < sweep.current.max {
            return invalid(format!(
                "sweep.source_current_limit {limit} is below current.max {}",
                sweep.current.max
            ));
        }
    }
    if sweep.sink_ceiling() < sweep.current.min {
        return invalid("sweep.sink_margin leaves no room for the current axis");
    }
    validate_tolerance("sweep.readback_tolerance", &sweep.readback_tolerance)?;
    validate_tolerance("sweep.current_tolerance", &sweep.current_tolerance)
}

fn validate_protection(protection: &ProtectionConfig) -> AppResult<()> {
    if protection.level <= 0.0 {
        return invalid("protection.level must be positive");
    }
    if protection.delta_min <= 0.0 {
        return invalid("protection.delta_min must be positive");
    }
    if protection.delta_min >= protection.level * 0.1 {
        return invalid("protection.delta_min must be below 10% of protection.level");
    }
    if protection.compliance <= 0.0 {
        return invalid("protection.compliance must be positive");
    }
    if protection.kind == ProtectionKind::Ocp && protection.load_voltage.is_none() {
        return invalid("protection.load_voltage is required for OCP");
    }
    validate_tolerance("protection.tolerance", &protection.tolerance)
}

fn validate_regulation(regulation: &RegulationConfig, has_line_supply: bool) -> AppResult<()> {
    if regulation.rated <= 0.0 {
        return invalid("regulation.rated must be positive");
    }
    if regulation.setpoint <= 0.0 || regulation.limit <= 0.0 {
        return invalid("regulation.setpoint and regulation.limit must be positive");
    }
    if regulation.reference < 0.0 || regulation.perturbed < 0.0 {
        return invalid("regulation perturbation targets must not be negative");
    }
    if !(regulation.backoff > 0.0 && regulation.backoff < 1.0) {
        return invalid("regulation.backoff must be in (0, 1)");
    }
    if regulation.kind == RegulationKind::Line && !has_line_supply {
        return invalid("line regulation requires instruments.line_supply");
    }
    validate_tolerance("regulation.tolerance", &regulation.tolerance)
}

fn parse_scalar(raw: &str) -> toml::Value {
    let trimmed = raw.trim();
    if let Ok(b) = trimmed.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return toml::Value::Float(f);
        }
    }
    toml::Value::String(trimmed.to_string())
}

fn insert_dotted(root: &mut toml::Table, key: &str, value: toml::Value) -> AppResult<()> {
    let mut parts: Vec<&str> = key.split('.').map(str::trim).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return invalid(format!("Malformed config key '{key}'"));
    }
    let leaf = parts.pop().unwrap_or_default();
    let mut table = root;
    for part in parts {
        let entry = table
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        table = match entry {
            toml::Value::Table(inner) => inner,
            _ => return invalid(format!("Config key '{key}' conflicts with a value at '{part}'")),
        };
    }
    if table.contains_key(leaf) {
        return invalid(format!("Duplicate config key '{key}'"));
    }
    table.insert(leaf.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_entries() -> Vec<(&'static str, &'static str)> {
        vec![
            ("instruments.source.kind", "simulated"),
            ("instruments.load.kind", "simulated"),
            ("instruments.meter.kind", "simulated"),
        ]
    }

    #[test]
    fn test_axis_points() {
        let axis = AxisRange {
            min: 0.0,
            max: 10.0,
            step: 5.0,
        };
        assert_eq!(axis.points(), 3);
        assert_eq!(axis.value_at(2), 10.0);

        let ragged = AxisRange {
            min: 0.0,
            max: 10.0,
            step: 4.0,
        };
        assert_eq!(ragged.points(), 4);
        assert_eq!(ragged.value_at(3), 10.0);

        assert_eq!(AxisRange::fixed(3.0).points(), 1);

        let dense = AxisRange {
            min: 0.0,
            max: 10.0,
            step: 1e-300,
        };
        assert_eq!(dense.points(), usize::MAX);
    }

    #[test]
    fn test_dense_axis_is_rejected() {
        let mut entries = base_entries();
        entries.extend([
            ("sweep.voltage.max", "10"),
            ("sweep.voltage.step", "1e-300"),
            ("sweep.current.max", "1"),
            ("sweep.power_limit", "100"),
        ]);
        let config = TestConfig::from_flat_map(entries).unwrap();

        let err = config.validate_for(TestKind::Sweep).unwrap_err();
        assert!(matches!(err, BenchError::ConfigValidation(_)));
        assert!(err.to_string().contains("sweep.voltage"));
    }

    #[test]
    fn test_flat_map_builds_nested_config() {
        let mut entries = base_entries();
        entries.extend([
            ("sweep.voltage.max", "10"),
            ("sweep.voltage.step", "5"),
            ("sweep.current.min", "1"),
            ("sweep.current.max", "1"),
            ("sweep.power_limit", "1000"),
            ("delays.settle", "20ms"),
        ]);
        let config = TestConfig::from_flat_map(entries).unwrap();
        let sweep = config.sweep.as_ref().unwrap();
        assert_eq!(sweep.voltage.max, 10.0);
        assert_eq!(sweep.voltage.points(), 3);
        assert_eq!(config.delays.settle, Duration::from_millis(20));
        assert!(config.validate_for(TestKind::Sweep).is_ok());
        assert!(config.validate_for(TestKind::Protection).is_err());
    }

    #[test]
    fn test_flat_map_rejects_conflicting_keys() {
        let mut entries = base_entries();
        entries.extend([("sweep", "1"), ("sweep.power_limit", "10")]);
        let err = TestConfig::from_flat_map(entries).unwrap_err();
        assert!(matches!(err, BenchError::ConfigValidation(_)));
    }

    #[test]
    fn test_sink_ceiling_reduced_when_limits_coincide() {
        let config = TestConfig::from_flat_map({
            let mut entries = base_entries();
            entries.extend([
                ("sweep.voltage.max", "10"),
                ("sweep.current.max", "5"),
                ("sweep.power_limit", "100"),
                ("sweep.source_current_limit", "5"),
                ("sweep.sink_margin", "0.25"),
            ]);
            entries
        })
        .unwrap();
        let sweep = config.sweep.unwrap();
        assert_eq!(sweep.sink_ceiling(), 4.75);

        let mut wide = sweep.clone();
        wide.source_current_limit = None;
        assert_eq!(wide.effective_source_current_limit(), 5.25);
        assert_eq!(wide.sink_ceiling(), 5.0);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = TestConfig::from_flat_map(base_entries()).unwrap();
        assert!(config.validate().is_ok());

        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());
        config.application.log_level = "debug".into();

        config.instruments.source.kind = InstrumentKind::KeysightN6700;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("instruments.source.address"));
    }
}
