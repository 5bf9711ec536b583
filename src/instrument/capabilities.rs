//! Instrument Capabilities
//!
//! Each bench role is a small async trait. Engines are written against these
//! traits only; the concrete SCPI implementations live in
//! [`crate::instrument::scpi`] and the simulated ones in
//! [`crate::instrument::mock`].
//!
//! - A programmable supply (the DUT) implements [`SourceControl`]
//! - An electronic load implements [`LoadControl`]
//! - A reference DMM implements [`MeterControl`]
//! - An oscilloscope implements [`ScopeControl`]
//!
//! # Contract
//!
//! - All methods take `&self`; implementations use interior mutability.
//! - Every state-changing call returns only after the instrument confirmed
//!   operation complete, so the next call can never race the command queue.
//! - Errors are [`BenchError`](crate::error::BenchError) so callers can tell
//!   a transport timeout from a fatal I/O failure.

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which protection circuit is exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionKind {
    /// Over-voltage protection.
    Ovp,
    /// Over-current protection.
    Ocp,
}

impl fmt::Display for ProtectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionKind::Ovp => write!(f, "OVP"),
            ProtectionKind::Ocp => write!(f, "OCP"),
        }
    }
}

/// Protection state derived from vendor status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionStatus {
    /// The protection latched.
    Tripped,
    /// Output is on and regulating.
    Normal,
    /// Output is off without a latched protection.
    OutputOff,
}

/// Regulation mode reported by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegulationMode {
    /// Constant voltage.
    Cv,
    /// Constant current.
    Cc,
    /// Neither flag set (output off, transitioning, or unregulated).
    Unregulated,
}

impl fmt::Display for RegulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegulationMode::Cv => write!(f, "CV"),
            RegulationMode::Cc => write!(f, "CC"),
            RegulationMode::Unregulated => write!(f, "unregulated"),
        }
    }
}

/// Output channel grouping on multi-channel sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    /// Channels operate independently (the safe state).
    #[default]
    Independent,
    /// Channels wired in series.
    Series,
    /// Channels wired in parallel.
    Parallel,
}

/// Electronic load operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Constant current.
    Cc,
    /// Constant voltage.
    Cv,
    /// Constant power.
    Cp,
    /// Constant resistance.
    Cr,
}

/// How a meter acquisition is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// Acquisition starts on `INIT`.
    Immediate,
    /// Acquisition waits for a bus trigger after `INIT`.
    #[default]
    Bus,
}

/// Meter measurement function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterFunction {
    /// DC volts.
    DcVoltage,
    /// DC amps.
    DcCurrent,
}

/// Capability: programmable DC source (the device under test).
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Instrument name for logs and errors.
    fn name(&self) -> &str;

    /// Program the voltage set-point.
    async fn set_voltage(&self, volts: f64) -> AppResult<()>;

    /// Program the current set-point / limit.
    async fn set_current(&self, amps: f64) -> AppResult<()>;

    /// Switch the output.
    async fn set_output(&self, enabled: bool) -> AppResult<()>;

    /// Read back output voltage.
    async fn measure_voltage(&self) -> AppResult<f64>;

    /// Read back output current.
    async fn measure_current(&self) -> AppResult<f64>;

    /// Program a protection level.
    async fn set_protection_level(&self, kind: ProtectionKind, level: f64) -> AppResult<()>;

    /// Arm or disarm a protection circuit.
    async fn set_protection_enabled(&self, kind: ProtectionKind, enabled: bool) -> AppResult<()>;

    /// Current protection state for `kind`.
    async fn protection_status(&self, kind: ProtectionKind) -> AppResult<ProtectionStatus>;

    /// Clear a latched protection.
    async fn clear_protection(&self) -> AppResult<()>;

    /// Regulation mode flag.
    async fn regulation_mode(&self) -> AppResult<RegulationMode>;

    /// Program channel grouping.
    async fn set_topology(&self, mode: TopologyMode) -> AppResult<()>;

    /// Instrument reset followed by status clear.
    async fn reset(&self) -> AppResult<()>;
}

/// Capability: programmable electronic load.
#[async_trait]
pub trait LoadControl: Send + Sync {
    /// Instrument name for logs and errors.
    fn name(&self) -> &str;

    /// Select the operating mode.
    async fn set_mode(&self, mode: LoadMode) -> AppResult<()>;

    /// CC set-point.
    async fn set_current(&self, amps: f64) -> AppResult<()>;

    /// CV set-point.
    async fn set_voltage(&self, volts: f64) -> AppResult<()>;

    /// CP set-point.
    async fn set_power(&self, watts: f64) -> AppResult<()>;

    /// Switch the input.
    async fn set_input(&self, enabled: bool) -> AppResult<()>;

    /// Read back input voltage.
    async fn measure_voltage(&self) -> AppResult<f64>;

    /// Read back input current.
    async fn measure_current(&self) -> AppResult<f64>;

    /// Instrument reset followed by status clear.
    async fn reset(&self) -> AppResult<()>;
}

/// Capability: reference meter with an initiate/trigger/fetch cycle.
#[async_trait]
pub trait MeterControl: Send + Sync {
    /// Instrument name for logs and errors.
    fn name(&self) -> &str;

    /// Select function, integration time and trigger source.
    async fn configure(&self, function: MeterFunction, nplc: f64) -> AppResult<()>;

    /// Arm an acquisition.
    async fn initiate(&self) -> AppResult<()>;

    /// Send a bus trigger.
    async fn trigger(&self) -> AppResult<()>;

    /// Raw operation-condition register.
    async fn operation_status(&self) -> AppResult<u32>;

    /// Vendor predicate over [`operation_status`](Self::operation_status).
    fn is_acquisition_complete(&self, raw_status: u32) -> bool;

    /// Read the completed acquisition.
    async fn fetch(&self) -> AppResult<f64>;

    /// Trigger source the meter was configured with.
    fn trigger_source(&self) -> TriggerSource;
}

/// Capability: oscilloscope measurement.
#[async_trait]
pub trait ScopeControl: Send + Sync {
    /// Instrument name for logs and errors.
    fn name(&self) -> &str;

    /// Peak-to-peak voltage on `channel`.
    async fn measure_peak_to_peak(&self, channel: u32) -> AppResult<f64>;
}
