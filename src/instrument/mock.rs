//! Simulated instruments
//!
//! Provides a simulated bench for running every test family without
//! hardware, plus a scripted SCPI transport for adapter tests.
//!
//! # Available Mocks
//!
//! - [`SimulatedBench`]: one shared electrical model behind a source, a load,
//!   a meter, a scope and a line supply, so the load really pulls current from
//!   the source and protection really trips
//! - [`ScriptedTransport`]: records SCPI traffic and answers queries from a
//!   table
//!
//! The bench also carries test oracles: absolute trip points, acquisitions
//! that never finish, transport timeouts during polling, and per-operation
//! fault injection.

use crate::config::SimulationConfig;
use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::{
    LoadControl, LoadMode, MeterControl, MeterFunction, ProtectionKind, ProtectionStatus,
    RegulationMode, ScopeControl, SourceControl, TopologyMode, TriggerSource,
};
use crate::instrument::dialect::{StatusBit, KEYSIGHT_34465A};
use crate::instrument::session::ScpiTransport;
use crate::instrument::InstrumentSet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Output shift per volt of line input.
const LINE_SENSITIVITY: f64 = 1e-4;

/// Meter status bit while an acquisition is running.
const MEASURING: u32 = 1 << 4;

/// Meter status bit while armed and waiting for a bus trigger.
const WAITING_FOR_TRIGGER: u32 = 1 << 5;

// =============================================================================
// ScriptedTransport
// =============================================================================

/// SCPI transport that logs every command and answers from a table.
///
/// `*OPC?` answers `1` and `SYST:ERR?` answers `+0,"No error"` unless
/// overridden. Unknown queries answer `0`.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    name: String,
    responses: Mutex<HashMap<String, String>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    /// Empty script.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Answer `query` with `response` from now on.
    pub fn respond(&self, query: &str, response: &str) {
        lock(&self.responses).insert(query.to_string(), response.to_string());
    }

    /// Every command and query sent so far.
    pub fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }
}

#[async_trait]
impl ScpiTransport for ScriptedTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        lock(&self.log).push(command.to_string());
        Ok(())
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        lock(&self.log).push(command.to_string());
        if let Some(response) = lock(&self.responses).get(command) {
            return Ok(response.clone());
        }
        Ok(match command {
            "*OPC?" => "1".to_string(),
            "SYST:ERR?" => "+0,\"No error\"".to_string(),
            _ => {
                tracing::debug!(instrument = %self.name, command, "Unscripted query");
                "0".to_string()
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// SimulatedBench
// =============================================================================

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Source voltage/current set-points.
    SourceProgram,
    /// Source output switching.
    SourceOutput,
    /// Source topology programming.
    SourceTopology,
    /// Load set-points and mode.
    LoadProgram,
    /// Load input switching.
    LoadInput,
    /// Meter fetch.
    MeterFetch,
}

/// Counters for assertions in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCounters {
    /// `set_topology(Independent)` calls, which only the safe state issues.
    pub topology_resets: u32,
    /// Source output switched on.
    pub outputs_enabled: u32,
    /// Protection latches cleared.
    pub protection_clears: u32,
    /// Completed meter fetches.
    pub fetches: u32,
    /// Regulation mode queries.
    pub mode_queries: u32,
}

#[derive(Debug)]
struct BenchState {
    source_voltage: f64,
    source_current: f64,
    output_on: bool,
    ovp_level: f64,
    ocp_level: f64,
    ovp_armed: bool,
    ocp_armed: bool,
    tripped: Option<ProtectionKind>,
    topology: TopologyMode,

    load_mode: LoadMode,
    load_current: f64,
    load_voltage: f64,
    load_power: f64,
    input_on: bool,

    line_attached: bool,
    line_voltage: f64,
    line_output_on: bool,
    line_input_max: f64,

    meter_function: MeterFunction,
    meter_armed: bool,
    meter_triggered: bool,
    meter_polls: u32,
    meter_stuck: bool,
    stuck_acquisitions: u32,
    acquisition_polls: u32,
    poll_timeouts: u32,

    trip_ratio: f64,
    ovp_trip: Option<f64>,
    ocp_trip: Option<f64>,
    output_resistance: f64,

    faults: HashMap<FaultPoint, u32>,
    calls: HashMap<FaultPoint, u32>,
    counters: SimCounters,
    latency: Duration,
}

impl BenchState {
    fn new(config: &SimulationConfig) -> Self {
        Self {
            source_voltage: 0.0,
            source_current: 0.0,
            output_on: false,
            ovp_level: 0.0,
            ocp_level: 0.0,
            ovp_armed: false,
            ocp_armed: false,
            tripped: None,
            topology: TopologyMode::Independent,
            load_mode: LoadMode::Cc,
            load_current: 0.0,
            load_voltage: 0.0,
            load_power: 0.0,
            input_on: false,
            line_attached: false,
            line_voltage: 0.0,
            line_output_on: false,
            line_input_max: f64::INFINITY,
            meter_function: MeterFunction::DcVoltage,
            meter_armed: false,
            meter_triggered: false,
            meter_polls: 0,
            meter_stuck: false,
            stuck_acquisitions: 0,
            acquisition_polls: config.acquisition_polls,
            poll_timeouts: 0,
            trip_ratio: config.trip_ratio,
            ovp_trip: None,
            ocp_trip: None,
            output_resistance: config.output_resistance,
            faults: HashMap::new(),
            calls: HashMap::new(),
            counters: SimCounters::default(),
            latency: Duration::ZERO,
        }
    }

    fn check_fault(&mut self, point: FaultPoint, instrument: &str) -> AppResult<()> {
        let calls = self.calls.entry(point).or_insert(0);
        *calls += 1;
        match self.faults.get(&point) {
            Some(&allowed) if *calls > allowed => Err(BenchError::io(
                instrument,
                format!("Injected fault at {point:?}"),
            )),
            _ => Ok(()),
        }
    }

    /// Output voltage, output current and regulation mode.
    fn operating_point(&self) -> (f64, f64, RegulationMode) {
        if !self.output_on || self.tripped.is_some() {
            return (0.0, 0.0, RegulationMode::Unregulated);
        }
        if self.line_attached && !self.line_output_on {
            return (0.0, 0.0, RegulationMode::Unregulated);
        }
        let line_shift = if self.line_attached {
            LINE_SENSITIVITY * self.line_voltage
        } else {
            0.0
        };
        let set = self.source_voltage + line_shift;
        let dropout = self.line_attached && self.line_voltage > self.line_input_max;

        if !self.input_on {
            let mode = if dropout {
                RegulationMode::Unregulated
            } else {
                RegulationMode::Cv
            };
            return (set, 0.0, mode);
        }

        let demand = match self.load_mode {
            LoadMode::Cc => self.load_current,
            LoadMode::Cp if set > 0.0 => self.load_power / set,
            LoadMode::Cp | LoadMode::Cr => 0.0,
            LoadMode::Cv => {
                return if self.load_voltage < set {
                    (self.load_voltage, self.source_current, RegulationMode::Cc)
                } else {
                    (set, 0.0, RegulationMode::Cv)
                };
            }
        };

        if demand > self.source_current + 1e-12 {
            return (0.0, self.source_current, RegulationMode::Cc);
        }
        let mode = if dropout {
            RegulationMode::Unregulated
        } else {
            RegulationMode::Cv
        };
        (set - demand * self.output_resistance, demand, mode)
    }

    fn ovp_threshold(&self) -> f64 {
        self.ovp_trip.unwrap_or(self.ovp_level * self.trip_ratio)
    }

    fn ocp_threshold(&self) -> f64 {
        self.ocp_trip.unwrap_or(self.ocp_level * self.trip_ratio)
    }

    /// Latch protection if the present output crosses an armed threshold.
    fn evaluate_protection(&mut self) {
        if !self.output_on || self.tripped.is_some() {
            return;
        }
        if self.ovp_armed && self.source_voltage >= self.ovp_threshold() {
            self.tripped = Some(ProtectionKind::Ovp);
        } else {
            let (_, current, _) = self.operating_point();
            if self.ocp_armed && current >= self.ocp_threshold() {
                self.tripped = Some(ProtectionKind::Ocp);
            }
        }
        if let Some(kind) = self.tripped {
            self.output_on = false;
            tracing::debug!(%kind, "Simulated protection tripped");
        }
    }

    fn acquisition_complete(&self) -> bool {
        !self.meter_stuck && self.meter_triggered && self.meter_polls >= self.acquisition_polls
    }
}

/// Shared electrical model behind the simulated instruments.
///
/// Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new(&SimulationConfig::default())
    }
}

impl SimulatedBench {
    /// New bench, everything off.
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState::new(config))),
        }
    }

    fn state(&self) -> MutexGuard<'_, BenchState> {
        lock(&self.state)
    }

    /// Instrument set with the optional roles present as requested.
    pub fn instrument_set(&self, with_scope: bool, with_line_supply: bool) -> InstrumentSet {
        if with_line_supply {
            self.state().line_attached = true;
        }
        InstrumentSet {
            source: Arc::new(SimSource {
                name: "sim-source".into(),
                bench: self.clone(),
            }),
            load: Arc::new(SimLoad {
                name: "sim-load".into(),
                bench: self.clone(),
            }),
            meter: Arc::new(SimMeter {
                name: "sim-meter".into(),
                bench: self.clone(),
                trigger_source: TriggerSource::Bus,
                complete: KEYSIGHT_34465A.acquisition_complete,
            }),
            scope: with_scope.then(|| {
                Arc::new(SimScope {
                    name: "sim-scope".into(),
                    bench: self.clone(),
                }) as Arc<dyn ScopeControl>
            }),
            line_supply: with_line_supply.then(|| {
                Arc::new(SimLineSupply {
                    name: "sim-line".into(),
                    bench: self.clone(),
                }) as Arc<dyn SourceControl>
            }),
        }
    }

    /// Source role only.
    pub fn source(&self, name: &str) -> SimSource {
        SimSource {
            name: name.to_string(),
            bench: self.clone(),
        }
    }

    /// Load role only.
    pub fn load(&self, name: &str) -> SimLoad {
        SimLoad {
            name: name.to_string(),
            bench: self.clone(),
        }
    }

    /// Meter role only.
    pub fn meter(&self, name: &str, trigger_source: TriggerSource) -> SimMeter {
        SimMeter {
            name: name.to_string(),
            bench: self.clone(),
            trigger_source,
            complete: KEYSIGHT_34465A.acquisition_complete,
        }
    }

    /// Scope role only.
    pub fn scope(&self, name: &str) -> SimScope {
        SimScope {
            name: name.to_string(),
            bench: self.clone(),
        }
    }

    /// Line supply role only; attaches the DUT input to it.
    pub fn line_supply(&self, name: &str) -> SimLineSupply {
        self.state().line_attached = true;
        SimLineSupply {
            name: name.to_string(),
            bench: self.clone(),
        }
    }

    /// Trip the given protection at an absolute value instead of `level × trip_ratio`.
    pub fn set_trip_point(&self, kind: ProtectionKind, value: f64) {
        let mut state = self.state();
        match kind {
            ProtectionKind::Ovp => state.ovp_trip = Some(value),
            ProtectionKind::Ocp => state.ocp_trip = Some(value),
        }
    }

    /// Status polls before an acquisition completes.
    pub fn set_acquisition_polls(&self, polls: u32) {
        self.state().acquisition_polls = polls;
    }

    /// The next `count` acquisitions never complete.
    pub fn stall_acquisitions(&self, count: u32) {
        self.state().stuck_acquisitions = count;
    }

    /// The next `count` status polls time out at the transport.
    pub fn time_out_polls(&self, count: u32) {
        self.state().poll_timeouts = count;
    }

    /// Line voltage above which the DUT drops out of regulation.
    pub fn set_line_input_max(&self, volts: f64) {
        self.state().line_input_max = volts;
    }

    /// Let `allowed` calls at `point` succeed, then fail every later one.
    pub fn fail_after(&self, point: FaultPoint, allowed: u32) {
        self.state().faults.insert(point, allowed);
    }

    /// Delay added to every simulated operation.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Snapshot of the counters.
    pub fn counters(&self) -> SimCounters {
        self.state().counters.clone()
    }

    /// Whether the source output is on.
    pub fn output_on(&self) -> bool {
        self.state().output_on
    }

    /// Whether the load input is on.
    pub fn input_on(&self) -> bool {
        self.state().input_on
    }

    /// Programmed source voltage and current.
    pub fn source_setpoints(&self) -> (f64, f64) {
        let state = self.state();
        (state.source_voltage, state.source_current)
    }

    /// Present source topology.
    pub fn topology(&self) -> TopologyMode {
        self.state().topology
    }

    /// Latched protection, if any.
    pub fn tripped(&self) -> Option<ProtectionKind> {
        self.state().tripped
    }

    async fn pause(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

// =============================================================================
// Roles
// =============================================================================

/// Simulated DUT.
#[derive(Debug)]
pub struct SimSource {
    name: String,
    bench: SimulatedBench,
}

#[async_trait]
impl SourceControl for SimSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        self.bench.pause().await;
        let mut state = self.bench.state();
        state.check_fault(FaultPoint::SourceProgram, &self.name)?;
        state.source_voltage = volts;
        state.evaluate_protection();
        Ok(())
    }

    async fn set_current(&self, amps: f64) -> AppResult<()> {
        self.bench.pause().await;
        let mut state = self.bench.state();
        state.check_fault(FaultPoint::SourceProgram, &self.name)?;
        state.source_current = amps;
        state.evaluate_protection();
        Ok(())
    }

    async fn set_output(&self, enabled: bool) -> AppResult<()> {
        self.bench.pause().await;
        let mut state = self.bench.state();
        state.check_fault(FaultPoint::SourceOutput, &self.name)?;
        if enabled && state.tripped.is_none() {
            state.output_on = true;
            state.counters.outputs_enabled += 1;
            state.evaluate_protection();
        } else {
            state.output_on = false;
        }
        Ok(())
    }

    async fn measure_voltage(&self) -> AppResult<f64> {
        self.bench.pause().await;
        Ok(self.bench.state().operating_point().0)
    }

    async fn measure_current(&self) -> AppResult<f64> {
        self.bench.pause().await;
        Ok(self.bench.state().operating_point().1)
    }

    async fn set_protection_level(&self, kind: ProtectionKind, level: f64) -> AppResult<()> {
        let mut state = self.bench.state();
        match kind {
            ProtectionKind::Ovp => state.ovp_level = level,
            ProtectionKind::Ocp => state.ocp_level = level,
        }
        Ok(())
    }

    async fn set_protection_enabled(&self, kind: ProtectionKind, enabled: bool) -> AppResult<()> {
        let mut state = self.bench.state();
        match kind {
            ProtectionKind::Ovp => state.ovp_armed = enabled,
            ProtectionKind::Ocp => state.ocp_armed = enabled,
        }
        state.evaluate_protection();
        Ok(())
    }

    async fn protection_status(&self, kind: ProtectionKind) -> AppResult<ProtectionStatus> {
        let state = self.bench.state();
        Ok(if state.tripped == Some(kind) {
            ProtectionStatus::Tripped
        } else if state.output_on {
            ProtectionStatus::Normal
        } else {
            ProtectionStatus::OutputOff
        })
    }

    async fn clear_protection(&self) -> AppResult<()> {
        let mut state = self.bench.state();
        state.tripped = None;
        state.counters.protection_clears += 1;
        Ok(())
    }

    async fn regulation_mode(&self) -> AppResult<RegulationMode> {
        let mut state = self.bench.state();
        state.counters.mode_queries += 1;
        Ok(state.operating_point().2)
    }

    async fn set_topology(&self, mode: TopologyMode) -> AppResult<()> {
        self.bench.pause().await;
        let mut state = self.bench.state();
        if mode == TopologyMode::Independent {
            state.counters.topology_resets += 1;
        }
        state.check_fault(FaultPoint::SourceTopology, &self.name)?;
        state.topology = mode;
        Ok(())
    }

    async fn reset(&self) -> AppResult<()> {
        let mut state = self.bench.state();
        state.source_voltage = 0.0;
        state.source_current = 0.0;
        state.output_on = false;
        state.ovp_armed = false;
        state.ocp_armed = false;
        state.tripped = None;
        Ok(())
    }
}

/// Simulated electronic load.
#[derive(Debug)]
pub struct SimLoad {
    name: String,
    bench: SimulatedBench,
}

impl SimLoad {
    async fn program(&self, apply: impl FnOnce(&mut BenchState) + Send) -> AppResult<()> {
        self.bench.pause().await;
        let mut state = self.bench.state();
        state.check_fault(FaultPoint::LoadProgram, &self.name)?;
        apply(&mut state);
        state.evaluate_protection();
        Ok(())
    }
}

#[async_trait]
impl LoadControl for SimLoad {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_mode(&self, mode: LoadMode) -> AppResult<()> {
        self.program(|s| s.load_mode = mode).await
    }

    async fn set_current(&self, amps: f64) -> AppResult<()> {
        self.program(|s| s.load_current = amps).await
    }

    async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        self.program(|s| s.load_voltage = volts).await
    }

    async fn set_power(&self, watts: f64) -> AppResult<()> {
        self.program(|s| s.load_power = watts).await
    }

    async fn set_input(&self, enabled: bool) -> AppResult<()> {
        self.bench.pause().await;
        let mut state = self.bench.state();
        state.check_fault(FaultPoint::LoadInput, &self.name)?;
        state.input_on = enabled;
        state.evaluate_protection();
        Ok(())
    }

    async fn measure_voltage(&self) -> AppResult<f64> {
        Ok(self.bench.state().operating_point().0)
    }

    async fn measure_current(&self) -> AppResult<f64> {
        Ok(self.bench.state().operating_point().1)
    }

    async fn reset(&self) -> AppResult<()> {
        let mut state = self.bench.state();
        state.load_mode = LoadMode::Cc;
        state.load_current = 0.0;
        state.load_voltage = 0.0;
        state.load_power = 0.0;
        state.input_on = false;
        Ok(())
    }
}

/// Simulated DMM with a status-register acquisition cycle.
#[derive(Debug)]
pub struct SimMeter {
    name: String,
    bench: SimulatedBench,
    trigger_source: TriggerSource,
    complete: StatusBit,
}

#[async_trait]
impl MeterControl for SimMeter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&self, function: MeterFunction, _nplc: f64) -> AppResult<()> {
        self.bench.state().meter_function = function;
        Ok(())
    }

    async fn initiate(&self) -> AppResult<()> {
        let mut state = self.bench.state();
        state.meter_armed = true;
        state.meter_polls = 0;
        state.meter_triggered = self.trigger_source == TriggerSource::Immediate;
        state.meter_stuck = state.stuck_acquisitions > 0;
        state.stuck_acquisitions = state.stuck_acquisitions.saturating_sub(1);
        Ok(())
    }

    async fn trigger(&self) -> AppResult<()> {
        let mut state = self.bench.state();
        if state.meter_armed {
            state.meter_triggered = true;
        }
        Ok(())
    }

    async fn operation_status(&self) -> AppResult<u32> {
        self.bench.pause().await;
        let mut state = self.bench.state();
        if state.poll_timeouts > 0 {
            state.poll_timeouts -= 1;
            return Err(BenchError::TransportTimeout {
                instrument: self.name.clone(),
            });
        }
        if !state.meter_armed {
            return Ok(0);
        }
        if !state.meter_triggered {
            return Ok(WAITING_FOR_TRIGGER);
        }
        state.meter_polls += 1;
        Ok(if state.acquisition_complete() {
            0
        } else {
            MEASURING
        })
    }

    fn is_acquisition_complete(&self, raw_status: u32) -> bool {
        self.complete.matches(raw_status)
    }

    async fn fetch(&self) -> AppResult<f64> {
        let mut state = self.bench.state();
        state.check_fault(FaultPoint::MeterFetch, &self.name)?;
        if !state.acquisition_complete() {
            return Err(BenchError::io(&self.name, "-230,\"Data stale\""));
        }
        state.meter_armed = false;
        state.counters.fetches += 1;
        let (voltage, current, _) = state.operating_point();
        Ok(match state.meter_function {
            MeterFunction::DcVoltage => voltage,
            MeterFunction::DcCurrent => current,
        })
    }

    fn trigger_source(&self) -> TriggerSource {
        self.trigger_source
    }
}

/// Simulated oscilloscope; ripple grows with output current.
#[derive(Debug)]
pub struct SimScope {
    name: String,
    bench: SimulatedBench,
}

#[async_trait]
impl ScopeControl for SimScope {
    fn name(&self) -> &str {
        &self.name
    }

    async fn measure_peak_to_peak(&self, _channel: u32) -> AppResult<f64> {
        let (_, current, _) = self.bench.state().operating_point();
        Ok(0.01 + 0.002 * current)
    }
}

/// Simulated supply feeding the DUT input.
#[derive(Debug)]
pub struct SimLineSupply {
    name: String,
    bench: SimulatedBench,
}

#[async_trait]
impl SourceControl for SimLineSupply {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        self.bench.state().line_voltage = volts;
        Ok(())
    }

    async fn set_current(&self, _amps: f64) -> AppResult<()> {
        Ok(())
    }

    async fn set_output(&self, enabled: bool) -> AppResult<()> {
        self.bench.state().line_output_on = enabled;
        Ok(())
    }

    async fn measure_voltage(&self) -> AppResult<f64> {
        let state = self.bench.state();
        Ok(if state.line_output_on {
            state.line_voltage
        } else {
            0.0
        })
    }

    async fn measure_current(&self) -> AppResult<f64> {
        Ok(0.0)
    }

    async fn set_protection_level(&self, _kind: ProtectionKind, _level: f64) -> AppResult<()> {
        Ok(())
    }

    async fn set_protection_enabled(&self, _kind: ProtectionKind, _enabled: bool) -> AppResult<()> {
        Ok(())
    }

    async fn protection_status(&self, _kind: ProtectionKind) -> AppResult<ProtectionStatus> {
        let state = self.bench.state();
        Ok(if state.line_output_on {
            ProtectionStatus::Normal
        } else {
            ProtectionStatus::OutputOff
        })
    }

    async fn clear_protection(&self) -> AppResult<()> {
        Ok(())
    }

    async fn regulation_mode(&self) -> AppResult<RegulationMode> {
        Ok(RegulationMode::Cv)
    }

    async fn set_topology(&self, _mode: TopologyMode) -> AppResult<()> {
        Ok(())
    }

    async fn reset(&self) -> AppResult<()> {
        let mut state = self.bench.state();
        state.line_voltage = 0.0;
        state.line_output_on = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_pulls_current_from_source() {
        let bench = SimulatedBench::default();
        let source = bench.source("psu");
        let load = bench.load("load");

        source.set_voltage(10.0).await.unwrap();
        source.set_current(5.0).await.unwrap();
        source.set_output(true).await.unwrap();
        load.set_mode(LoadMode::Cc).await.unwrap();
        load.set_current(2.0).await.unwrap();
        load.set_input(true).await.unwrap();

        assert!((source.measure_current().await.unwrap() - 2.0).abs() < 1e-12);
        assert_eq!(source.regulation_mode().await.unwrap(), RegulationMode::Cv);

        load.set_current(6.0).await.unwrap();
        assert_eq!(source.regulation_mode().await.unwrap(), RegulationMode::Cc);
    }

    #[tokio::test]
    async fn test_ocp_trips_at_oracle_point_and_latches() {
        let bench = SimulatedBench::default();
        bench.set_trip_point(ProtectionKind::Ocp, 10.3);
        let source = bench.source("psu");
        let load = bench.load("load");

        source.set_voltage(5.0).await.unwrap();
        source
            .set_protection_level(ProtectionKind::Ocp, 10.0)
            .await
            .unwrap();
        source
            .set_protection_enabled(ProtectionKind::Ocp, true)
            .await
            .unwrap();
        load.set_mode(LoadMode::Cv).await.unwrap();
        load.set_voltage(1.0).await.unwrap();
        load.set_input(true).await.unwrap();

        source.set_current(10.2).await.unwrap();
        source.set_output(true).await.unwrap();
        assert_eq!(
            source.protection_status(ProtectionKind::Ocp).await.unwrap(),
            ProtectionStatus::Normal
        );

        source.set_current(10.3).await.unwrap();
        assert_eq!(
            source.protection_status(ProtectionKind::Ocp).await.unwrap(),
            ProtectionStatus::Tripped
        );
        assert!(!bench.output_on());

        source.set_output(true).await.unwrap();
        assert!(!bench.output_on(), "latched protection keeps output off");

        source.clear_protection().await.unwrap();
        assert_eq!(
            source.protection_status(ProtectionKind::Ocp).await.unwrap(),
            ProtectionStatus::OutputOff
        );
    }

    #[tokio::test]
    async fn test_meter_waits_for_trigger_then_completes() {
        let bench = SimulatedBench::default();
        bench.set_acquisition_polls(2);
        let meter = bench.meter("dmm", TriggerSource::Bus);

        meter.initiate().await.unwrap();
        assert_eq!(meter.operation_status().await.unwrap(), WAITING_FOR_TRIGGER);
        meter.trigger().await.unwrap();
        let first = meter.operation_status().await.unwrap();
        assert!(!meter.is_acquisition_complete(first));
        let second = meter.operation_status().await.unwrap();
        assert!(meter.is_acquisition_complete(second));
        assert_eq!(meter.fetch().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let bench = SimulatedBench::default();
        bench.fail_after(FaultPoint::SourceOutput, 1);
        let source = bench.source("psu");

        assert!(source.set_output(true).await.is_ok());
        let err = source.set_output(false).await.unwrap_err();
        assert!(matches!(err, BenchError::InstrumentIo { .. }));
    }
}
