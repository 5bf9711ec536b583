//! Current/voltage and constant-power sweeps.
//!
//! [`SweepState`] enumerates the outer × inner set-point grid and applies the
//! interlocks before anything is programmed:
//!
//! - every stepped value is clamped to its axis maximum
//! - a load-driven axis that starts at 0 gets its first point biased by
//!   `zero_bias` (clamped to the axis maximum)
//! - load current never exceeds [`SweepConfig::sink_ceiling`]
//! - a point whose projected power exceeds `power_limit` ends its row; the
//!   rest of that row is skipped and the sweep continues with the next outer
//!   value
//! - in power mode the drawn current `P / V` must stay inside the current
//!   axis: above `current.max` ends the row, below `current.min` skips the
//!   point
//!
//! [`SweepProcedure`] walks the state, programs each point, settles, reads
//! the source, the meter (through the sync engine) and optionally the scope,
//! and emits one [`Sample`] per point.

use crate::config::{AxisRange, InnerAxis, SourceRole, SweepConfig, SweepMode, TestKind};
use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::{LoadMode, MeterFunction};
use crate::measurement::{Sample, SampleRecord, VoltageCurrent};
use crate::procedures::{Procedure, ProcedureContext, ProcedureResult};
use async_trait::async_trait;

// =============================================================================
// Sweep State
// =============================================================================

/// One planned set-point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    /// Row.
    pub outer_index: usize,
    /// Column within the row.
    pub inner_index: usize,
    /// Source voltage (SourceCv, power mode) or load CV set-point (SourceCc).
    pub voltage: f64,
    /// Load CC set-point (SourceCv) or source current (SourceCc). In power
    /// mode, the current the load is expected to draw.
    pub current: f64,
    /// Load CP set-point in power mode.
    pub power: Option<f64>,
    /// Power checked against `power_limit`.
    pub projected_power: f64,
}

impl SweepPoint {
    /// Programmed voltage/current pair.
    pub fn programmed(&self) -> VoltageCurrent {
        VoltageCurrent::new(self.voltage, self.current)
    }
}

/// Position in the sweep grid.
///
/// Iterating yields only the points that pass the power interlock.
#[derive(Debug, Clone)]
pub struct SweepState {
    /// Current row.
    pub outer_index: usize,
    /// Next column in the current row.
    pub inner_index: usize,
    /// Value of the current row's outer axis.
    pub outer_value: f64,
    /// Value of the last planned inner point.
    pub inner_value: f64,
    /// Grid positions consumed, emitted or skipped.
    pub steps: usize,
    /// Rows ended early by the power or current interlock.
    pub truncated_rows: usize,
    /// Power-mode points skipped for drawing less than `current.min`.
    pub skipped_points: usize,
    outer: AxisRange,
    inner: AxisRange,
    config: SweepConfig,
}

impl SweepState {
    /// Start of the grid described by `config`.
    pub fn new(config: &SweepConfig) -> Self {
        let (outer, inner) = match config.mode {
            SweepMode::Power => (
                config.voltage,
                config.power.unwrap_or(AxisRange::fixed(0.0)),
            ),
            SweepMode::CurrentVoltage => match config.inner_axis {
                InnerAxis::Voltage => (config.current, config.voltage),
                InnerAxis::Current => (config.voltage, config.current),
            },
        };
        Self {
            outer_index: 0,
            inner_index: 0,
            outer_value: outer.value_at(0),
            inner_value: inner.value_at(0),
            steps: 0,
            truncated_rows: 0,
            skipped_points: 0,
            outer,
            inner,
            config: config.clone(),
        }
    }

    /// Grid size before truncation.
    pub fn planned_points(&self) -> usize {
        self.outer.points().saturating_mul(self.inner.points())
    }

    fn load_axis_value(axis: &AxisRange, index: usize, zero_bias: f64) -> f64 {
        let value = axis.value_at(index);
        if index == 0 && axis.min == 0.0 {
            zero_bias.min(axis.max)
        } else {
            value
        }
    }

    fn point_at(&self, outer_index: usize, inner_index: usize) -> SweepPoint {
        let cfg = &self.config;
        match cfg.mode {
            SweepMode::Power => {
                let voltage = self.outer.value_at(outer_index);
                let power = Self::load_axis_value(&self.inner, inner_index, cfg.zero_bias);
                let current = if voltage > 0.0 { power / voltage } else { 0.0 };
                SweepPoint {
                    outer_index,
                    inner_index,
                    voltage,
                    current,
                    power: Some(power),
                    projected_power: power,
                }
            }
            SweepMode::CurrentVoltage => {
                let (voltage_index, current_index) = match cfg.inner_axis {
                    InnerAxis::Voltage => (inner_index, outer_index),
                    InnerAxis::Current => (outer_index, inner_index),
                };
                let (voltage, current) = match cfg.role {
                    SourceRole::SourceCv => (
                        cfg.voltage.value_at(voltage_index),
                        Self::load_axis_value(&cfg.current, current_index, cfg.zero_bias)
                            .min(cfg.sink_ceiling()),
                    ),
                    SourceRole::SourceCc => (
                        Self::load_axis_value(&cfg.voltage, voltage_index, cfg.zero_bias),
                        cfg.current.value_at(current_index),
                    ),
                };
                SweepPoint {
                    outer_index,
                    inner_index,
                    voltage,
                    current,
                    power: None,
                    projected_power: voltage * current,
                }
            }
        }
    }

    fn next_row(&mut self) {
        self.outer_index += 1;
        self.inner_index = 0;
        self.outer_value = self.outer.value_at(self.outer_index);
    }

    fn truncate_row(&mut self, columns: usize) {
        self.steps += columns - self.inner_index;
        self.truncated_rows += 1;
        self.next_row();
    }
}

impl Iterator for SweepState {
    type Item = SweepPoint;

    fn next(&mut self) -> Option<SweepPoint> {
        let rows = self.outer.points();
        let columns = self.inner.points();
        while self.outer_index < rows {
            if self.inner_index >= columns {
                self.next_row();
                continue;
            }
            let point = self.point_at(self.outer_index, self.inner_index);
            if point.projected_power > self.config.power_limit {
                tracing::debug!(
                    row = self.outer_index,
                    column = self.inner_index,
                    projected = point.projected_power,
                    limit = self.config.power_limit,
                    "Power limit reached, row truncated"
                );
                self.truncate_row(columns);
                continue;
            }
            if point.power.is_some() {
                let current = self.config.current;
                if point.current > current.max {
                    tracing::debug!(
                        row = self.outer_index,
                        column = self.inner_index,
                        current = point.current,
                        limit = current.max,
                        "Current limit reached, row truncated"
                    );
                    self.truncate_row(columns);
                    continue;
                }
                if point.current < current.min {
                    tracing::debug!(
                        row = self.outer_index,
                        column = self.inner_index,
                        current = point.current,
                        min = current.min,
                        "Current below axis, point skipped"
                    );
                    self.inner_index += 1;
                    self.steps += 1;
                    self.skipped_points += 1;
                    continue;
                }
            }
            self.inner_index += 1;
            self.steps += 1;
            self.inner_value = match (self.config.mode, self.config.inner_axis) {
                (SweepMode::Power, _) => point.projected_power,
                (_, InnerAxis::Voltage) => point.voltage,
                (_, InnerAxis::Current) => point.current,
            };
            return Some(point);
        }
        None
    }
}

// =============================================================================
// Sweep Procedure
// =============================================================================

/// Sweep over the configured grid.
#[derive(Debug, Default)]
pub struct SweepProcedure {
    samples: usize,
}

impl SweepProcedure {
    /// Create a sweep procedure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples emitted by the last run.
    pub fn samples(&self) -> usize {
        self.samples
    }

    async fn prepare(&self, ctx: &ProcedureContext, sweep: &SweepConfig) -> AppResult<()> {
        let set = ctx.instruments();
        let config = ctx.config();

        set.meter
            .configure(MeterFunction::DcVoltage, config.instruments.meter.nplc)
            .await?;
        set.load.set_input(false).await?;
        set.source.set_output(false).await?;

        match (sweep.mode, sweep.role) {
            (SweepMode::Power, _) => {
                set.load.set_mode(LoadMode::Cp).await?;
                set.source.set_current(sweep.current.max).await?;
            }
            (SweepMode::CurrentVoltage, SourceRole::SourceCv) => {
                set.load.set_mode(LoadMode::Cc).await?;
                set.source
                    .set_current(sweep.effective_source_current_limit())
                    .await?;
            }
            (SweepMode::CurrentVoltage, SourceRole::SourceCc) => {
                set.load.set_mode(LoadMode::Cv).await?;
                set.load.set_voltage(sweep.voltage.max).await?;
                set.source
                    .set_voltage(sweep.voltage.max + sweep.voltage_headroom)
                    .await?;
            }
        }

        set.source.set_output(true).await?;
        set.load.set_input(true).await?;
        ctx.settle(config.delays.output_enable).await;
        Ok(())
    }

    async fn program(
        &self,
        ctx: &ProcedureContext,
        sweep: &SweepConfig,
        point: &SweepPoint,
    ) -> AppResult<()> {
        let set = ctx.instruments();
        match (point.power, sweep.role) {
            (Some(power), _) => {
                set.source.set_voltage(point.voltage).await?;
                set.load.set_power(power).await?;
            }
            (None, SourceRole::SourceCv) => {
                set.source.set_voltage(point.voltage).await?;
                set.load.set_current(point.current).await?;
            }
            (None, SourceRole::SourceCc) => {
                set.source.set_current(point.current).await?;
                set.load.set_voltage(point.voltage).await?;
            }
        }
        Ok(())
    }

    async fn measure(
        &self,
        ctx: &ProcedureContext,
        index: usize,
        point: &SweepPoint,
        sweep: &SweepConfig,
    ) -> AppResult<Sample> {
        let set = ctx.instruments();
        let voltage = set.source.measure_voltage().await?;
        let current = set.source.measure_current().await?;
        let meter = ctx.sync().measure_with_retry(set.meter.as_ref()).await?;
        let ripple_pp = match &set.scope {
            Some(scope) => {
                let channel = ctx
                    .config()
                    .instruments
                    .scope
                    .as_ref()
                    .map_or(1, |def| def.channel);
                Some(scope.measure_peak_to_peak(channel).await?)
            }
            None => None,
        };

        Ok(Sample::graded(
            index,
            point.programmed(),
            VoltageCurrent::new(voltage, current),
            meter,
            ripple_pp,
            &sweep.readback(),
        ))
    }
}

#[async_trait]
impl Procedure for SweepProcedure {
    fn type_id(&self) -> &'static str {
        "sweep"
    }

    fn test_kind(&self) -> TestKind {
        TestKind::Sweep
    }

    async fn execute(&mut self, ctx: &ProcedureContext) -> AppResult<ProcedureResult> {
        let sweep = ctx
            .config()
            .sweep
            .clone()
            .ok_or_else(|| BenchError::ConfigValidation("[sweep] section is missing".into()))?;
        let mut result = ProcedureResult::started(self.type_id(), ctx.run_id());
        let mut state = SweepState::new(&sweep);
        let planned = state.planned_points();
        self.samples = 0;

        ctx.progress_text(format!(
            "Sweep: {planned} planned points, power limit {} W",
            sweep.power_limit
        ));
        self.prepare(ctx, &sweep).await?;

        while let Some(point) = state.next() {
            ctx.check_cancelled()?;

            self.program(ctx, &sweep, &point).await?;
            ctx.settle(ctx.config().delays.settle).await;
            let sample = self.measure(ctx, self.samples, &point, &sweep).await?;
            grade(&mut result, &sweep, &sample);
            tracing::debug!(
                index = sample.index,
                voltage = point.voltage,
                current = point.current,
                meter = sample.measured_at_meter,
                "Sweep sample"
            );

            ctx.emit(SampleRecord::Sweep(sample));
            self.samples += 1;
            ctx.progress(state.steps, planned);
        }
        ctx.progress(planned, planned);

        if state.truncated_rows > 0 {
            result.warn(format!(
                "{} row(s) truncated at the {} W power limit or the {} A current limit",
                state.truncated_rows, sweep.power_limit, sweep.current.max
            ));
        }
        if state.skipped_points > 0 {
            result.warn(format!(
                "{} point(s) skipped below {} A",
                state.skipped_points, sweep.current.min
            ));
        }
        result.set_data("planned_points", planned);
        result.set_data("samples", self.samples);
        result.set_data("truncated_rows", state.truncated_rows);
        result.set_data("skipped_points", state.skipped_points);

        let result = result.finish();
        ctx.progress_text(result.summary());
        Ok(result)
    }
}

/// One quality check per graded delta.
fn grade(result: &mut ProcedureResult, sweep: &SweepConfig, sample: &Sample) {
    let tolerance = sweep.readback();
    let programmed = sample.programmed;
    let source = sample.measured_at_source;
    let label = format!("{:.3} V / {:.3} A", programmed.voltage, programmed.current);

    result.quality.add_check(
        format!("voltage readback {label}"),
        sample.voltage_delta.abs(),
        tolerance.voltage.band(programmed.voltage),
        tolerance.voltage.accepts(programmed.voltage, source.voltage),
    );
    result.quality.add_check(
        format!("current readback {label}"),
        sample.current_delta.abs(),
        tolerance.current.band(programmed.current),
        tolerance.current.accepts(programmed.current, source.current),
    );
    result.quality.add_check(
        format!("meter agreement {label}"),
        sample.meter_delta.abs(),
        tolerance.voltage.band(source.voltage),
        tolerance
            .voltage
            .accepts(source.voltage, sample.measured_at_meter),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Tolerance;

    fn grid(voltage: AxisRange, current: AxisRange, power_limit: f64) -> SweepConfig {
        SweepConfig {
            mode: SweepMode::CurrentVoltage,
            role: SourceRole::SourceCv,
            inner_axis: InnerAxis::Voltage,
            voltage,
            current,
            power: None,
            power_limit,
            source_current_limit: None,
            sink_margin: 0.1,
            zero_bias: 1.0,
            voltage_headroom: 1.0,
            readback_tolerance: Tolerance::default(),
            current_tolerance: Tolerance::default(),
        }
    }

    fn axis(min: f64, max: f64, step: f64) -> AxisRange {
        AxisRange { min, max, step }
    }

    #[test]
    fn test_full_grid_without_truncation() {
        let config = grid(axis(0.0, 10.0, 5.0), AxisRange::fixed(1.0), 1000.0);
        let voltages: Vec<f64> = SweepState::new(&config).map(|p| p.voltage).collect();
        assert_eq!(voltages, vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn test_row_truncated_at_power_limit() {
        let config = grid(axis(0.0, 10.0, 5.0), AxisRange::fixed(8.0), 40.0);
        let mut state = SweepState::new(&config);
        let points: Vec<SweepPoint> = state.by_ref().collect();

        assert_eq!(points.len(), 2);
        assert_eq!(points[1].projected_power, 40.0);
        assert_eq!(state.truncated_rows, 1);
        assert_eq!(state.steps, state.planned_points());
    }

    #[test]
    fn test_truncation_ends_only_its_row() {
        let config = grid(axis(0.0, 10.0, 5.0), axis(2.0, 6.0, 2.0), 45.0);
        let points: Vec<SweepPoint> = SweepState::new(&config).collect();

        let per_row: Vec<usize> = (0..3)
            .map(|row| points.iter().filter(|p| p.outer_index == row).count())
            .collect();
        // I=2: 0,10,20 W. I=4: 0,20,40 W. I=6: 0,30 W then 60 W truncated.
        assert_eq!(per_row, vec![3, 3, 2]);
        assert!(points.iter().all(|p| p.projected_power <= 45.0));
    }

    #[test]
    fn test_zero_bias_on_load_axis_only() {
        let config = grid(axis(0.0, 10.0, 5.0), axis(0.0, 4.0, 2.0), 1000.0);
        let points: Vec<SweepPoint> = SweepState::new(&config).collect();

        assert_eq!(points.len(), 9);
        let first_row: Vec<f64> = points.iter().take(3).map(|p| p.current).collect();
        assert_eq!(first_row, vec![1.0, 1.0, 1.0]);
        assert_eq!(points[0].voltage, 0.0);
    }

    #[test]
    fn test_sink_ceiling_clamps_load_current() {
        let mut config = grid(AxisRange::fixed(5.0), axis(0.0, 5.0, 2.5), 1000.0);
        config.source_current_limit = Some(5.0);
        config.sink_margin = 0.2;
        let currents: Vec<f64> = SweepState::new(&config).map(|p| p.current).collect();
        assert_eq!(currents, vec![1.0, 2.5, 4.8]);
    }

    #[test]
    fn test_power_mode_rows_per_voltage() {
        let mut config = grid(axis(10.0, 20.0, 10.0), axis(0.0, 5.0, 1.0), 50.0);
        config.mode = SweepMode::Power;
        config.power = Some(axis(20.0, 60.0, 20.0));
        let points: Vec<SweepPoint> = SweepState::new(&config).collect();

        let powers: Vec<(f64, f64)> = points
            .iter()
            .map(|p| (p.voltage, p.power.unwrap_or_default()))
            .collect();
        assert_eq!(powers, vec![(10.0, 20.0), (10.0, 40.0), (20.0, 20.0), (20.0, 40.0)]);
        assert_eq!(points[1].current, 4.0);
    }

    #[test]
    fn test_power_mode_current_stays_inside_axis() {
        let mut config = grid(AxisRange::fixed(10.0), axis(1.0, 5.0, 1.0), 1000.0);
        config.mode = SweepMode::Power;
        config.power = Some(axis(0.0, 80.0, 20.0));
        let mut state = SweepState::new(&config);
        let points: Vec<SweepPoint> = state.by_ref().collect();

        // 1 W draws 0.1 A and is skipped; 60 W and 80 W draw more than 5 A.
        let currents: Vec<f64> = points.iter().map(|p| p.current).collect();
        assert_eq!(currents, vec![2.0, 4.0]);
        assert_eq!(state.skipped_points, 1);
        assert_eq!(state.truncated_rows, 1);
        assert_eq!(state.steps, state.planned_points());
    }

    #[test]
    fn test_power_mode_values_stay_inside_axes() {
        let mut config = grid(axis(5.0, 24.0, 3.5), axis(0.5, 4.0, 0.5), 1000.0);
        config.mode = SweepMode::Power;
        config.power = Some(axis(0.0, 90.0, 7.5));
        for point in SweepState::new(&config) {
            assert!(point.voltage >= 5.0 && point.voltage <= 24.0);
            assert!(point.current >= 0.5 && point.current <= 4.0);
            assert!(point.projected_power <= 1000.0);
        }
    }

    #[test]
    fn test_values_stay_inside_axes() {
        let mut config = grid(axis(0.5, 9.7, 2.0), axis(0.0, 3.3, 1.5), 1000.0);
        config.inner_axis = InnerAxis::Current;
        for point in SweepState::new(&config) {
            assert!(point.voltage >= 0.5 && point.voltage <= 9.7);
            assert!(point.current >= 0.0 && point.current <= 3.3);
        }
    }
}
