//! OVP/OCP trip-point search.
//!
//! For a programmed protection level `L` the search probes the bracket
//! `[0.9·L, 1.1·L]` with a damped relaxation step:
//!
//! ```text
//! probe = 0.9·L   delta = 0.1·L   previous = Normal
//! loop while delta > delta_min (and below the iteration cap):
//!     clamp probe into the bracket
//!     status = probe the source
//!     delta *= if status == previous { 0.9 } else { 0.5 }
//!     probe += delta if Normal, -= delta if Tripped
//!     previous = status          (Tracking history only)
//! ```
//!
//! Each probe enables the output, reads the protection status, then disables
//! the output and clears the latch whatever the status was.

use crate::config::{HistoryMode, ProtectionConfig, TestKind};
use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::{LoadMode, ProtectionKind, ProtectionStatus};
use crate::measurement::{SampleRecord, SearchOutcome};
use crate::procedures::{Procedure, ProcedureContext, ProcedureResult};
use async_trait::async_trait;

/// Lower edge of the bracket as a fraction of the level.
const BRACKET_LOW: f64 = 0.9;
/// Upper edge of the bracket as a fraction of the level.
const BRACKET_HIGH: f64 = 1.1;
/// Initial step as a fraction of the level.
const INITIAL_STEP: f64 = 0.1;
/// Step shrink when the status repeats.
const SAME_STATUS_DAMPING: f64 = 0.9;
/// Step shrink when the status flips.
const FLIP_DAMPING: f64 = 0.5;

/// Search bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchState {
    /// Next value to program.
    pub probe: f64,
    /// Present step size. Never increases.
    pub delta: f64,
    /// Status the next observation is compared with.
    pub previous_status: ProtectionStatus,
    /// Probes issued.
    pub iterations: u32,
    low: f64,
    high: f64,
    history: HistoryMode,
}

impl SearchState {
    /// Initial state for protection level `level`.
    pub fn new(level: f64, history: HistoryMode) -> Self {
        Self {
            probe: BRACKET_LOW * level,
            delta: INITIAL_STEP * level,
            previous_status: ProtectionStatus::Normal,
            iterations: 0,
            low: BRACKET_LOW * level,
            high: BRACKET_HIGH * level,
            history,
        }
    }

    /// `ceil(log_{1/0.9}(delta0 / delta_min)) + 1`.
    pub fn iteration_cap(&self, delta_min: f64) -> u32 {
        if self.delta <= delta_min {
            return 1;
        }
        let steps = (self.delta / delta_min).ln() / (1.0 / SAME_STATUS_DAMPING).ln();
        steps.ceil() as u32 + 1
    }

    /// Clamp the probe into the bracket and return it.
    pub fn next_probe(&mut self) -> f64 {
        self.probe = self.probe.clamp(self.low, self.high);
        self.probe
    }

    /// Fold one observation into the state.
    ///
    /// `OutputOff` moves the probe like `Normal`: no trip was observed.
    pub fn observe(&mut self, status: ProtectionStatus) {
        let status = match status {
            ProtectionStatus::OutputOff => ProtectionStatus::Normal,
            other => other,
        };
        self.delta *= if status == self.previous_status {
            SAME_STATUS_DAMPING
        } else {
            FLIP_DAMPING
        };
        match status {
            ProtectionStatus::Tripped => self.probe -= self.delta,
            _ => self.probe += self.delta,
        }
        if self.history == HistoryMode::Tracking {
            self.previous_status = status;
        }
        self.iterations += 1;
    }

    /// Converged value, clamped into the bracket.
    pub fn trip_point(&self) -> f64 {
        self.probe.clamp(self.low, self.high)
    }
}

/// Run the search loop against `probe`.
///
/// Stops once `delta <= delta_min` or the iteration cap is reached.
pub async fn search<F, Fut>(
    level: f64,
    delta_min: f64,
    history: HistoryMode,
    mut probe: F,
) -> AppResult<SearchState>
where
    F: FnMut(f64) -> Fut,
    Fut: std::future::Future<Output = AppResult<ProtectionStatus>>,
{
    let mut state = SearchState::new(level, history);
    let cap = state.iteration_cap(delta_min);
    while state.delta > delta_min && state.iterations < cap {
        let value = state.next_probe();
        let status = probe(value).await?;
        tracing::debug!(
            iteration = state.iterations + 1,
            probe = value,
            ?status,
            delta = state.delta,
            "Protection probe"
        );
        state.observe(status);
    }
    Ok(state)
}

/// OVP or OCP calibration against the configured level.
#[derive(Debug, Default)]
pub struct ThresholdSearchProcedure {
    outcome: Option<SearchOutcome>,
}

impl ThresholdSearchProcedure {
    /// Create a threshold search procedure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome of the last run.
    pub fn outcome(&self) -> Option<&SearchOutcome> {
        self.outcome.as_ref()
    }

    async fn prepare(
        &self,
        ctx: &ProcedureContext,
        protection: &ProtectionConfig,
    ) -> AppResult<()> {
        let set = ctx.instruments();
        set.source.set_output(false).await?;
        set.source.clear_protection().await?;

        match protection.kind {
            ProtectionKind::Ocp => {
                let load_voltage = protection.load_voltage.ok_or_else(|| {
                    BenchError::ConfigValidation(
                        "protection.load_voltage is required for OCP".into(),
                    )
                })?;
                set.source.set_voltage(protection.compliance).await?;
                set.load.set_mode(LoadMode::Cv).await?;
                set.load.set_voltage(load_voltage).await?;
                set.load.set_input(true).await?;
            }
            ProtectionKind::Ovp => {
                set.load.set_input(false).await?;
                set.source.set_current(protection.compliance).await?;
            }
        }

        set.source
            .set_protection_level(protection.kind, protection.level)
            .await?;
        set.source
            .set_protection_enabled(protection.kind, true)
            .await?;
        Ok(())
    }

    async fn probe(
        ctx: &ProcedureContext,
        protection: &ProtectionConfig,
        value: f64,
    ) -> AppResult<ProtectionStatus> {
        ctx.check_cancelled()?;
        let source = &ctx.instruments().source;
        let delays = &ctx.config().delays;

        match protection.kind {
            ProtectionKind::Ocp => source.set_current(value).await?,
            ProtectionKind::Ovp => source.set_voltage(value).await?,
        }
        ctx.settle(delays.settle).await;
        source.set_output(true).await?;
        ctx.settle(delays.output_enable).await;

        let status = source.protection_status(protection.kind).await?;
        if status == ProtectionStatus::OutputOff {
            tracing::warn!(
                kind = %protection.kind,
                probe = value,
                "Output never came up, probe counted as not tripped"
            );
        }

        source.set_output(false).await?;
        source.clear_protection().await?;
        ctx.settle(delays.protection_clear).await;
        Ok(status)
    }
}

#[async_trait]
impl Procedure for ThresholdSearchProcedure {
    fn type_id(&self) -> &'static str {
        "threshold_search"
    }

    fn test_kind(&self) -> TestKind {
        TestKind::Protection
    }

    async fn execute(&mut self, ctx: &ProcedureContext) -> AppResult<ProcedureResult> {
        let protection = ctx.config().protection.clone().ok_or_else(|| {
            BenchError::ConfigValidation("[protection] section is missing".into())
        })?;
        let kind_name = protection.kind.to_string();
        let mut result = ProcedureResult::started(self.type_id(), ctx.run_id());

        ctx.progress_text(format!(
            "{kind_name} search around {} (delta_min {})",
            protection.level, protection.delta_min
        ));
        self.prepare(ctx, &protection).await?;

        let cap = SearchState::new(protection.level, protection.history)
            .iteration_cap(protection.delta_min);
        let protection_ref = &protection;
        let state = search(
            protection.level,
            protection.delta_min,
            protection.history,
            |value| Self::probe(ctx, protection_ref, value),
        )
        .await?;

        let trip_point = state.trip_point();
        let band = protection.tolerance.band(protection.level);
        let pass = protection.tolerance.accepts(protection.level, trip_point);
        let outcome = SearchOutcome {
            target: protection.level,
            trip_point,
            iterations: state.iterations,
            pass,
        };
        tracing::info!(
            kind = %kind_name,
            target = protection.level,
            trip_point,
            iterations = state.iterations,
            pass,
            "Protection search finished"
        );

        result.quality.add_check(
            format!("{kind_name} trip point"),
            (trip_point - protection.level).abs(),
            band,
            pass,
        );
        result.set_data("target", protection.level);
        result.set_data("trip_point", trip_point);
        result.set_data("iterations", state.iterations);
        ctx.emit(SampleRecord::Threshold(outcome.clone()));
        self.outcome = Some(outcome);

        ctx.progress(cap as usize, cap as usize);
        let result = result.finish();
        ctx.progress_text(result.summary());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_against(trip: f64, history: HistoryMode) -> SearchState {
        search(10.0, 0.01, history, |value| async move {
            Ok(if value >= trip {
                ProtectionStatus::Tripped
            } else {
                ProtectionStatus::Normal
            })
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_converges_on_trip_point() {
        let state = run_against(10.3, HistoryMode::Tracking).await;
        assert!((state.trip_point() - 10.3).abs() <= 0.01);
        assert_eq!(state.iterations, 13);
    }

    #[tokio::test]
    async fn test_search_is_deterministic() {
        let first = run_against(9.5, HistoryMode::Tracking).await;
        let second = run_against(9.5, HistoryMode::Tracking).await;
        assert_eq!(first, second);
        assert!((first.trip_point() - 9.5).abs() <= 0.01);
    }

    #[tokio::test]
    async fn test_latched_history_still_converges() {
        let state = run_against(10.3, HistoryMode::Latched).await;
        assert_eq!(state.previous_status, ProtectionStatus::Normal);
        assert!((state.trip_point() - 10.3).abs() <= 0.01);
        assert_eq!(state.iterations, 11);
    }

    #[tokio::test]
    async fn test_iterations_bounded_outside_bracket() {
        let state = run_against(11.5, HistoryMode::Tracking).await;
        let cap = SearchState::new(10.0, HistoryMode::Tracking).iteration_cap(0.01);
        assert_eq!(cap, 45);
        assert!(state.iterations <= cap);
        assert!((state.trip_point() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_delta_never_increases() {
        let mut state = SearchState::new(10.0, HistoryMode::Tracking);
        let mut last = state.delta;
        for status in [
            ProtectionStatus::Normal,
            ProtectionStatus::Tripped,
            ProtectionStatus::OutputOff,
            ProtectionStatus::Tripped,
        ] {
            state.next_probe();
            state.observe(status);
            assert!(state.delta <= last);
            last = state.delta;
        }
    }
}
