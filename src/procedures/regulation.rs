//! Load and line regulation checks.
//!
//! A regulation check reads the regulated output at a reference condition,
//! moves one perturbation (load current, load voltage or line voltage) to a
//! stressed condition and reads it again. The stressed reading is only
//! trusted while the source still reports the declared regulation mode; if
//! it does not, the stress is backed off and the step retried.
//!
//! | Kind | Source | Perturbation | Meter |
//! |------|--------|--------------|-------|
//! | `load_cv` | CV at `setpoint` V | load CC current | DC voltage |
//! | `load_cc` | CC at `setpoint` A | load CV voltage | DC current |
//! | `line` | CV at `setpoint` V | line supply voltage | DC voltage |

use crate::config::{RegulationConfig, RegulationKind, TestKind};
use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::{LoadMode, MeterFunction, RegulationMode, SourceControl};
use crate::measurement::{RegulationSample, SampleRecord};
use crate::procedures::{Procedure, ProcedureContext, ProcedureResult};
use async_trait::async_trait;
use std::sync::Arc;

impl RegulationKind {
    /// Mode the source must hold while perturbed.
    pub fn expected_mode(self) -> RegulationMode {
        match self {
            RegulationKind::LoadCv | RegulationKind::Line => RegulationMode::Cv,
            RegulationKind::LoadCc => RegulationMode::Cc,
        }
    }

    fn meter_function(self) -> MeterFunction {
        match self {
            RegulationKind::LoadCv | RegulationKind::Line => MeterFunction::DcVoltage,
            RegulationKind::LoadCc => MeterFunction::DcCurrent,
        }
    }

    fn label(self) -> &'static str {
        match self {
            RegulationKind::LoadCv => "load regulation (CV)",
            RegulationKind::LoadCc => "load regulation (CC)",
            RegulationKind::Line => "line regulation",
        }
    }
}

/// Reference/perturbed regulation measurement.
#[derive(Debug, Default)]
pub struct RegulationProcedure {
    sample: Option<RegulationSample>,
}

impl RegulationProcedure {
    /// Create a regulation procedure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Measurement from the last run.
    pub fn sample(&self) -> Option<&RegulationSample> {
        self.sample.as_ref()
    }

    fn line_supply(ctx: &ProcedureContext) -> AppResult<&Arc<dyn SourceControl>> {
        ctx.instruments().line_supply.as_ref().ok_or_else(|| {
            BenchError::ConfigValidation(
                "line regulation requires instruments.line_supply".into(),
            )
        })
    }

    async fn prepare(&self, ctx: &ProcedureContext, reg: &RegulationConfig) -> AppResult<()> {
        let set = ctx.instruments();
        set.meter
            .configure(reg.kind.meter_function(), ctx.config().instruments.meter.nplc)
            .await?;
        set.load.set_input(false).await?;
        set.source.set_output(false).await?;

        match reg.kind {
            RegulationKind::LoadCv => {
                set.source.set_voltage(reg.setpoint).await?;
                set.source.set_current(reg.limit).await?;
                set.load.set_mode(LoadMode::Cc).await?;
            }
            RegulationKind::LoadCc => {
                set.source.set_current(reg.setpoint).await?;
                set.source.set_voltage(reg.limit).await?;
                set.load.set_mode(LoadMode::Cv).await?;
            }
            RegulationKind::Line => {
                let line = Self::line_supply(ctx)?;
                line.set_voltage(reg.reference).await?;
                line.set_output(true).await?;
                set.source.set_voltage(reg.setpoint).await?;
                set.source.set_current(reg.limit).await?;
                set.load.set_mode(LoadMode::Cc).await?;
                set.load.set_current(reg.load_setpoint).await?;
            }
        }
        Ok(())
    }

    /// Program the perturbation to `stress`.
    async fn apply(ctx: &ProcedureContext, kind: RegulationKind, stress: f64) -> AppResult<()> {
        let set = ctx.instruments();
        match kind {
            RegulationKind::LoadCv => set.load.set_current(stress).await?,
            RegulationKind::LoadCc => set.load.set_voltage(stress).await?,
            RegulationKind::Line => Self::line_supply(ctx)?.set_voltage(stress).await?,
        }
        ctx.settle(ctx.config().delays.settle).await;
        Ok(())
    }

    async fn read(ctx: &ProcedureContext) -> AppResult<f64> {
        ctx.sync()
            .measure_with_retry(ctx.instruments().meter.as_ref())
            .await
    }

    async fn measure(
        &self,
        ctx: &ProcedureContext,
        reg: &RegulationConfig,
    ) -> AppResult<RegulationSample> {
        let source = &ctx.instruments().source;
        let expected = reg.kind.expected_mode();
        let desired_delta = reg.tolerance.band(reg.rated);

        Self::apply(ctx, reg.kind, reg.reference).await?;
        source.set_output(true).await?;
        ctx.instruments().load.set_input(true).await?;
        ctx.settle(ctx.config().delays.output_enable).await;
        let reference = Self::read(ctx).await?;
        ctx.progress_text(format!("Reference reading {reference:.6}"));

        let mut stress = reg.perturbed;
        let mut retries = 0;
        loop {
            ctx.check_cancelled()?;
            Self::apply(ctx, reg.kind, stress).await?;
            let mode = source.regulation_mode().await?;
            if mode == expected {
                break;
            }

            let violation = BenchError::RegulationModeViolation {
                expected: expected.to_string(),
                actual: mode.to_string(),
            };
            if retries >= reg.max_retries {
                tracing::error!(
                    error = %violation,
                    stress,
                    retries,
                    "Giving up on perturbed reading"
                );
                return Ok(RegulationSample {
                    reference,
                    perturbed: None,
                    desired_delta,
                    actual_delta: None,
                    pass: false,
                    retries,
                    stress,
                });
            }
            retries += 1;
            stress *= 1.0 - reg.backoff;
            tracing::warn!(
                error = %violation,
                retry = retries,
                stress,
                "Backing off perturbation"
            );
            ctx.progress_text(format!(
                "Source left {expected} mode, retrying at {stress:.4}"
            ));
        }

        let perturbed = Self::read(ctx).await?;
        let actual_delta = perturbed - reference;
        Ok(RegulationSample {
            reference,
            perturbed: Some(perturbed),
            desired_delta,
            actual_delta: Some(actual_delta),
            pass: actual_delta.abs() <= desired_delta,
            retries,
            stress,
        })
    }
}

#[async_trait]
impl Procedure for RegulationProcedure {
    fn type_id(&self) -> &'static str {
        "regulation"
    }

    fn test_kind(&self) -> TestKind {
        TestKind::Regulation
    }

    async fn execute(&mut self, ctx: &ProcedureContext) -> AppResult<ProcedureResult> {
        let reg = ctx.config().regulation.clone().ok_or_else(|| {
            BenchError::ConfigValidation("[regulation] section is missing".into())
        })?;
        let label = reg.kind.label();
        let mut result = ProcedureResult::started(self.type_id(), ctx.run_id());

        ctx.progress_text(format!(
            "Starting {label}: {} -> {}",
            reg.reference, reg.perturbed
        ));
        self.prepare(ctx, &reg).await?;
        ctx.progress(1, 3);

        let sample = self.measure(ctx, &reg).await?;
        ctx.progress(2, 3);

        match sample.actual_delta {
            Some(delta) => result
                .quality
                .add_check(label, delta.abs(), sample.desired_delta, sample.pass),
            None => result.quality.add_fail(
                label,
                format!(
                    "Source never held {} mode after {} retries",
                    reg.kind.expected_mode(),
                    sample.retries
                ),
            ),
        }
        if sample.retries > 0 {
            result.warn(format!(
                "Perturbation backed off {} time(s) to {:.4}",
                sample.retries, sample.stress
            ));
        }
        result.set_data("reference", sample.reference);
        if let Some(delta) = sample.actual_delta {
            result.set_data("actual_delta", delta);
        }
        result.set_data("desired_delta", sample.desired_delta);
        result.set_data("retries", sample.retries);

        ctx.emit(SampleRecord::Regulation(sample.clone()));
        self.sample = Some(sample);
        ctx.progress(3, 3);

        let result = result.finish();
        ctx.progress_text(result.summary());
        Ok(result)
    }
}
