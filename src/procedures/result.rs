//! Procedure Results and Quality Checks
//!
//! Every run ends in one [`ProcedureResult`]: the verdict, the individual
//! pass/fail checks that produced it, timing, and a small map of headline
//! numbers. [`ProcedureResult::summary`] is the one-line text carried by the
//! host's terminal event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// ProcedureResult
// =============================================================================

/// Result of a procedure execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureResult {
    /// Procedure type that produced this result.
    pub procedure_type: String,

    /// Run identifier.
    pub run_id: String,

    /// True when the run completed and every check passed.
    pub success: bool,

    /// Pass/fail checks.
    pub quality: QualityMetrics,

    /// Execution timing.
    pub timing: ExecutionTiming,

    /// Headline values (sample counts, trip point, ...).
    #[serde(default)]
    pub data: BTreeMap<String, ResultValue>,

    /// Non-fatal problems seen during the run.
    #[serde(default)]
    pub warnings: Vec<String>,

    /// Error text if the run failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl ProcedureResult {
    /// A result for a run that just started.
    pub fn started(procedure_type: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            procedure_type: procedure_type.into(),
            run_id: run_id.into(),
            success: true,
            quality: QualityMetrics::default(),
            timing: ExecutionTiming::started_now(),
            data: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    /// A result for a run that failed or was aborted.
    pub fn failure(
        procedure_type: impl Into<String>,
        run_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::started(procedure_type, run_id);
        result.success = false;
        result.error = Some(error.into());
        result.timing.finish();
        result
    }

    /// Add a data value.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<ResultValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Record a data value in place.
    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<ResultValue>) {
        self.data.insert(key.into(), value.into());
    }

    /// Add a warning.
    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(procedure = %self.procedure_type, "{warning}");
        self.warnings.push(warning);
    }

    /// Close the timing window and derive `success` from the checks.
    pub fn finish(mut self) -> Self {
        self.timing.finish();
        self.success = self.error.is_none() && self.quality.checks_failed == 0;
        self
    }

    /// Generate a human-readable summary.
    pub fn summary(&self) -> String {
        let status = if self.success { "PASS" } else { "FAIL" };
        match &self.error {
            None => format!(
                "{} - {} - Duration: {:.1}s - Checks: {} passed, {} failed",
                self.procedure_type,
                status,
                self.timing.duration.as_secs_f64(),
                self.quality.checks_passed,
                self.quality.checks_failed
            ),
            Some(error) => format!("{} - {} - Error: {}", self.procedure_type, status, error),
        }
    }
}

/// A value in [`ProcedureResult::data`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    /// Boolean.
    Bool(bool),
    /// Count.
    Count(u64),
    /// Measurement.
    Number(f64),
    /// Free text.
    Text(String),
}

impl From<bool> for ResultValue {
    fn from(value: bool) -> Self {
        ResultValue::Bool(value)
    }
}

impl From<u32> for ResultValue {
    fn from(value: u32) -> Self {
        ResultValue::Count(u64::from(value))
    }
}

impl From<usize> for ResultValue {
    fn from(value: usize) -> Self {
        ResultValue::Count(value as u64)
    }
}

impl From<f64> for ResultValue {
    fn from(value: f64) -> Self {
        ResultValue::Number(value)
    }
}

impl From<&str> for ResultValue {
    fn from(value: &str) -> Self {
        ResultValue::Text(value.to_string())
    }
}

impl From<String> for ResultValue {
    fn from(value: String) -> Self {
        ResultValue::Text(value)
    }
}

// =============================================================================
// Quality Metrics
// =============================================================================

/// Pass/fail checks collected during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Checks that passed.
    pub checks_passed: u32,

    /// Checks that failed.
    pub checks_failed: u32,

    /// Individual checks.
    #[serde(default)]
    pub checks: Vec<QualityCheck>,
}

impl QualityMetrics {
    /// Record a check with its measured value and allowed band.
    pub fn add_check(&mut self, name: impl Into<String>, value: f64, threshold: f64, passed: bool) {
        let status = if passed {
            self.checks_passed += 1;
            CheckStatus::Pass
        } else {
            self.checks_failed += 1;
            CheckStatus::Fail
        };

        self.checks.push(QualityCheck {
            name: name.into(),
            status,
            message: format!("Value: {value:.4}, Threshold: {threshold:.4}"),
            value: Some(value),
            threshold: Some(threshold),
        });
    }

    /// Record a failed check without a value.
    pub fn add_fail(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.checks_failed += 1;
        self.checks.push(QualityCheck {
            name: name.into(),
            status: CheckStatus::Fail,
            message: message.into(),
            value: None,
            threshold: None,
        });
    }

    /// Fraction of checks that passed (1.0 with no checks).
    pub fn pass_ratio(&self) -> f64 {
        let total = self.checks_passed + self.checks_failed;
        if total == 0 {
            1.0
        } else {
            f64::from(self.checks_passed) / f64::from(total)
        }
    }
}

/// Individual quality check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    /// Check name.
    pub name: String,
    /// Check status.
    pub status: CheckStatus,
    /// Human-readable message.
    pub message: String,
    /// Measured value.
    pub value: Option<f64>,
    /// Allowed band.
    pub threshold: Option<f64>,
}

/// Status of a quality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed.
    Fail,
}

// =============================================================================
// Execution Timing
// =============================================================================

/// Timing information for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTiming {
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end, once finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Elapsed time, once finished.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl ExecutionTiming {
    fn started_now() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            duration: Duration::ZERO,
        }
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration = (now - self.started_at).to_std().unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_derived_from_checks() {
        let mut result = ProcedureResult::started("sweep", "run-1");
        result.quality.add_check("readback", 0.01, 0.05, true);
        result.quality.add_check("readback", 0.09, 0.05, false);
        let result = result.finish();

        assert!(!result.success);
        assert_eq!(result.quality.checks_passed, 1);
        assert!((result.quality.pass_ratio() - 0.5).abs() < 1e-12);
        assert!(result.summary().starts_with("sweep - FAIL - Duration:"));
    }

    #[test]
    fn test_failure_summary() {
        let result = ProcedureResult::failure("ocp_search", "run-2", "Run cancelled");
        assert_eq!(result.summary(), "ocp_search - FAIL - Error: Run cancelled");
        assert!(result.timing.finished_at.is_some());
    }

    #[test]
    fn test_data_values_serialize_untagged() {
        let result = ProcedureResult::started("sweep", "run-3")
            .with_data("samples", 3usize)
            .with_data("trip_point", 10.3);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["data"]["samples"], 3);
        assert_eq!(json["data"]["trip_point"], 10.3);
    }
}
