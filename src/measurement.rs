//! Measurement records produced by the engines.
//!
//! Every record is emitted once through the host event stream and then belongs
//! to whichever collaborator consumes it (report writer, GUI, log).

use serde::{Deserialize, Serialize};

/// Gain/offset tolerance pair.
///
/// The accepted band around a nominal value is `±(|value| × gain + offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    /// Proportional part of the band (0.01 = 1 %).
    pub gain: f64,
    /// Fixed part of the band, in the unit of the checked value.
    pub offset: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            gain: 0.0,
            offset: 0.0,
        }
    }
}

impl Tolerance {
    /// Half-width of the band around `nominal`.
    pub fn band(&self, nominal: f64) -> f64 {
        nominal.abs() * self.gain + self.offset
    }

    /// True when `actual` lies inside the band around `nominal`.
    pub fn accepts(&self, nominal: f64, actual: f64) -> bool {
        (actual - nominal).abs() <= self.band(nominal)
    }
}

/// A voltage/current pair.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VoltageCurrent {
    /// Volts.
    pub voltage: f64,
    /// Amps.
    pub current: f64,
}

impl VoltageCurrent {
    /// Creates a pair.
    pub fn new(voltage: f64, current: f64) -> Self {
        Self { voltage, current }
    }

    /// Product V×I in watts.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

/// Tolerances a sweep sample is graded against.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReadbackTolerance {
    /// Source read-back voltage, and meter versus source.
    pub voltage: Tolerance,
    /// Source read-back current.
    pub current: Tolerance,
}

/// One programmed/measured point of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Position in emission order, starting at 0.
    pub index: usize,
    /// Set-points sent to the instruments.
    pub programmed: VoltageCurrent,
    /// Read-back from the source's own measurement system.
    pub measured_at_source: VoltageCurrent,
    /// Reference meter reading taken after acquisition was confirmed complete.
    pub measured_at_meter: f64,
    /// Output ripple from the scope, when one is assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ripple_pp: Option<f64>,
    /// Source read-back minus programmed voltage.
    pub voltage_delta: f64,
    /// Source read-back minus programmed current.
    pub current_delta: f64,
    /// Meter reading minus source read-back voltage.
    pub meter_delta: f64,
    /// Every delta inside its tolerance band.
    pub pass: bool,
}

impl Sample {
    /// Build a sample and grade it.
    ///
    /// Read-back voltage and current are checked against the programmed
    /// pair, the meter reading against the read-back voltage.
    pub fn graded(
        index: usize,
        programmed: VoltageCurrent,
        measured_at_source: VoltageCurrent,
        measured_at_meter: f64,
        ripple_pp: Option<f64>,
        tolerance: &ReadbackTolerance,
    ) -> Self {
        let pass = tolerance
            .voltage
            .accepts(programmed.voltage, measured_at_source.voltage)
            && tolerance
                .current
                .accepts(programmed.current, measured_at_source.current)
            && tolerance
                .voltage
                .accepts(measured_at_source.voltage, measured_at_meter);
        Self {
            index,
            programmed,
            measured_at_source,
            measured_at_meter,
            ripple_pp,
            voltage_delta: measured_at_source.voltage - programmed.voltage,
            current_delta: measured_at_source.current - programmed.current,
            meter_delta: measured_at_meter - measured_at_source.voltage,
            pass,
        }
    }
}

/// Result of one reference/perturbed regulation measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulationSample {
    /// Meter reading at the reference condition.
    pub reference: f64,
    /// Meter reading at the perturbed condition, if one was trusted.
    pub perturbed: Option<f64>,
    /// Allowed deviation, `rated × gain + offset`.
    pub desired_delta: f64,
    /// `perturbed − reference`, if a perturbed reading was trusted.
    pub actual_delta: Option<f64>,
    /// Verdict.
    pub pass: bool,
    /// Backoff retries spent because the source left its regulation mode.
    pub retries: u32,
    /// Perturbation target finally applied.
    pub stress: f64,
}

/// Outcome of an OVP/OCP trip-point search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Protection level under test.
    pub target: f64,
    /// Converged probe value.
    pub trip_point: f64,
    /// Probes issued.
    pub iterations: u32,
    /// `|trip_point − target|` within the tolerance band.
    pub pass: bool,
}

/// Any record an engine hands to the report collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SampleRecord {
    /// Sweep point.
    Sweep(Sample),
    /// Regulation measurement.
    Regulation(RegulationSample),
    /// Protection trip-point search.
    Threshold(SearchOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_band() {
        let tol = Tolerance {
            gain: 0.01,
            offset: 0.05,
        };
        assert!((tol.band(10.0) - 0.15).abs() < 1e-12);
        assert!(tol.accepts(10.0, 10.14));
        assert!(!tol.accepts(10.0, 10.16));
        assert!(tol.accepts(-10.0, -9.9));
    }

    #[test]
    fn test_sample_deltas() {
        let tolerance = ReadbackTolerance {
            voltage: Tolerance {
                gain: 0.0,
                offset: 0.05,
            },
            current: Tolerance {
                gain: 0.0,
                offset: 0.02,
            },
        };
        let sample = Sample::graded(
            0,
            VoltageCurrent::new(5.0, 1.0),
            VoltageCurrent::new(5.02, 0.99),
            5.01,
            None,
            &tolerance,
        );
        assert!((sample.voltage_delta - 0.02).abs() < 1e-9);
        assert!((sample.current_delta + 0.01).abs() < 1e-9);
        assert!((sample.meter_delta + 0.01).abs() < 1e-9);
        assert!(sample.pass);
    }

    #[test]
    fn test_current_outside_band_fails_sample() {
        let tolerance = ReadbackTolerance {
            voltage: Tolerance {
                gain: 0.0,
                offset: 0.05,
            },
            current: Tolerance {
                gain: 0.01,
                offset: 0.0,
            },
        };
        let sample = Sample::graded(
            3,
            VoltageCurrent::new(10.0, 6.0),
            VoltageCurrent::new(10.0, 5.0),
            10.0,
            None,
            &tolerance,
        );
        assert!((sample.current_delta + 1.0).abs() < 1e-9);
        assert!(!sample.pass);

        let json = serde_json::to_value(SampleRecord::Sweep(sample)).unwrap();
        assert_eq!(json["kind"], "sweep");
        assert_eq!(json["pass"], false);
        assert_eq!(json["current_delta"], -1.0);
        assert_eq!(json["voltage_delta"], 0.0);
        assert_eq!(json["meter_delta"], 0.0);
    }

    #[test]
    fn test_record_serializes_with_kind_tag() {
        let record = SampleRecord::Threshold(SearchOutcome {
            target: 10.0,
            trip_point: 10.3,
            iterations: 12,
            pass: false,
        });
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"kind\":\"threshold\""));
    }
}
