//! Custom error types for the bench.
//!
//! This module defines the primary error type, `BenchError`, shared by the
//! instrument layer, the measurement engines and the execution host. Using the
//! `thiserror` crate, it gives every failure a stable category so callers can
//! decide between retrying, recording a failed measurement, or aborting a run.
//!
//! ## Error Hierarchy
//!
//! - **`InstrumentIo`**: transport or instrument failure. Fatal for the run and
//!   carries the raw text reported by the instrument or socket.
//! - **`TransportTimeout`**: a read timed out at the transport. The sync engine
//!   counts it as an unresolved poll; everywhere else it is fatal.
//! - **`MeasurementTimeout`**: a meter acquisition never reported completion
//!   within the polling bound. Retried by the sweep controller.
//! - **`Config`** / **`ConfigValidation`**: raised before any instrument is
//!   touched.
//! - **`RegulationModeViolation`**: the source left the declared regulation
//!   mode. Retried with reduced stress, then recorded as a failed measurement.
//! - **`Cancelled`**: the normal path for a user-requested stop. Teardown still
//!   runs.
//! - **`TeardownFailed`**: one or more safe-state steps failed. Logged, never
//!   allowed to mask the error that caused the teardown.

use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

/// Every failure the bench can report.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Figment could not load or deserialize the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but is incomplete or inconsistent.
    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    /// Transport failure or instrument-reported error.
    #[error("Instrument I/O error on '{instrument}': {message}")]
    InstrumentIo {
        /// Instrument name from the configuration.
        instrument: String,
        /// Raw error text.
        message: String,
    },

    /// A transport read did not complete in time.
    #[error("Transport timeout on '{instrument}'")]
    TransportTimeout {
        /// Instrument name from the configuration.
        instrument: String,
    },

    /// Meter acquisition was not confirmed complete within the polling bound.
    #[error("Measurement timeout on '{instrument}' after {polls} polls ({elapsed_ms} ms)")]
    MeasurementTimeout {
        /// Meter name.
        instrument: String,
        /// Polls issued before giving up.
        polls: u32,
        /// Wall-clock time spent polling.
        elapsed_ms: u64,
    },

    /// The source was not in the expected regulation mode.
    #[error("Regulation mode violation: expected {expected}, source reported {actual}")]
    RegulationModeViolation {
        /// Mode the test declared.
        expected: String,
        /// Mode the source reported.
        actual: String,
    },

    /// A cancellation request was honored.
    #[error("Run cancelled")]
    Cancelled,

    /// Another run already holds the instrument set.
    #[error("Instrument set is held by another run")]
    InstrumentsBusy,

    /// Safe-state teardown hit one or more failures.
    #[error("Teardown failed with {} error(s)", .0.len())]
    TeardownFailed(Vec<BenchError>),

    /// Unexpected internal failure (for example a panicked task).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for BenchError {
    fn from(err: figment::Error) -> Self {
        BenchError::Config(Box::new(err))
    }
}

impl BenchError {
    /// Builds an `InstrumentIo` error from any displayable cause.
    pub fn io(instrument: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BenchError::InstrumentIo {
            instrument: instrument.into(),
            message: message.to_string(),
        }
    }

    /// True for the cancellation path.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BenchError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BenchError::io("dmm", "-113,\"Undefined header\"");
        assert_eq!(
            err.to_string(),
            "Instrument I/O error on 'dmm': -113,\"Undefined header\""
        );
    }

    #[test]
    fn test_teardown_failed_error() {
        let err = BenchError::TeardownFailed(vec![
            BenchError::io("source", "socket closed"),
            BenchError::TransportTimeout {
                instrument: "load".into(),
            },
        ]);
        assert_eq!(err.to_string(), "Teardown failed with 2 error(s)");
    }

    #[test]
    fn test_cancellation_predicate() {
        assert!(BenchError::Cancelled.is_cancellation());
        assert!(!BenchError::InstrumentsBusy.is_cancellation());
    }
}
