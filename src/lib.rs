//! # power_bench
//!
//! Characterization of DC power sources with a bench of SCPI instruments: a
//! source under test, an electronic load, a reference DMM, and optionally an
//! oscilloscope and a line supply.
//!
//! ## Crate Structure
//!
//! - **`config`**: the immutable [`config::TestConfig`], loaded with figment
//!   from TOML plus `POWER_BENCH_` environment overrides, or from a flat
//!   key/value map, and validated before any instrument is touched.
//! - **`error`**: the [`error::BenchError`] taxonomy and [`error::AppResult`].
//! - **`instrument`**: SCPI sessions, capability traits, vendor dialects, the
//!   kind-keyed registry and the simulated bench.
//! - **`sync`**: bounded initiate/trigger/poll/fetch for meter readings.
//! - **`procedures`**: sweeps, OVP/OCP trip-point search, load and line
//!   regulation, and the safe-state teardown every run ends with.
//! - **`host`**: runs one procedure at a time and reports progress, samples
//!   and exactly one terminal event.
//! - **`measurement`**: the records emitted by the procedures.
//! - **`tracing_setup`**: tracing subscriber bootstrap.

pub mod config;
pub mod error;
pub mod host;
pub mod instrument;
pub mod measurement;
pub mod procedures;
pub mod sync;
pub mod tracing_setup;

pub use config::TestConfig;
pub use error::{AppResult, BenchError};
pub use host::{HostEvent, RunHandle, RunOutcome, TestExecutionHost};
