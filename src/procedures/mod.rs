//! Procedure Framework
//!
//! A procedure is one characterization test: a sweep, a protection trip-point
//! search, or a regulation check. Procedures are written against the
//! capability traits and a [`ProcedureContext`]; they never own the
//! instruments or the configuration.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       TestExecutionHost                          │
//! │  validate config → lock instruments → spawn → events → terminal   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                   execute_procedure_safely                       │
//! │  execute() → safe_state::teardown() on every exit path           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                        Procedure Trait                           │
//! │  SweepProcedure | ThresholdSearchProcedure | RegulationProcedure │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                 SyncEngine + Capability Traits                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod regulation;
pub mod result;
pub mod safe_state;
pub mod sweep;
pub mod threshold_search;

pub use regulation::RegulationProcedure;
pub use result::{CheckStatus, ProcedureResult, QualityMetrics, ResultValue};
pub use sweep::SweepProcedure;
pub use threshold_search::ThresholdSearchProcedure;

use crate::config::{TestConfig, TestKind};
use crate::error::{AppResult, BenchError};
use crate::host::HostEvent;
use crate::instrument::InstrumentSet;
use crate::measurement::SampleRecord;
use crate::sync::SyncEngine;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

// =============================================================================
// Procedure Trait
// =============================================================================

/// One characterization test.
///
/// `execute` must check [`ProcedureContext::check_cancelled`] between
/// logical steps. Safe-state teardown is not its job:
/// [`execute_procedure_safely`] runs it on every exit path.
#[async_trait]
pub trait Procedure: Send + 'static {
    /// Type identifier (e.g. `"sweep"`, `"threshold_search"`).
    fn type_id(&self) -> &'static str;

    /// Configuration section this procedure needs.
    fn test_kind(&self) -> TestKind;

    /// Check the configuration before any instrument is touched.
    fn validate(&self, config: &TestConfig) -> AppResult<()> {
        config.validate_for(self.test_kind())
    }

    /// Run the test.
    async fn execute(&mut self, ctx: &ProcedureContext) -> AppResult<ProcedureResult>;
}

// =============================================================================
// Procedure Context
// =============================================================================

/// Everything a running procedure may touch.
pub struct ProcedureContext {
    run_id: String,
    config: Arc<TestConfig>,
    instruments: InstrumentSet,
    sync: SyncEngine,
    events: mpsc::UnboundedSender<HostEvent>,
    cancel: CancellationToken,
}

impl ProcedureContext {
    /// Create a context.
    pub fn new(
        run_id: impl Into<String>,
        config: Arc<TestConfig>,
        instruments: InstrumentSet,
        events: mpsc::UnboundedSender<HostEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let sync = SyncEngine::new(&config.sync);
        Self {
            run_id: run_id.into(),
            config,
            instruments,
            sync,
            events,
            cancel,
        }
    }

    /// Run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The run's configuration.
    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// The run's instruments.
    pub fn instruments(&self) -> &InstrumentSet {
        &self.instruments
    }

    /// Meter synchronization.
    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    fn send(&self, event: HostEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.events.send(event);
    }

    /// Report a status line.
    pub fn progress_text(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(run_id = %self.run_id, "{text}");
        self.send(HostEvent::ProgressText(text));
    }

    /// Report `done` of `total` steps as a percentage.
    pub fn progress(&self, done: usize, total: usize) {
        let percent = if total == 0 {
            100
        } else {
            (done.min(total) * 100 / total) as u8
        };
        self.send(HostEvent::ProgressPercent(percent));
    }

    /// Hand a record to the report collaborator.
    pub fn emit(&self, record: SampleRecord) {
        self.send(HostEvent::Sample(record));
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            Err(BenchError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait out a settling delay.
    pub async fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

// =============================================================================
// Safe Procedure Execution
// =============================================================================

/// Execute a procedure with guaranteed safe-state teardown.
///
/// Teardown runs after `execute` returns, whatever it returned. A teardown
/// failure never masks the procedure's own error; it is only returned when
/// the procedure itself succeeded.
pub async fn execute_procedure_safely(
    procedure: &mut dyn Procedure,
    ctx: &ProcedureContext,
) -> AppResult<ProcedureResult> {
    let span = tracing::info_span!("procedure", kind = procedure.type_id(), run_id = %ctx.run_id);
    let result = procedure.execute(ctx).instrument(span).await;
    let teardown = safe_state::teardown(ctx.instruments()).await;

    match (result, teardown) {
        (Ok(result), Ok(())) => Ok(result),
        (Ok(_), Err(teardown_err)) => Err(teardown_err),
        (Err(err), Err(teardown_err)) => {
            tracing::error!(
                error = %err,
                teardown = %teardown_err,
                "Teardown failed after procedure error"
            );
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
    }
}
