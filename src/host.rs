//! Test Execution Host
//!
//! Runs one procedure at a time in a background task and reports on a
//! one-directional event channel.
//!
//! # Lifecycle
//!
//! ```text
//! start() ── validate config ──✗──▶ Err(ConfigValidation), no I/O
//!    │
//!    ├── lock instrument set ──✗──▶ Err(InstrumentsBusy)
//!    │
//!    ▼
//! worker task: execute_procedure_safely()  ◀── request_cancel() (token)
//!    │                                     ◀── force_abort()    (abort)
//!    ▼
//! supervisor task: forward events, await worker, emit exactly one
//!                  Completed or Aborted, release the instrument set
//! ```
//!
//! # Task Supervision
//!
//! The supervisor is the only sender of terminal events. When the worker
//! ends by forced abort or panic it never reached its own teardown, so the
//! supervisor drives the instruments to the safe state once before
//! reporting `Aborted`.

use crate::config::TestConfig;
use crate::error::{AppResult, BenchError};
use crate::instrument::{registry, InstrumentSet};
use crate::measurement::SampleRecord;
use crate::procedures::{
    execute_procedure_safely, safe_state, Procedure, ProcedureContext, ProcedureResult,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Event reported by a running test.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Status line.
    ProgressText(String),
    /// Completion in percent, `0..=100`.
    ProgressPercent(u8),
    /// A measurement record.
    Sample(SampleRecord),
    /// The run failed; followed by `Aborted`.
    Error(String),
    /// Terminal: the procedure ran to the end.
    Completed(ProcedureResult),
    /// Terminal: cancelled, aborted or failed.
    Aborted(ProcedureResult),
}

impl HostEvent {
    /// True for `Completed` and `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostEvent::Completed(_) | HostEvent::Aborted(_))
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The procedure ran to the end. Its checks may still have failed.
    Completed(ProcedureResult),
    /// Cancelled, aborted, or ended by an error.
    Aborted(ProcedureResult),
}

impl RunOutcome {
    /// The result carried by either variant.
    pub fn result(&self) -> &ProcedureResult {
        match self {
            RunOutcome::Completed(result) | RunOutcome::Aborted(result) => result,
        }
    }

    /// True for `Completed`.
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

// =============================================================================
// Run Handle
// =============================================================================

/// Control and observation handle for one run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    events: mpsc::UnboundedReceiver<HostEvent>,
    cancel: CancellationToken,
    abort: AbortHandle,
    supervisor: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Ask the procedure to stop at its next step boundary.
    pub fn request_cancel(&self) {
        tracing::info!(run_id = %self.run_id, "Cancellation requested");
        self.cancel.cancel();
    }

    /// Abort the procedure task immediately. The host restores the safe state.
    pub fn force_abort(&self) {
        tracing::warn!(run_id = %self.run_id, "Forced abort requested");
        self.abort.abort();
    }

    /// Next event; `None` once the terminal event has been delivered.
    pub async fn next_event(&mut self) -> Option<HostEvent> {
        self.events.recv().await
    }

    /// Wait for the run to end, discarding undelivered events.
    pub async fn wait(self) -> AppResult<RunOutcome> {
        self.supervisor
            .await
            .map_err(|e| BenchError::Internal(format!("Run supervisor failed: {e}")))
    }

    /// Drain every event, then return them with the outcome.
    pub async fn collect(mut self) -> AppResult<(RunOutcome, Vec<HostEvent>)> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self.wait().await?;
        Ok((outcome, events))
    }
}

// =============================================================================
// Host
// =============================================================================

/// Owns the instrument set and runs procedures against it.
#[derive(Debug, Clone)]
pub struct TestExecutionHost {
    instruments: Arc<Mutex<InstrumentSet>>,
}

impl TestExecutionHost {
    /// Host over an already connected instrument set.
    pub fn new(instruments: InstrumentSet) -> Self {
        Self {
            instruments: Arc::new(Mutex::new(instruments)),
        }
    }

    /// Validate `config` and connect its instruments.
    pub async fn connect(config: &TestConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self::new(registry::connect(config).await?))
    }

    /// Start `procedure` in the background.
    ///
    /// Fails without touching any instrument when the configuration does not
    /// validate for the procedure, and with `InstrumentsBusy` while another
    /// run holds the instruments.
    pub fn start(
        &self,
        mut procedure: Box<dyn Procedure>,
        config: Arc<TestConfig>,
    ) -> AppResult<RunHandle> {
        procedure.validate(&config)?;
        let guard = Arc::clone(&self.instruments)
            .try_lock_owned()
            .map_err(|_| BenchError::InstrumentsBusy)?;

        let run_id = Uuid::new_v4().to_string();
        let procedure_type = procedure.type_id();
        let cancel = CancellationToken::new();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ctx = ProcedureContext::new(
            run_id.clone(),
            Arc::clone(&config),
            guard.clone(),
            internal_tx,
            cancel.clone(),
        );
        tracing::info!(%run_id, procedure = procedure_type, "Starting run");

        let worker = tokio::spawn(async move {
            execute_procedure_safely(procedure.as_mut(), &ctx).await
        });
        let abort = worker.abort_handle();

        let run = RunInfo {
            run_id: run_id.clone(),
            procedure_type,
            config,
            events_tx,
        };
        let supervisor = tokio::spawn(supervise(run, guard, worker, internal_rx));

        Ok(RunHandle {
            run_id,
            events: events_rx,
            cancel,
            abort,
            supervisor,
        })
    }
}

/// What the supervisor needs to report on a run.
struct RunInfo {
    run_id: String,
    procedure_type: &'static str,
    config: Arc<TestConfig>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
}

impl RunInfo {
    fn send(&self, event: HostEvent) {
        let _ = self.events_tx.send(event);
    }

    fn failure(&self, reason: impl Into<String>) -> RunOutcome {
        RunOutcome::Aborted(ProcedureResult::failure(
            self.procedure_type,
            &self.run_id,
            reason,
        ))
    }
}

async fn supervise(
    run: RunInfo,
    guard: OwnedMutexGuard<InstrumentSet>,
    mut worker: JoinHandle<AppResult<ProcedureResult>>,
    mut internal_rx: mpsc::UnboundedReceiver<HostEvent>,
) -> RunOutcome {
    let mut progress = Vec::new();
    let forward = |event: HostEvent, progress: &mut Vec<String>| {
        if let HostEvent::ProgressText(text) = &event {
            progress.push(text.clone());
        }
        run.send(event);
    };

    let joined = loop {
        tokio::select! {
            Some(event) = internal_rx.recv() => forward(event, &mut progress),
            joined = &mut worker => break joined,
        }
    };
    while let Ok(event) = internal_rx.try_recv() {
        forward(event, &mut progress);
    }

    let outcome = match joined {
        Ok(Ok(result)) => RunOutcome::Completed(result),
        Ok(Err(BenchError::Cancelled)) => {
            run.send(HostEvent::ProgressText("Run cancelled".into()));
            run.failure(BenchError::Cancelled.to_string())
        }
        Ok(Err(err)) => {
            report_error(&run, &err.to_string(), &progress).await;
            run.failure(err.to_string())
        }
        Err(join_err) => recover(&run, &guard, join_err, &progress).await,
    };

    let terminal = match &outcome {
        RunOutcome::Completed(result) => HostEvent::Completed(result.clone()),
        RunOutcome::Aborted(result) => HostEvent::Aborted(result.clone()),
    };
    tracing::info!(
        run_id = %run.run_id,
        summary = %outcome.result().summary(),
        "Run finished"
    );
    run.send(terminal);
    drop(guard);
    outcome
}

/// The worker never reached its own teardown: restore the safe state here.
async fn recover(
    run: &RunInfo,
    instruments: &InstrumentSet,
    join_err: JoinError,
    progress: &[String],
) -> RunOutcome {
    let panicked = join_err.is_panic();
    let reason = if panicked {
        format!("Procedure panicked: {join_err}")
    } else {
        "Run aborted".to_string()
    };
    tracing::warn!(run_id = %run.run_id, %reason, "Restoring safe state");

    if let Err(teardown_err) = safe_state::teardown(instruments).await {
        tracing::error!(
            run_id = %run.run_id,
            error = %teardown_err,
            "Safe-state recovery failed"
        );
    }
    if panicked {
        report_error(run, &reason, progress).await;
    }
    run.failure(reason)
}

async fn report_error(run: &RunInfo, error: &str, progress: &[String]) {
    tracing::error!(run_id = %run.run_id, error, "Run failed");
    run.send(HostEvent::Error(error.to_string()));

    if let Some(dir) = &run.config.application.diagnostics_dir {
        let trace = DiagnosticTrace {
            run_id: &run.run_id,
            procedure: run.procedure_type,
            error,
            timestamp: Utc::now(),
            progress,
            config: &run.config,
        };
        match write_diagnostics(dir, &trace).await {
            Ok(path) => tracing::info!(path = %path.display(), "Diagnostic trace saved"),
            Err(e) => tracing::warn!(error = %e, "Could not save diagnostic trace"),
        }
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// JSON document saved when a run errors.
#[derive(Debug, Serialize)]
pub struct DiagnosticTrace<'a> {
    /// Run identifier.
    pub run_id: &'a str,
    /// Procedure type.
    pub procedure: &'a str,
    /// Error text.
    pub error: &'a str,
    /// When the trace was written.
    pub timestamp: DateTime<Utc>,
    /// Progress lines seen before the error.
    pub progress: &'a [String],
    /// Configuration the run used.
    pub config: &'a TestConfig,
}

/// Write `trace` as `<dir>/<run_id>.json`.
pub async fn write_diagnostics(dir: &Path, trace: &DiagnosticTrace<'_>) -> AppResult<PathBuf> {
    let json = serde_json::to_string_pretty(trace)
        .map_err(|e| BenchError::Internal(format!("Cannot serialize diagnostic trace: {e}")))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| BenchError::Internal(format!("Cannot create {}: {e}", dir.display())))?;
    let path = dir.join(format!("{}.json", trace.run_id));
    tokio::fs::write(&path, json)
        .await
        .map_err(|e| BenchError::Internal(format!("Cannot write {}: {e}", path.display())))?;
    Ok(path)
}
