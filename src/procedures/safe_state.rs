//! Safe-state teardown.
//!
//! Leaves the bench with the load input off, the source output off and
//! zeroed, the source channels independent, and the line supply off.
//!
//! Teardown is idempotent and fault-tolerant: every step is attempted even
//! when an earlier one failed, and all failures come back together as
//! [`BenchError::TeardownFailed`].

use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::TopologyMode;
use crate::instrument::InstrumentSet;
use std::future::Future;

async fn attempt<F>(errors: &mut Vec<BenchError>, step: &str, action: F)
where
    F: Future<Output = AppResult<()>>,
{
    if let Err(e) = action.await {
        tracing::error!(step, error = %e, "Safe-state step failed");
        errors.push(e);
    }
}

/// Drive every instrument to its safe state.
pub async fn teardown(instruments: &InstrumentSet) -> AppResult<()> {
    let mut errors = Vec::new();
    let load = &instruments.load;
    let source = &instruments.source;

    attempt(&mut errors, "load input off", load.set_input(false)).await;
    attempt(&mut errors, "load current zero", load.set_current(0.0)).await;
    attempt(&mut errors, "source output off", source.set_output(false)).await;
    attempt(&mut errors, "source voltage zero", source.set_voltage(0.0)).await;
    attempt(&mut errors, "source current zero", source.set_current(0.0)).await;
    attempt(
        &mut errors,
        "source topology independent",
        source.set_topology(TopologyMode::Independent),
    )
    .await;

    if let Some(line) = &instruments.line_supply {
        attempt(&mut errors, "line supply output off", line.set_output(false)).await;
        attempt(&mut errors, "line supply voltage zero", line.set_voltage(0.0)).await;
    }

    if errors.is_empty() {
        tracing::info!("Instruments in safe state");
        Ok(())
    } else {
        Err(BenchError::TeardownFailed(errors))
    }
}
