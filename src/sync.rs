//! Meter synchronization.
//!
//! A reading is only trusted once the meter itself reports the acquisition
//! complete. [`SyncEngine::initiate_and_fetch`] arms the meter, triggers it
//! when it waits for a bus trigger, then polls the status register through
//! the meter's own completion predicate. Polling is bounded by a poll count
//! and a wall-clock timeout, whichever runs out first.

use crate::config::SyncConfig;
use crate::error::{AppResult, BenchError};
use crate::instrument::capabilities::{MeterControl, TriggerSource};
use std::time::{Duration, Instant};

/// Bounded initiate/trigger/poll/fetch cycle.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    max_polls: u32,
    poll_interval: Duration,
    timeout: Duration,
    measurement_retries: u32,
}

impl SyncEngine {
    /// Engine with the configured bounds.
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            max_polls: config.max_polls.max(1),
            poll_interval: config.poll_interval,
            timeout: config.timeout,
            measurement_retries: config.measurement_retries,
        }
    }

    /// One acquisition.
    ///
    /// A transport timeout while polling counts as an unresolved poll. Any
    /// other error is returned unchanged.
    pub async fn initiate_and_fetch(&self, meter: &dyn MeterControl) -> AppResult<f64> {
        let started = Instant::now();
        meter.initiate().await?;
        if meter.trigger_source() == TriggerSource::Bus {
            meter.trigger().await?;
        }

        let mut polls = 0u32;
        while polls < self.max_polls && started.elapsed() < self.timeout {
            polls += 1;
            match meter.operation_status().await {
                Ok(raw) if meter.is_acquisition_complete(raw) => {
                    let value = meter.fetch().await?;
                    tracing::trace!(meter = meter.name(), polls, value, "Acquisition complete");
                    return Ok(value);
                }
                Ok(raw) => {
                    tracing::trace!(meter = meter.name(), polls, raw, "Acquisition pending");
                }
                Err(BenchError::TransportTimeout { .. }) => {
                    tracing::debug!(meter = meter.name(), polls, "Status poll timed out");
                }
                Err(e) => return Err(e),
            }
            if polls < self.max_polls {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Err(BenchError::MeasurementTimeout {
            instrument: meter.name().to_string(),
            polls,
            elapsed_ms,
        })
    }

    /// [`initiate_and_fetch`](Self::initiate_and_fetch), retrying measurement
    /// timeouts up to `sync.measurement_retries` times.
    pub async fn measure_with_retry(&self, meter: &dyn MeterControl) -> AppResult<f64> {
        let mut attempt = 0;
        loop {
            match self.initiate_and_fetch(meter).await {
                Err(err @ BenchError::MeasurementTimeout { .. }) => {
                    if attempt >= self.measurement_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    tracing::warn!(
                        meter = meter.name(),
                        attempt,
                        retries = self.measurement_retries,
                        error = %err,
                        "Retrying measurement"
                    );
                }
                other => return other,
            }
        }
    }
}
