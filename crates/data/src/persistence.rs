//! Single writer in front of the observation store.
//!
//! Every batch is stably sorted by `(symbol, timestamp)` right before it is
//! written, so concurrent writers always take row locks in the same order.
//! Deadlocks and lock timeouts retry the whole batch with jittered
//! exponential backoff; any other failure aborts the batch.

use mdc_core::{Observation, PersistenceConfig};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::store::{ObservationStore, StoreError};

/// Result of a successful `upsert_batch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub records_written: u64,
    /// Attempts that failed with a retryable error before the batch went through.
    pub retries: u32,
}

/// Sorts a batch into the canonical lock order. Stable, so duplicates keep
/// their delivery order and the last one wins.
pub fn sort_for_write(batch: &mut [Observation]) {
    batch.sort_by(|a, b| {
        a.symbol
            .cmp(&b.symbol)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
}

/// Shared persistence layer, created once at startup and cloned into components.
#[derive(Clone)]
pub struct PersistenceLayer {
    store: Arc<dyn ObservationStore>,
    config: PersistenceConfig,
}

impl PersistenceLayer {
    #[must_use]
    pub fn new(store: Arc<dyn ObservationStore>, config: PersistenceConfig) -> Self {
        Self { store, config }
    }

    /// Read access for the gap detector and health scorer.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObservationStore> {
        &self.store
    }

    /// Idempotently upserts `observations` into `table`. `required` is the
    /// series' required field list, used to score merged rows.
    ///
    /// # Errors
    /// Returns the last `StoreError` when retries are exhausted, or the first
    /// non-retryable error.
    pub async fn upsert_batch(
        &self,
        table: &str,
        mut observations: Vec<Observation>,
        required: &[String],
    ) -> Result<UpsertOutcome, StoreError> {
        if observations.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        sort_for_write(&mut observations);

        let mut attempt = 0u32;
        loop {
            match self.store.write_sorted(table, &observations, required).await {
                Ok(records_written) => {
                    tracing::debug!(
                        table,
                        records = records_written,
                        retries = attempt,
                        "Batch upserted"
                    );
                    return Ok(UpsertOutcome {
                        records_written,
                        retries: attempt,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        table,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Write contention, retrying batch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        table,
                        records = observations.len(),
                        attempts = attempt + 1,
                        error = %e,
                        "Batch upsert failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// `base × 2^attempt + rand(0..=jitter)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16));
        let jitter = if self.config.max_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.max_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}
