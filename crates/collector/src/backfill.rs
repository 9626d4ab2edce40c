//! Backfill scheduler.
//!
//! Turns gaps into bounded fetch / persist tasks. Symbols run concurrently
//! up to `concurrency`; the sub-ranges of one symbol run strictly one after
//! another, oldest first, so writes for a symbol land in timestamp order.
//!
//! Failure handling per sub-range:
//! - `Transient` (and fetch timeouts) retry in place with capped exponential backoff
//! - `RateLimited` requeues at the back of the symbol's queue with a growing delay
//! - `NotFound` drops the symbol for this source
//! - `Malformed` drops the sub-range
//!
//! The run stops dispatching once its wall-clock budget is spent or
//! cancellation is requested; the fetch in flight finishes first.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::{stream, StreamExt};
use mdc_core::{
    is_valid_cadence, CancelSignal, CollectionRun, FailureReason, Gap, Observation, SchedulerConfig, SourceAdapter,
    SourceError, StopReason, SubRangeFailure, SymbolRunSummary,
};
use mdc_data::{PersistenceLayer, StoreError};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::gap_detector::{GapDetector, GapQuery};
use crate::rate_limiter::SourceRateLimiter;

/// Upper bound of the random delay added to a rate-limit requeue.
const REQUEUE_JITTER_MS: u64 = 250;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackfillError {
    #[error("invalid backfill configuration: {0}")]
    InvalidConfig(String),
}

/// What to collect in one run.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub table: String,
    pub symbols: Vec<String>,
    pub cadence: ChronoDuration,
    pub desired_start: DateTime<Utc>,
    pub desired_end: DateTime<Utc>,
    pub lookback_days: i64,
    /// Completeness of fetched rows is measured against these fields.
    pub required_fields: Vec<String>,
}

/// A sub-range waiting in a symbol's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SubRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    retries: u32,
    requeues: u32,
    not_before: Option<Instant>,
}

/// Splits a gap into inclusive sub-ranges no longer than `max_span`.
#[must_use]
pub fn split_gap(
    gap: &Gap,
    cadence: ChronoDuration,
    max_span: ChronoDuration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    if !is_valid_cadence(cadence) {
        return Vec::new();
    }
    let Some((first, last)) = gap.fetch_range(cadence) else {
        return Vec::new();
    };

    // Slots per request, at least one.
    let per_request = (max_span.num_seconds() / cadence.num_seconds()).max(1);
    let step = cadence * i32::try_from(per_request).unwrap_or(i32::MAX);

    let mut ranges = Vec::new();
    let mut start = first;
    while start <= last {
        let end = (start + step - cadence).min(last);
        ranges.push((start, end));
        start = end + cadence;
    }
    ranges
}

/// Per-symbol result before it is folded into the run.
struct SymbolOutcome {
    symbol: String,
    summary: SymbolRunSummary,
    failures: Vec<SubRangeFailure>,
    stopped: Option<StopReason>,
    undispatched: usize,
}

/// Runs backfills against one source.
#[derive(Clone)]
pub struct BackfillScheduler {
    persistence: PersistenceLayer,
    detector: GapDetector,
    limiter: Arc<SourceRateLimiter>,
    config: SchedulerConfig,
}

impl BackfillScheduler {
    #[must_use]
    pub fn new(
        persistence: PersistenceLayer,
        detector: GapDetector,
        limiter: Arc<SourceRateLimiter>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            persistence,
            detector,
            limiter,
            config,
        }
    }

    fn validate(&self, request: &BackfillRequest) -> Result<(), BackfillError> {
        if !is_valid_cadence(request.cadence) {
            return Err(BackfillError::InvalidConfig(format!(
                "{}: cadence must be a positive whole number of seconds",
                request.table
            )));
        }
        if self.config.max_batch_span_secs <= 0 {
            return Err(BackfillError::InvalidConfig(
                "max batch span must be positive".to_string(),
            ));
        }
        if self.config.concurrency == 0 {
            return Err(BackfillError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if !mdc_core::config::is_valid_identifier(&request.table) {
            return Err(BackfillError::InvalidConfig(format!(
                "invalid table name {:?}",
                request.table
            )));
        }
        Ok(())
    }

    /// Backfills every requested symbol and reports what happened.
    ///
    /// Partial failures are reported inside the returned run, never as `Err`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` before any work if the request cannot run.
    pub async fn run(
        &self,
        request: &BackfillRequest,
        source: Arc<dyn SourceAdapter>,
        cancel: &CancelSignal,
    ) -> Result<CollectionRun, BackfillError> {
        self.validate(request)?;

        let started = Instant::now();
        let deadline = started + self.config.max_run_duration();
        let mut run = CollectionRun::new(source.name(), &request.symbols);

        tracing::info!(
            table = %request.table,
            source = source.name(),
            symbols = request.symbols.len(),
            start = %request.desired_start,
            end = %request.desired_end,
            "Backfill run starting"
        );

        let outcomes: Vec<SymbolOutcome> = stream::iter(request.symbols.iter().cloned())
            .map(|symbol| {
                let source = Arc::clone(&source);
                async move {
                    self.process_symbol(request, symbol, source.as_ref(), deadline, cancel)
                        .await
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            if let Some(reason) = outcome.stopped {
                // Cancellation wins over the deadline when both were hit.
                if run.stopped_early != Some(StopReason::Cancelled) {
                    run.stopped_early = Some(reason);
                }
            }
            run.undispatched += outcome.undispatched;
            run.absorb(&outcome.symbol, outcome.summary, outcome.failures);
        }
        run.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        tracing::info!(
            table = %request.table,
            source = %run.source,
            outcome = ?run.outcome(),
            "Backfill run finished. {}",
            run.summary()
        );

        Ok(run)
    }

    fn stop_reason(deadline: Instant, cancel: &CancelSignal) -> Option<StopReason> {
        if cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if Instant::now() >= deadline {
            Some(StopReason::Deadline)
        } else {
            None
        }
    }

    fn retry_delay(&self, retries: u32) -> Duration {
        let base = self.config.retry_base_delay();
        base.saturating_mul(1u32 << retries.min(16))
            .min(self.config.retry_max_delay())
    }

    fn requeue_delay(&self, requeues: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self
            .config
            .requeue_base_delay()
            .saturating_mul(1u32 << requeues.min(16));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=REQUEUE_JITTER_MS));
        retry_after.map_or(backoff, |hint| hint.max(backoff)) + jitter
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    async fn pause(delay: Duration, cancel: &CancelSignal) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = cancel.cancelled() => false,
        }
    }

    async fn process_symbol(
        &self,
        request: &BackfillRequest,
        symbol: String,
        source: &dyn SourceAdapter,
        deadline: Instant,
        cancel: &CancelSignal,
    ) -> SymbolOutcome {
        let mut outcome = SymbolOutcome {
            symbol: symbol.clone(),
            summary: SymbolRunSummary::default(),
            failures: Vec::new(),
            stopped: None,
            undispatched: 0,
        };

        let query = GapQuery {
            table: &request.table,
            symbol: &symbol,
            desired_start: request.desired_start,
            desired_end: request.desired_end,
            cadence: request.cadence,
            lookback_days: request.lookback_days,
        };
        let gaps = match self.detector.find_gaps(&query).await {
            Ok(gaps) => gaps,
            Err(e) => {
                tracing::error!(symbol = %symbol, table = %request.table, error = %e, "Gap detection failed");
                outcome.summary.error = Some(format!("gap detection failed: {e}"));
                return outcome;
            }
        };
        outcome.summary.gaps_found = gaps.len();

        let mut queue: VecDeque<SubRange> = gaps
            .iter()
            .flat_map(|gap| split_gap(gap, request.cadence, self.config.max_batch_span()))
            .map(|(start, end)| SubRange {
                start,
                end,
                retries: 0,
                requeues: 0,
                not_before: None,
            })
            .collect();

        if !gaps.is_empty() {
            tracing::debug!(
                symbol = %symbol,
                gaps = gaps.len(),
                sub_ranges = queue.len(),
                "Gaps queued"
            );
        }

        while let Some(mut task) = queue.pop_front() {
            if let Some(reason) = Self::stop_reason(deadline, cancel) {
                outcome.stopped = Some(reason);
                outcome.undispatched = queue.len() + 1;
                tracing::info!(
                    symbol = %symbol,
                    reason = ?reason,
                    remaining = outcome.undispatched,
                    "Stopping before next sub-range"
                );
                break;
            }

            if let Some(not_before) = task.not_before {
                // Never sleep past the run budget.
                let wait = not_before.min(deadline).saturating_duration_since(Instant::now());
                if !wait.is_zero() && !Self::pause(wait, cancel).await {
                    outcome.stopped = Some(StopReason::Cancelled);
                    outcome.undispatched = queue.len() + 1;
                    break;
                }
                if let Some(reason) = Self::stop_reason(deadline, cancel) {
                    outcome.stopped = Some(reason);
                    outcome.undispatched = queue.len() + 1;
                    tracing::info!(
                        symbol = %symbol,
                        reason = ?reason,
                        remaining = outcome.undispatched,
                        "Stopping while sub-range awaited requeue"
                    );
                    break;
                }
            }

            if task.retries == 0 && task.requeues == 0 {
                outcome.summary.batches_attempted += 1;
            }

            self.limiter.acquire(source.name()).await;
            let fetched = match tokio::time::timeout(
                self.config.fetch_timeout(),
                source.fetch(&symbol, task.start, task.end),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SourceError::transient(format!(
                    "fetch timed out after {}s",
                    self.config.fetch_timeout_secs
                ))),
            };

            match fetched {
                Ok(rows) => {
                    let rows = normalize(rows, &symbol, task.start, task.end, request);
                    match self
                        .persistence
                        .upsert_batch(&request.table, rows, &request.required_fields)
                        .await
                    {
                        Ok(written) => {
                            outcome.summary.batches_succeeded += 1;
                            outcome.summary.records_written += written.records_written;
                        }
                        Err(StoreError::PoolExhausted) => {
                            tracing::error!(symbol = %symbol, "Connection pool exhausted, abandoning symbol");
                            outcome.summary.batches_failed += 1;
                            outcome.failures.push(failure(&symbol, &task, FailureReason::Persistence, "connection pool exhausted"));
                            outcome.summary.error = Some("connection pool exhausted".to_string());
                            outcome.undispatched = queue.len();
                            break;
                        }
                        Err(e) => {
                            outcome.summary.batches_failed += 1;
                            outcome.failures.push(failure(&symbol, &task, FailureReason::Persistence, &e.to_string()));
                        }
                    }
                }
                Err(SourceError::Transient(message)) => {
                    if task.retries < self.config.max_retries {
                        let delay = self.retry_delay(task.retries);
                        tracing::warn!(
                            symbol = %symbol,
                            start = %task.start,
                            end = %task.end,
                            attempt = task.retries + 1,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %message,
                            "Transient fetch failure, retrying"
                        );
                        if !Self::pause(delay, cancel).await {
                            outcome.stopped = Some(StopReason::Cancelled);
                            outcome.undispatched = queue.len() + 1;
                            break;
                        }
                        task.retries += 1;
                        queue.push_front(task);
                    } else {
                        tracing::error!(symbol = %symbol, start = %task.start, end = %task.end, error = %message, "Retries exhausted");
                        outcome.summary.batches_failed += 1;
                        outcome.failures.push(failure(&symbol, &task, FailureReason::RetriesExhausted, &message));
                    }
                }
                Err(SourceError::RateLimited { retry_after }) => {
                    if task.requeues < self.config.max_requeues {
                        let delay = self.requeue_delay(task.requeues, retry_after);
                        tracing::warn!(
                            symbol = %symbol,
                            start = %task.start,
                            requeues = task.requeues + 1,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Rate limited, requeueing sub-range"
                        );
                        task.requeues += 1;
                        task.not_before = Some(Instant::now() + delay);
                        queue.push_back(task);
                    } else {
                        tracing::error!(symbol = %symbol, start = %task.start, "Still rate limited after requeues");
                        outcome.summary.batches_failed += 1;
                        outcome.failures.push(failure(&symbol, &task, FailureReason::RateLimited, "rate limited"));
                    }
                }
                Err(SourceError::NotFound { .. }) => {
                    tracing::warn!(symbol = %symbol, source = source.name(), "Symbol not found at source, skipping");
                    outcome.summary.not_found = true;
                    break;
                }
                Err(SourceError::Malformed(message)) => {
                    tracing::warn!(symbol = %symbol, start = %task.start, end = %task.end, error = %message, "Malformed response, dropping sub-range");
                    outcome.summary.batches_failed += 1;
                    outcome.failures.push(failure(&symbol, &task, FailureReason::Malformed, &message));
                }
            }
        }

        outcome
    }
}

fn failure(symbol: &str, task: &SubRange, reason: FailureReason, message: &str) -> SubRangeFailure {
    SubRangeFailure {
        symbol: symbol.to_string(),
        start: task.start,
        end: task.end,
        reason,
        message: message.to_string(),
    }
}

/// Keeps rows for the requested symbol and range, aligned to the cadence.
fn normalize(
    rows: Vec<Observation>,
    symbol: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    request: &BackfillRequest,
) -> Vec<Observation> {
    rows.into_iter()
        .filter(|o| o.symbol == symbol)
        .map(|o| {
            let o = o.truncate_to(request.cadence);
            if request.required_fields.is_empty() {
                o
            } else {
                o.with_required_fields(&request.required_fields)
            }
        })
        .filter(|o| o.timestamp >= start && o.timestamp <= end)
        .collect()
}
