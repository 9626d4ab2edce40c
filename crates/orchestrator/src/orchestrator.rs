//! Top-level collection loop.
//!
//! Every tick scores each tracked `(table, symbol)` and collects the ones
//! that are stale, incomplete or failed last time. Runs go through the
//! backfill scheduler; the post-run health score decides the symbol's next
//! resting state.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use futures_util::future::join_all;
use mdc_collector::{
    BackfillRequest, BackfillScheduler, GapDetector, HealthScorer, SourceRateLimiter,
};
use mdc_core::{
    AppConfig, CancelSignal, CollectionRun, HealthRecord, SeriesConfig, SourceAdapter,
    SymbolRunSummary, SymbolState,
};
use mdc_data::{PersistenceLayer, StoreError};
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::TriggerError;
use crate::inflight::{InFlight, InFlightPermit, SymbolKey};
use crate::status::{SymbolStatus, TickReport};

/// Manual collection request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub table: String,
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

struct Inner {
    config: SyncRwLock<AppConfig>,
    persistence: PersistenceLayer,
    limiter: Arc<SourceRateLimiter>,
    scorer: HealthScorer,
    sources: SyncRwLock<HashMap<String, Arc<dyn SourceAdapter>>>,
    /// Per-table overrides, for adapters bound to one series (e.g. a kline interval).
    table_sources: SyncRwLock<HashMap<String, Arc<dyn SourceAdapter>>>,
    statuses: RwLock<HashMap<SymbolKey, SymbolStatus>>,
    inflight: InFlight,
    workers: Semaphore,
    cancel: CancelSignal,
}

/// Owns the per-symbol lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CollectionOrchestrator {
    inner: Arc<Inner>,
}

fn tracked(config: &AppConfig, mut previous: HashMap<SymbolKey, SymbolStatus>) -> HashMap<SymbolKey, SymbolStatus> {
    let mut next = HashMap::new();
    for series in &config.series {
        for symbol in &series.symbols {
            let key = (series.table.clone(), symbol.clone());
            let mut status = previous
                .remove(&key)
                .unwrap_or_else(|| SymbolStatus::new(&series.table, symbol, &series.source));
            status.source.clone_from(&series.source);
            next.insert(key, status);
        }
    }
    next
}

/// True when a symbol should be collected on this tick.
#[must_use]
pub fn is_due(health: &HealthRecord, cadence: ChronoDuration, retrigger_below: f64) -> bool {
    health.missing
        || health.score < retrigger_below
        || health
            .age_secs
            .map_or(true, |age| age > cadence.num_seconds())
}

fn settled_state(score: f64, healthy_threshold: f64) -> SymbolState {
    if score >= healthy_threshold {
        SymbolState::Healthy
    } else {
        SymbolState::Degraded
    }
}

fn align(now: DateTime<Utc>, cadence: ChronoDuration) -> DateTime<Utc> {
    now.duration_trunc(cadence).unwrap_or(now)
}

impl CollectionOrchestrator {
    #[must_use]
    pub fn new(
        config: AppConfig,
        persistence: PersistenceLayer,
        limiter: Arc<SourceRateLimiter>,
        cancel: CancelSignal,
    ) -> Self {
        let statuses = tracked(&config, HashMap::new());
        let workers = Semaphore::new(config.orchestrator.concurrency.max(1));
        let scorer = HealthScorer::new(Arc::clone(persistence.store()));
        Self {
            inner: Arc::new(Inner {
                config: SyncRwLock::new(config),
                persistence,
                limiter,
                scorer,
                sources: SyncRwLock::new(HashMap::new()),
                table_sources: SyncRwLock::new(HashMap::new()),
                statuses: RwLock::new(statuses),
                inflight: InFlight::new(),
                workers,
                cancel,
            }),
        }
    }

    /// Registers a source under its `name()`, replacing any previous one.
    pub fn register_source(&self, source: Arc<dyn SourceAdapter>) {
        let name = source.name().to_string();
        tracing::info!(source = %name, "Source registered");
        self.inner.sources.write().insert(name, source);
    }

    /// Registers a source used only for `table`, taking precedence over
    /// the source registered under the series' source name.
    pub fn register_table_source(&self, table: &str, source: Arc<dyn SourceAdapter>) {
        tracing::info!(table, source = source.name(), "Table source registered");
        self.inner.table_sources.write().insert(table.to_string(), source);
    }

    /// Creates `table` if needed, then registers `source` for it. Used for
    /// series added by a configuration reload.
    ///
    /// # Errors
    /// Returns the store error if the table cannot be created; the source is
    /// not registered in that case.
    pub async fn bind_table_source(
        &self,
        table: &str,
        source: Arc<dyn SourceAdapter>,
    ) -> Result<(), StoreError> {
        self.inner.persistence.store().ensure_table(table).await?;
        self.register_table_source(table, source);
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> AppConfig {
        self.inner.config.read().clone()
    }

    /// Creates every configured table that does not exist yet.
    ///
    /// # Errors
    /// Returns the first store error.
    pub async fn prepare(&self) -> Result<(), StoreError> {
        let tables: Vec<String> = self.config().series.iter().map(|s| s.table.clone()).collect();
        for table in tables {
            self.inner.persistence.store().ensure_table(&table).await?;
        }
        Ok(())
    }

    /// Swaps in a reloaded configuration and updates the tracked symbol set.
    ///
    /// Worker pool size is fixed at startup.
    pub async fn apply_config(&self, config: AppConfig) {
        let added: Vec<String> = {
            let current = self.inner.config.read();
            config
                .series
                .iter()
                .filter(|s| current.series.iter().all(|c| c.table != s.table))
                .map(|s| s.table.clone())
                .collect()
        };
        for table in &added {
            if let Err(e) = self.inner.persistence.store().ensure_table(table).await {
                tracing::warn!(table = %table, error = %e, "Cannot create table for new series");
            }
        }

        let mut statuses = self.inner.statuses.write().await;
        let before = statuses.len();
        *statuses = tracked(&config, std::mem::take(&mut *statuses));
        tracing::info!(
            before,
            tracked = statuses.len(),
            series = config.series.len(),
            "Configuration applied"
        );
        drop(statuses);
        *self.inner.config.write() = config;
    }

    fn series(&self, table: &str) -> Option<SeriesConfig> {
        self.inner.config.read().series_for_table(table).cloned()
    }

    fn source_for(&self, series: &SeriesConfig) -> Option<Arc<dyn SourceAdapter>> {
        if let Some(source) = self.inner.table_sources.read().get(&series.table) {
            return Some(Arc::clone(source));
        }
        self.inner.sources.read().get(&series.source).cloned()
    }

    fn scheduler(&self) -> BackfillScheduler {
        let config = self.inner.config.read();
        BackfillScheduler::new(
            self.inner.persistence.clone(),
            GapDetector::new(Arc::clone(self.inner.persistence.store()), config.gaps.clone()),
            Arc::clone(&self.inner.limiter),
            config.scheduler.clone(),
        )
    }

    async fn update<F: FnOnce(&mut SymbolStatus)>(&self, key: &SymbolKey, f: F) {
        if let Some(status) = self.inner.statuses.write().await.get_mut(key) {
            f(status);
        }
    }

    async fn set_state(&self, key: &SymbolKey, state: SymbolState) {
        self.update(key, |s| s.transition(state)).await;
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// All tracked symbols, ordered by table then symbol.
    pub async fn statuses(&self) -> Vec<SymbolStatus> {
        let mut all: Vec<SymbolStatus> = self.inner.statuses.read().await.values().cloned().collect();
        all.sort_by(|a, b| (&a.table, &a.symbol).cmp(&(&b.table, &b.symbol)));
        all
    }

    pub async fn status(&self, table: &str, symbol: &str) -> Option<SymbolStatus> {
        self.inner
            .statuses
            .read()
            .await
            .get(&(table.to_string(), symbol.to_string()))
            .cloned()
    }

    /// Returns an `Unsupported` symbol to `Idle`. Other states are left alone.
    ///
    /// # Errors
    /// `UnknownSymbol` if the pair is not tracked.
    pub async fn reset(&self, table: &str, symbol: &str) -> Result<SymbolState, TriggerError> {
        let mut statuses = self.inner.statuses.write().await;
        let Some(status) = statuses.get_mut(&(table.to_string(), symbol.to_string())) else {
            return Err(TriggerError::UnknownSymbol {
                table: table.to_string(),
                symbol: symbol.to_string(),
            });
        };
        if status.state == SymbolState::Unsupported {
            status.transition(SymbolState::Idle);
            status.last_error = None;
            tracing::info!(table, symbol, "Unsupported symbol reset by operator");
        }
        Ok(status.state)
    }

    // ========================================================================
    // Tick
    // ========================================================================

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One pass over every tracked symbol as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let config = self.config();
        let mut report = TickReport::default();
        let mut due: Vec<(f64, SeriesConfig, String, InFlightPermit)> = Vec::new();

        for series in &config.series {
            let health_config = series.health_config();
            for symbol in &series.symbols {
                let key = (series.table.clone(), symbol.clone());
                let Some(state) = self.inner.statuses.read().await.get(&key).map(|s| s.state) else {
                    continue;
                };
                if state == SymbolState::Unsupported {
                    report.unsupported += 1;
                    continue;
                }
                if self.inner.inflight.contains(&series.table, symbol) {
                    report.busy += 1;
                    continue;
                }

                let health = match self
                    .inner
                    .scorer
                    .score_at(symbol, &series.table, &health_config, now)
                    .await
                {
                    Ok(health) => health,
                    Err(e) => {
                        tracing::warn!(table = %series.table, symbol = %symbol, error = %e, "Health check failed");
                        self.update(&key, |s| s.last_error = Some(format!("health check failed: {e}")))
                            .await;
                        continue;
                    }
                };
                report.scored += 1;

                let score = health.score;
                let collect = state == SymbolState::Failed
                    || is_due(&health, series.cadence(), config.orchestrator.retrigger_below);
                let healthy_threshold = config.orchestrator.healthy_threshold;
                self.update(&key, |s| {
                    s.health = Some(health);
                    if !collect {
                        s.transition(settled_state(score, healthy_threshold));
                    }
                })
                .await;

                if !collect {
                    continue;
                }
                match self.inner.inflight.try_acquire(&series.table, symbol) {
                    Some(permit) => due.push((score, series.clone(), symbol.clone(), permit)),
                    None => report.busy += 1,
                }
            }
        }

        // Lowest score first so the worker pool serves the worst symbols first.
        due.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, series, symbol, _) in &due {
            self.set_state(&(series.table.clone(), symbol.clone()), SymbolState::Scheduled)
                .await;
        }
        report.triggered = due.len();

        let outcomes = join_all(
            due.into_iter()
                .map(|(_, series, symbol, permit)| self.collect_symbol(series, symbol, permit, now)),
        )
        .await;

        for state in outcomes {
            match state {
                SymbolState::Failed => report.failed += 1,
                SymbolState::Unsupported => report.unsupported += 1,
                _ => {}
            }
        }

        tracing::info!(
            scored = report.scored,
            triggered = report.triggered,
            busy = report.busy,
            failed = report.failed,
            unsupported = report.unsupported,
            "Tick complete"
        );
        report
    }

    async fn collect_symbol(
        &self,
        series: SeriesConfig,
        symbol: String,
        permit: InFlightPermit,
        now: DateTime<Utc>,
    ) -> SymbolState {
        let _permit = permit;
        let key = (series.table.clone(), symbol.clone());

        let Some(source) = self.source_for(&series) else {
            let message = format!("no source registered under {}", series.source);
            tracing::error!(table = %series.table, symbol = %symbol, "{}", message);
            self.update(&key, |s| {
                s.transition(SymbolState::Failed);
                s.last_error = Some(message);
            })
            .await;
            return SymbolState::Failed;
        };

        let Ok(_worker) = self.inner.workers.acquire().await else {
            return SymbolState::Failed;
        };
        self.set_state(&key, SymbolState::Collecting).await;

        let cadence = series.cadence();
        let lookback_days = series.lookback_days(&self.inner.config.read().gaps).max(1);
        let end = align(now, cadence);
        let request = BackfillRequest {
            table: series.table.clone(),
            symbols: vec![symbol.clone()],
            cadence,
            desired_start: end - ChronoDuration::days(lookback_days),
            desired_end: end,
            lookback_days,
            required_fields: series.required_fields.clone(),
        };

        match self.scheduler().run(&request, source, &self.inner.cancel).await {
            Ok(run) => {
                let summary = run.symbols.get(&symbol).cloned().unwrap_or_default();
                self.finish_symbol(&series, &symbol, summary, now).await
            }
            Err(e) => {
                tracing::error!(table = %series.table, symbol = %symbol, error = %e, "Collection rejected");
                let message = e.to_string();
                self.update(&key, |s| {
                    s.transition(SymbolState::Failed);
                    s.last_error = Some(message);
                })
                .await;
                SymbolState::Failed
            }
        }
    }

    /// Moves a symbol out of `Collecting` based on its run summary and fresh health.
    async fn finish_symbol(
        &self,
        series: &SeriesConfig,
        symbol: &str,
        summary: SymbolRunSummary,
        now: DateTime<Utc>,
    ) -> SymbolState {
        let key = (series.table.clone(), symbol.to_string());
        let healthy_threshold = self.inner.config.read().orchestrator.healthy_threshold;

        let mut health = None;
        let mut error = summary.error.clone();
        let state = if summary.not_found {
            tracing::warn!(table = %series.table, symbol, source = %series.source, "Symbol unsupported by source, parked until reset");
            error = Some(format!("{symbol} not found at {}", series.source));
            SymbolState::Unsupported
        } else if summary.collection_failed() {
            tracing::error!(table = %series.table, symbol, gaps = summary.gaps_found, "Collection failed, retrying next tick");
            error.get_or_insert_with(|| "no batches succeeded".to_string());
            SymbolState::Failed
        } else {
            match self
                .inner
                .scorer
                .score_at(symbol, &series.table, &series.health_config(), now)
                .await
            {
                Ok(record) => {
                    let state = settled_state(record.score, healthy_threshold);
                    tracing::info!(
                        table = %series.table,
                        symbol,
                        score = record.score,
                        records = summary.records_written,
                        state = %state,
                        "Collection finished"
                    );
                    health = Some(record);
                    state
                }
                Err(e) => {
                    tracing::warn!(table = %series.table, symbol, error = %e, "Post-run health check failed");
                    error = Some(format!("health check failed: {e}"));
                    SymbolState::Degraded
                }
            }
        };

        self.update(&key, |s| {
            s.transition(state);
            if health.is_some() {
                s.health = health;
            }
            s.last_run = Some(summary);
            s.last_run_at = Some(Utc::now());
            s.last_error = error;
        })
        .await;
        state
    }

    // ========================================================================
    // Manual trigger
    // ========================================================================

    /// Collects `request.symbols` over `[start, end]` right away.
    ///
    /// Partial failures come back inside the run.
    ///
    /// # Errors
    /// `Busy` if any requested symbol already has a run in flight; the
    /// request is validated against the tracked configuration first.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<CollectionRun, TriggerError> {
        if request.symbols.is_empty() {
            return Err(TriggerError::NoSymbols);
        }
        // `start == end` is a single-slot collection.
        if request.start > request.end {
            return Err(TriggerError::InvalidRange {
                start: request.start,
                end: request.end,
            });
        }
        let series = self
            .series(&request.table)
            .ok_or_else(|| TriggerError::UnknownTable(request.table.clone()))?;
        if let Some(symbol) = request.symbols.iter().find(|s| !series.symbols.contains(*s)) {
            return Err(TriggerError::UnknownSymbol {
                table: request.table.clone(),
                symbol: symbol.clone(),
            });
        }
        let source = self
            .source_for(&series)
            .ok_or_else(|| TriggerError::UnknownSource(series.source.clone()))?;

        let permits = self
            .inner
            .inflight
            .try_acquire_all(&series.table, &request.symbols)
            .map_err(TriggerError::Busy)?;
        let symbols: Vec<String> = permits.iter().map(|p| p.symbol().to_string()).collect();

        tracing::info!(
            table = %series.table,
            symbols = ?symbols,
            start = %request.start,
            end = %request.end,
            "Manual collection triggered"
        );

        for symbol in &symbols {
            self.set_state(&(series.table.clone(), symbol.clone()), SymbolState::Collecting)
                .await;
        }

        let backfill = BackfillRequest {
            table: series.table.clone(),
            symbols: symbols.clone(),
            cadence: series.cadence(),
            desired_start: request.start,
            desired_end: request.end,
            lookback_days: series.lookback_days(&self.inner.config.read().gaps),
            required_fields: series.required_fields.clone(),
        };

        let run = match self.scheduler().run(&backfill, source, &self.inner.cancel).await {
            Ok(run) => run,
            Err(e) => {
                let message = e.to_string();
                for symbol in &symbols {
                    let message = message.clone();
                    self.update(&(series.table.clone(), symbol.clone()), |s| {
                        s.transition(SymbolState::Failed);
                        s.last_error = Some(message);
                    })
                    .await;
                }
                return Err(e.into());
            }
        };

        let now = Utc::now();
        for symbol in &symbols {
            let summary = run.symbols.get(symbol).cloned().unwrap_or_default();
            self.finish_symbol(&series, symbol, summary, now).await;
        }
        drop(permits);

        Ok(run)
    }

    // ========================================================================
    // Loop
    // ========================================================================

    /// Ticks until cancelled, applying configuration updates as they arrive.
    pub async fn run(&self, mut config_rx: watch::Receiver<AppConfig>) {
        let mut period = self.tick_period();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watching = true;

        let tracked = self.inner.statuses.read().await.len();
        tracing::info!(
            tick_secs = period.as_secs(),
            tracked = tracked,
            "Collection orchestrator started"
        );

        loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = config_rx.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let config = config_rx.borrow_and_update().clone();
                    self.apply_config(config).await;

                    let next = self.tick_period();
                    if next != period {
                        tracing::info!(tick_secs = next.as_secs(), "Tick interval changed");
                        period = next;
                        ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
            }
        }

        tracing::info!("Collection orchestrator stopped");
    }

    fn tick_period(&self) -> Duration {
        self.inner
            .config
            .read()
            .orchestrator
            .tick_interval()
            .max(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn health(age_secs: Option<i64>, score: f64) -> HealthRecord {
        HealthRecord {
            symbol: "BTC".to_string(),
            table: "ohlcv_1h".to_string(),
            last_timestamp: None,
            age_secs,
            completeness_pct: 100.0,
            freshness_score: 100.0,
            completeness_score: 100.0,
            score,
            missing: age_secs.is_none(),
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_symbol_is_due() {
        assert!(is_due(&health(None, 0.0), ChronoDuration::hours(1), 95.0));
    }

    #[test]
    fn test_fresh_healthy_symbol_is_not_due() {
        assert!(!is_due(&health(Some(600), 100.0), ChronoDuration::hours(1), 95.0));
    }

    #[test]
    fn test_age_beyond_cadence_is_due() {
        assert!(is_due(&health(Some(3_601), 100.0), ChronoDuration::hours(1), 95.0));
    }

    #[test]
    fn test_low_score_is_due() {
        assert!(is_due(&health(Some(60), 90.0), ChronoDuration::hours(1), 95.0));
    }

    #[test]
    fn test_settled_state_threshold_is_inclusive() {
        assert_eq!(settled_state(80.0, 80.0), SymbolState::Healthy);
        assert_eq!(settled_state(79.9, 80.0), SymbolState::Degraded);
    }

    #[test]
    fn test_align_truncates_to_cadence() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 34, 56).unwrap();
        assert_eq!(
            align(now, ChronoDuration::hours(1)),
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
        );
    }
}
