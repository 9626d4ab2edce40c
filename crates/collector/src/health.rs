//! Health scoring for a `(symbol, table)`.
//!
//! Score = weighted mean of freshness (age of the newest row) and
//! completeness (required fields populated over the most recent rows).

use chrono::{DateTime, Duration, Utc};
use mdc_core::{HealthConfig, HealthRecord, Observation};
use mdc_data::{ObservationStore, StoreError};
use std::sync::Arc;

/// Default freshness / completeness weights, used when configured weights sum to zero.
pub const DEFAULT_WEIGHTS: (f64, f64) = (0.6, 0.4);

/// Reads recent rows and scores them.
#[derive(Clone)]
pub struct HealthScorer {
    store: Arc<dyn ObservationStore>,
}

impl HealthScorer {
    #[must_use]
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self { store }
    }

    /// Scores `symbol` in `table` as of now.
    ///
    /// # Errors
    /// Returns the store error if recent rows cannot be read.
    pub async fn score(
        &self,
        symbol: &str,
        table: &str,
        config: &HealthConfig,
    ) -> Result<HealthRecord, StoreError> {
        self.score_at(symbol, table, config, Utc::now()).await
    }

    /// Scores `symbol` in `table` as of `now`.
    ///
    /// # Errors
    /// Returns the store error if recent rows cannot be read.
    pub async fn score_at(
        &self,
        symbol: &str,
        table: &str,
        config: &HealthConfig,
        now: DateTime<Utc>,
    ) -> Result<HealthRecord, StoreError> {
        let rows = self
            .store
            .recent(table, symbol, config.recent_rows.max(1))
            .await?;
        Ok(score_rows(symbol, table, &rows, config, now))
    }
}

/// Freshness in `[0, 100]`: full up to one cadence, then linear to zero at `stale`.
#[must_use]
pub fn freshness_score(age: Duration, cadence: Duration, stale: Duration) -> f64 {
    if age <= cadence {
        return 100.0;
    }
    if age >= stale || stale <= cadence {
        return 0.0;
    }
    let remaining = (stale - age).num_milliseconds() as f64;
    let window = (stale - cadence).num_milliseconds() as f64;
    100.0 * remaining / window
}

/// Share of required fields populated across `rows`, in `[0, 100]`.
///
/// Without a required field list the rows' own completeness is averaged.
#[must_use]
pub fn completeness_score(rows: &[Observation], required: &[String]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    if required.is_empty() {
        return rows.iter().map(|r| r.completeness).sum::<f64>() / rows.len() as f64;
    }
    let populated: usize = rows.iter().map(|r| r.populated(required)).sum();
    populated as f64 * 100.0 / (rows.len() * required.len()) as f64
}

fn normalized_weights(config: &HealthConfig) -> (f64, f64) {
    let freshness = config.freshness_weight.max(0.0);
    let completeness = config.completeness_weight.max(0.0);
    let total = freshness + completeness;
    if total <= 0.0 {
        return DEFAULT_WEIGHTS;
    }
    (freshness / total, completeness / total)
}

/// Scores rows ordered newest first. Pure.
#[must_use]
pub fn score_rows(
    symbol: &str,
    table: &str,
    rows: &[Observation],
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> HealthRecord {
    let Some(latest) = rows.iter().map(|r| r.timestamp).max() else {
        return HealthRecord::missing(symbol, table, now);
    };

    let age = (now - latest).max(Duration::zero());
    let freshness = freshness_score(age, config.cadence, config.stale_threshold);
    let completeness = completeness_score(rows, &config.required_fields);
    let (wf, wc) = normalized_weights(config);
    let score = (wf * freshness + wc * completeness).clamp(0.0, 100.0);

    HealthRecord {
        symbol: symbol.to_string(),
        table: table.to_string(),
        last_timestamp: Some(latest),
        age_secs: Some(age.num_seconds()),
        completeness_pct: completeness,
        freshness_score: freshness,
        completeness_score: completeness,
        score,
        missing: false,
        computed_at: now,
    }
}
