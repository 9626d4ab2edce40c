//! Domain types of the collection engine.
//!
//! Everything here is in-memory: observations are the unit of persistence,
//! gaps / runs / health records are derived on demand and never stored.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Named numeric fields of one observation. `None` marks a field the
/// upstream did not populate.
pub type FieldMap = BTreeMap<String, Option<f64>>;

/// One time-stamped record for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub fields: FieldMap,
    /// Adapter or run that produced the row, e.g. `binance_futures`.
    pub source: String,
    /// Percentage (0-100) of expected fields that are non-null.
    pub completeness: f64,
}

impl Observation {
    /// Creates an observation whose completeness is measured against the
    /// fields it carries.
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
        fields: FieldMap,
    ) -> Self {
        let completeness = completeness_pct(&fields, &[]);
        Self {
            symbol: symbol.into(),
            timestamp,
            fields,
            source: source.into(),
            completeness,
        }
    }

    /// Recomputes completeness against the series' required field list.
    #[must_use]
    pub fn with_required_fields(mut self, required: &[String]) -> Self {
        self.completeness = completeness_pct(&self.fields, required);
        self
    }

    /// Truncates the timestamp to the series' native resolution.
    #[must_use]
    pub fn truncate_to(mut self, cadence: Duration) -> Self {
        if let Ok(truncated) = self.timestamp.duration_trunc(cadence) {
            self.timestamp = truncated;
        }
        self
    }

    /// Upsert key of the row.
    #[must_use]
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (&self.symbol, self.timestamp)
    }

    /// Applies a later write of the same key: populated fields overwrite,
    /// nulls never erase an existing value. Completeness is recomputed from
    /// the merged fields against `required`.
    pub fn merge_from(&mut self, newer: &Self, required: &[String]) {
        for (name, value) in &newer.fields {
            match value {
                Some(v) => {
                    self.fields.insert(name.clone(), Some(*v));
                }
                None => {
                    self.fields.entry(name.clone()).or_insert(None);
                }
            }
        }
        self.source.clone_from(&newer.source);
        self.completeness = completeness_pct(&self.fields, required);
    }

    /// Number of `required` fields that hold a value. Every field counts
    /// when `required` is empty.
    #[must_use]
    pub fn populated(&self, required: &[String]) -> usize {
        if required.is_empty() {
            self.fields.values().filter(|v| v.is_some()).count()
        } else {
            required
                .iter()
                .filter(|name| matches!(self.fields.get(*name), Some(Some(_))))
                .count()
        }
    }
}

/// Percentage of expected fields that are populated.
///
/// With an empty `required` list the denominator is the set of fields
/// present on the row.
#[must_use]
pub fn completeness_pct(fields: &FieldMap, required: &[String]) -> f64 {
    let (populated, expected) = if required.is_empty() {
        (
            fields.values().filter(|v| v.is_some()).count(),
            fields.len(),
        )
    } else {
        (
            required
                .iter()
                .filter(|name| matches!(fields.get(*name), Some(Some(_))))
                .count(),
            required.len(),
        )
    };

    if expected == 0 {
        return 0.0;
    }
    populated as f64 * 100.0 / expected as f64
}

/// Slot arithmetic works in whole seconds, so a cadence must be a positive
/// whole number of seconds.
#[must_use]
pub fn is_valid_cadence(cadence: Duration) -> bool {
    cadence >= Duration::seconds(1) && cadence.subsec_nanos() == 0
}

/// Whether a gap boundary includes the instant itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Inclusive,
    Exclusive,
}

/// How a gap was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// No rows at all in the window.
    Empty,
    /// Before the earliest persisted row.
    Leading,
    /// Between earliest and latest rows, too sparse.
    Interior,
    /// After the latest persisted row.
    Trailing,
    /// Rows exist but fall below the completeness threshold.
    LowQuality,
    /// Two or more of the above collapsed together.
    Merged,
}

/// A contiguous range of missing or low-quality data for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub start_bound: Bound,
    pub end_bound: Bound,
    pub kind: GapKind,
}

impl Gap {
    #[must_use]
    pub fn new(
        symbol: &str,
        (start, start_bound): (DateTime<Utc>, Bound),
        (end, end_bound): (DateTime<Utc>, Bound),
        kind: GapKind,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            start,
            end,
            start_bound,
            end_bound,
            kind,
        }
    }

    #[must_use]
    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    /// First and last slot to request from an upstream, both inclusive.
    ///
    /// Returns `None` when exclusive bounds leave no slot to fetch.
    #[must_use]
    pub fn fetch_range(&self, cadence: Duration) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = match self.start_bound {
            Bound::Inclusive => self.start,
            Bound::Exclusive => self.start + cadence,
        };
        let last = match self.end_bound {
            Bound::Inclusive => self.end,
            Bound::Exclusive => self.end - cadence,
        };
        (first <= last).then_some((first, last))
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = match self.start_bound {
            Bound::Inclusive => '[',
            Bound::Exclusive => '(',
        };
        let close = match self.end_bound {
            Bound::Inclusive => ']',
            Bound::Exclusive => ')',
        };
        write!(
            f,
            "{} {open}{}, {}{close}",
            self.symbol,
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%Y-%m-%d %H:%M")
        )
    }
}

/// Why a sub-range was given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// `Transient` failures outlasted the retry budget.
    RetriesExhausted,
    /// Requeued after `RateLimited` more often than allowed.
    RateLimited,
    /// Response failed schema validation.
    Malformed,
    /// Fetched rows could not be written.
    Persistence,
}

/// One sub-range that did not make it into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRangeFailure {
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reason: FailureReason,
    pub message: String,
}

/// Why a run returned before every gap was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The wall-clock budget ran out.
    Deadline,
    /// Cooperative cancellation was requested.
    Cancelled,
}

/// Per-symbol slice of a `CollectionRun`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolRunSummary {
    pub gaps_found: usize,
    pub batches_attempted: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub records_written: u64,
    /// The source reported the symbol as unsupported.
    pub not_found: bool,
    /// Symbol-level failure (gap query failed, pool exhausted).
    pub error: Option<String>,
}

impl SymbolRunSummary {
    /// True when gaps existed and nothing was collected for them.
    #[must_use]
    pub fn collection_failed(&self) -> bool {
        self.error.is_some() || (self.gaps_found > 0 && self.batches_succeeded == 0)
    }
}

/// Overall result of a run as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialSuccess,
}

/// In-memory summary of one scheduler invocation. Logged, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub symbols_requested: usize,
    pub gaps_found: usize,
    pub batches_attempted: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub records_written: u64,
    pub duration_ms: u64,
    pub failures: Vec<SubRangeFailure>,
    pub unsupported: Vec<String>,
    pub stopped_early: Option<StopReason>,
    /// Sub-ranges left for the next run.
    pub undispatched: usize,
    pub symbols: BTreeMap<String, SymbolRunSummary>,
}

impl CollectionRun {
    /// Creates an empty run for the given symbols.
    #[must_use]
    pub fn new(source: &str, symbols: &[String]) -> Self {
        Self {
            source: source.to_string(),
            started_at: Utc::now(),
            symbols_requested: symbols.len(),
            gaps_found: 0,
            batches_attempted: 0,
            batches_succeeded: 0,
            batches_failed: 0,
            records_written: 0,
            duration_ms: 0,
            failures: Vec::new(),
            unsupported: Vec::new(),
            stopped_early: None,
            undispatched: 0,
            symbols: symbols
                .iter()
                .map(|s| (s.clone(), SymbolRunSummary::default()))
                .collect(),
        }
    }

    /// Folds one symbol's result into the run totals.
    pub fn absorb(&mut self, symbol: &str, summary: SymbolRunSummary, failures: Vec<SubRangeFailure>) {
        self.gaps_found += summary.gaps_found;
        self.batches_attempted += summary.batches_attempted;
        self.batches_succeeded += summary.batches_succeeded;
        self.batches_failed += summary.batches_failed;
        self.records_written += summary.records_written;
        if summary.not_found {
            self.unsupported.push(symbol.to_string());
        }
        self.failures.extend(failures);
        self.symbols.insert(symbol.to_string(), summary);
    }

    /// True if anything was skipped, failed or deferred.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.batches_failed > 0
            || self.stopped_early.is_some()
            || self.undispatched > 0
            || !self.unsupported.is_empty()
            || self.symbols.values().any(|s| s.error.is_some())
    }

    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if self.is_partial() {
            RunOutcome::PartialSuccess
        } else {
            RunOutcome::Success
        }
    }

    /// Formats a one-line summary report.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Symbols: {}, Gaps: {}, Batches: {} ({} ok, {} failed), Records: {}, Duration: {}ms{}",
            self.symbols_requested,
            self.gaps_found,
            self.batches_attempted,
            self.batches_succeeded,
            self.batches_failed,
            self.records_written,
            self.duration_ms,
            match self.stopped_early {
                Some(StopReason::Deadline) => ", stopped at deadline",
                Some(StopReason::Cancelled) => ", cancelled",
                None => "",
            }
        )
    }
}

/// Position of a tracked symbol in the collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolState {
    Idle,
    Scheduled,
    Collecting,
    Healthy,
    Degraded,
    Failed,
    /// Terminal until an operator resets the symbol.
    Unsupported,
}

impl SymbolState {
    /// True while a run is queued or in progress.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Scheduled | Self::Collecting)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scheduled => "scheduled",
            Self::Collecting => "collecting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for SymbolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-table knobs of the health score.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub cadence: Duration,
    pub stale_threshold: Duration,
    pub freshness_weight: f64,
    pub completeness_weight: f64,
    pub recent_rows: u32,
    pub required_fields: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::hours(1),
            stale_threshold: Duration::hours(10),
            freshness_weight: 0.6,
            completeness_weight: 0.4,
            recent_rows: 24,
            required_fields: Vec::new(),
        }
    }
}

/// Derived health of one `(symbol, table)`. Recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub symbol: String,
    pub table: String,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub age_secs: Option<i64>,
    pub completeness_pct: f64,
    pub freshness_score: f64,
    pub completeness_score: f64,
    pub score: f64,
    /// No rows exist for the symbol.
    pub missing: bool,
    pub computed_at: DateTime<Utc>,
}

impl HealthRecord {
    /// Record for a symbol with no persisted rows.
    #[must_use]
    pub fn missing(symbol: &str, table: &str, computed_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            table: table.to_string(),
            last_timestamp: None,
            age_secs: None,
            completeness_pct: 0.0,
            freshness_score: 0.0,
            completeness_score: 0.0,
            score: 0.0,
            missing: true,
            computed_at,
        }
    }
}
