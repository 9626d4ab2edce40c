//! Missing-range detection.
//!
//! Gaps are derived from four aggregates over the desired window (earliest
//! and latest row, row count, low-quality rows), so the check costs one
//! query per symbol regardless of how long the window is.

use chrono::{DateTime, Duration, Utc};
use mdc_core::{is_valid_cadence, Bound, Gap, GapConfig, GapKind};
use mdc_data::{CoverageStats, ObservationStore, StoreError};
use std::sync::Arc;

/// Parameters of one gap search.
#[derive(Debug, Clone, PartialEq)]
pub struct GapQuery<'a> {
    pub table: &'a str,
    pub symbol: &'a str,
    pub desired_start: DateTime<Utc>,
    pub desired_end: DateTime<Utc>,
    pub cadence: Duration,
    /// Gaps older than `desired_end - lookback_days` are ignored. Zero or
    /// negative disables the cap.
    pub lookback_days: i64,
}

impl GapQuery<'_> {
    /// Window actually searched, after the lookback cap.
    #[must_use]
    pub fn effective_start(&self) -> DateTime<Utc> {
        if self.lookback_days <= 0 {
            return self.desired_start;
        }
        let earliest = self.desired_end - Duration::days(self.lookback_days);
        self.desired_start.max(earliest)
    }
}

/// Read-only gap finder over the observation store.
#[derive(Clone)]
pub struct GapDetector {
    store: Arc<dyn ObservationStore>,
    config: GapConfig,
}

impl GapDetector {
    #[must_use]
    pub fn new(store: Arc<dyn ObservationStore>, config: GapConfig) -> Self {
        Self { store, config }
    }

    /// Ordered, merged gaps of `query.symbol` within the desired window.
    ///
    /// # Errors
    /// Returns the store error if the coverage query fails.
    pub async fn find_gaps(&self, query: &GapQuery<'_>) -> Result<Vec<Gap>, StoreError> {
        if query.desired_start > query.desired_end || !is_valid_cadence(query.cadence) {
            return Ok(Vec::new());
        }

        let start = query.effective_start();
        if start > query.desired_end {
            return Ok(Vec::new());
        }

        let stats = self
            .store
            .coverage(
                query.table,
                query.symbol,
                start,
                query.desired_end,
                self.config.completeness_threshold,
            )
            .await?;

        let gaps = compute_gaps(
            query.symbol,
            start,
            query.desired_end,
            query.cadence,
            &stats,
            self.config.required_fill_ratio,
        );

        tracing::debug!(
            table = query.table,
            symbol = query.symbol,
            rows = stats.row_count,
            gaps = gaps.len(),
            "Gap check complete"
        );

        Ok(gaps)
    }
}

/// Derives gaps from coverage aggregates. Pure.
#[must_use]
pub fn compute_gaps(
    symbol: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cadence: Duration,
    stats: &CoverageStats,
    fill_ratio: f64,
) -> Vec<Gap> {
    if start > end || !is_valid_cadence(cadence) {
        return Vec::new();
    }

    let (Some(min), Some(max)) = (stats.min, stats.max) else {
        return vec![Gap::new(
            symbol,
            (start, Bound::Inclusive),
            (end, Bound::Inclusive),
            GapKind::Empty,
        )];
    };

    let mut gaps = Vec::new();

    if min > start {
        gaps.push(Gap::new(
            symbol,
            (start, Bound::Inclusive),
            (min, Bound::Exclusive),
            GapKind::Leading,
        ));
    }

    let expected = (max - min).num_seconds() / cadence.num_seconds() + 1;
    if (stats.row_count as f64) < expected as f64 * fill_ratio {
        gaps.push(Gap::new(
            symbol,
            (min, Bound::Exclusive),
            (max, Bound::Exclusive),
            GapKind::Interior,
        ));
    }

    if max < end {
        gaps.push(Gap::new(
            symbol,
            (max, Bound::Exclusive),
            (end, Bound::Inclusive),
            GapKind::Trailing,
        ));
    }

    if stats.low_quality_count > 0 {
        if let (Some(low_min), Some(low_max)) = (stats.low_min, stats.low_max) {
            gaps.push(Gap::new(
                symbol,
                (low_min, Bound::Inclusive),
                (low_max, Bound::Inclusive),
                GapKind::LowQuality,
            ));
        }
    }

    merge_gaps(gaps, cadence)
}

/// First and last slot a gap covers. Only meaningful for non-empty gaps.
fn slots(gap: &Gap, cadence: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
    let first = match gap.start_bound {
        Bound::Inclusive => gap.start,
        Bound::Exclusive => gap.start + cadence,
    };
    let last = match gap.end_bound {
        Bound::Inclusive => gap.end,
        Bound::Exclusive => gap.end - cadence,
    };
    (first, last)
}

/// Sorts gaps and collapses those that are close together.
///
/// `next` joins `prev` when fewer than one cadence of present data separates
/// them, or when exactly one present slot separates them and `next` itself
/// spans no more than one cadence. Gaps with no slot to fetch are dropped.
#[must_use]
pub fn merge_gaps(mut gaps: Vec<Gap>, cadence: Duration) -> Vec<Gap> {
    gaps.retain(|g| g.fetch_range(cadence).is_some());
    gaps.sort_by_key(|g| slots(g, cadence).0);

    let mut merged: Vec<Gap> = Vec::with_capacity(gaps.len());
    for gap in gaps {
        if let Some(prev) = merged.last_mut() {
            let (_, prev_last) = slots(prev, cadence);
            let (next_first, next_last) = slots(&gap, cadence);
            let separation = next_first - prev_last - cadence;

            let joins = separation < cadence
                || (separation <= cadence && gap.span() <= cadence);
            if joins {
                if next_last > prev_last {
                    prev.end = gap.end;
                    prev.end_bound = gap.end_bound;
                }
                prev.kind = GapKind::Merged;
                continue;
            }
        }
        merged.push(gap);
    }

    merged
}
