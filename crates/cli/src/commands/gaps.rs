//! Gap report: what a backfill would fetch, without fetching it.

use super::context::{self, AppContext, ConfigArgs};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Args;
use mdc_collector::{GapDetector, GapQuery};
use mdc_core::{is_valid_cadence, AppConfig, Gap, SeriesConfig};
use mdc_data::{ObservationStore, StoreError};
use std::sync::Arc;

/// Arguments for the gaps command.
#[derive(Args, Debug, Clone)]
pub struct GapsArgs {
    /// Table to inspect
    #[arg(long)]
    pub table: String,

    /// Comma-separated symbols. Defaults to every symbol tracked in the table.
    #[arg(long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Start time (ISO 8601). Defaults to the table's lookback before --end.
    #[arg(long)]
    pub start: Option<String>,

    /// End time (ISO 8601). Defaults to now, truncated to the cadence.
    #[arg(long)]
    pub end: Option<String>,
}

/// Runs the gaps command.
///
/// # Errors
/// Returns an error for invalid arguments or an unreachable database.
pub async fn run_gaps(args: GapsArgs, config_args: &ConfigArgs) -> Result<()> {
    let config = config_args.load()?;
    let series = context::series(&config, &args.table)?.clone();

    let end = match &args.end {
        Some(value) => context::parse_time(value, "end")?,
        None => context::window_end(&series),
    };
    let start = match &args.start {
        Some(value) => context::parse_time(value, "start")?,
        None => context::window_start(&config, &series, end),
    };
    let symbols = if args.symbols.is_empty() {
        series.symbols.clone()
    } else {
        args.symbols.clone()
    };

    let context = AppContext::connect(config).await?;
    let report = detect(context.store.clone(), &context.config, &series, &symbols, start, end).await;

    println!();
    println!("{}", "=".repeat(80));
    println!("GAPS in {} from {} to {}", series.table, start, end);
    println!("{}", "=".repeat(80));

    let cadence = series.cadence();
    let mut total_slots = 0;
    for (symbol, gaps) in &report {
        match gaps {
            Ok(gaps) if gaps.is_empty() => println!("{symbol}: complete"),
            Ok(gaps) => {
                let slots = missing_slots(gaps, cadence);
                total_slots += slots;
                println!("{symbol}: {} gap(s), {} slot(s)", gaps.len(), slots);
                for gap in gaps {
                    println!("  {:<10} {}", format!("{:?}", gap.kind), gap);
                }
            }
            Err(e) => println!("{symbol}: error: {e}"),
        }
    }
    println!("{}", "-".repeat(80));
    println!("{} slot(s) to fetch across {} symbol(s)", total_slots, report.len());

    Ok(())
}

/// Gaps per symbol, in request order. Per-symbol query errors are kept.
async fn detect(
    store: Arc<dyn ObservationStore>,
    config: &AppConfig,
    series: &SeriesConfig,
    symbols: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(String, Result<Vec<Gap>, StoreError>)> {
    let detector = GapDetector::new(store, config.gaps.clone());
    let mut report = Vec::with_capacity(symbols.len());

    for symbol in symbols {
        let query = GapQuery {
            table: &series.table,
            symbol,
            desired_start: start,
            desired_end: end,
            cadence: series.cadence(),
            lookback_days: series.lookback_days(&config.gaps),
        };
        report.push((symbol.clone(), detector.find_gaps(&query).await));
    }

    report
}

/// Number of cadence slots the gaps would fetch.
fn missing_slots(gaps: &[Gap], cadence: ChronoDuration) -> i64 {
    if !is_valid_cadence(cadence) {
        return 0;
    }
    gaps.iter()
        .filter_map(|gap| gap.fetch_range(cadence))
        .map(|(first, last)| (last - first).num_seconds() / cadence.num_seconds() + 1)
        .sum()
}
