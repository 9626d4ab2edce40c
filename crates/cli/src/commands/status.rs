//! Health status CLI command.
//!
//! Scores every tracked symbol straight from the store, or reads the live
//! view of a running daemon with `--remote`.

use super::context::{AppContext, ConfigArgs};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use mdc_collector::HealthScorer;
use mdc_core::HealthRecord;

/// Arguments for the status command.
#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Only show this table
    #[arg(long)]
    pub table: Option<String>,

    /// Base URL of a running daemon; prints its /api/status view as JSON
    #[arg(long, env = "MDC_REMOTE")]
    pub remote: Option<String>,
}

/// One printed line.
#[derive(Debug)]
struct StatusRow {
    table: String,
    symbol: String,
    record: Option<HealthRecord>,
    error: Option<String>,
}

/// Runs the status command.
///
/// # Errors
/// Returns an error if the configuration, database or daemon cannot be reached.
pub async fn run_status(args: StatusArgs, config_args: &ConfigArgs) -> Result<()> {
    if let Some(remote) = &args.remote {
        return print_remote(remote).await;
    }

    let config = config_args.load()?;
    let context = AppContext::connect(config).await?;
    let scorer = HealthScorer::new(context.store.clone());

    let mut rows = Vec::new();
    for series in &context.config.series {
        if args.table.as_ref().is_some_and(|t| t != &series.table) {
            continue;
        }
        let health_config = series.health_config();
        for symbol in &series.symbols {
            let row = match scorer.score(symbol, &series.table, &health_config).await {
                Ok(record) => StatusRow {
                    table: series.table.clone(),
                    symbol: symbol.clone(),
                    record: Some(record),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!("Failed to score {}/{}: {}", series.table, symbol, e);
                    StatusRow {
                        table: series.table.clone(),
                        symbol: symbol.clone(),
                        record: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            rows.push(row);
        }
    }

    print!(
        "{}",
        render_status(&rows, context.config.orchestrator.healthy_threshold)
    );
    Ok(())
}

async fn print_remote(base_url: &str) -> Result<()> {
    let url = format!("{}/api/status", base_url.trim_end_matches('/'));
    let body: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {url}"))?
        .error_for_status()?
        .json()
        .await
        .with_context(|| format!("Invalid response from {url}"))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn format_date(dt: Option<DateTime<Utc>>) -> String {
    dt.map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

fn render_status(rows: &[StatusRow], healthy_threshold: f64) -> String {
    let mut out = String::new();
    let rule = "=".repeat(100);

    out.push('\n');
    out.push_str(&rule);
    out.push_str("\nDATA HEALTH REPORT\n");
    out.push_str(&rule);
    out.push_str("\n\n");
    out.push_str(&format!(
        "{:<20} {:<14} {:>7} {:>7} {:>7} {:>22} {:>10}\n",
        "Table", "Symbol", "Score", "Fresh", "Compl", "Latest", "State"
    ));
    out.push_str(&"-".repeat(100));
    out.push('\n');

    let mut below = 0;
    for row in rows {
        match (&row.record, &row.error) {
            (Some(record), _) => {
                let state = if record.missing {
                    "missing"
                } else if record.score >= healthy_threshold {
                    "healthy"
                } else {
                    "degraded"
                };
                if state != "healthy" {
                    below += 1;
                }
                out.push_str(&format!(
                    "{:<20} {:<14} {:>7.1} {:>7.1} {:>7.1} {:>22} {:>10}\n",
                    row.table,
                    row.symbol,
                    record.score,
                    record.freshness_score,
                    record.completeness_score,
                    format_date(record.last_timestamp),
                    state
                ));
            }
            (None, error) => {
                below += 1;
                out.push_str(&format!(
                    "{:<20} {:<14} {:>7} {:>7} {:>7} {:>22} {:>10}  {}\n",
                    row.table,
                    row.symbol,
                    "-",
                    "-",
                    "-",
                    "N/A",
                    "error",
                    error.as_deref().unwrap_or_default()
                ));
            }
        }
    }

    out.push_str(&"-".repeat(100));
    out.push_str(&format!(
        "\n{} symbol(s), {} below the healthy threshold ({:.0})\n",
        rows.len(),
        below,
        healthy_threshold
    ));
    out
}
