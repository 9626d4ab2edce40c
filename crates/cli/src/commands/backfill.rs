//! One-shot backfill of a table, in-process or against a running daemon.

use super::context::{self, AppContext, ConfigArgs};
use anyhow::{anyhow, Context, Result};
use clap::Args;
use mdc_core::{cancel_pair, CollectionRun};
use mdc_orchestrator::{TriggerError, TriggerRequest};
use std::process::ExitCode;

/// Exit status when a requested symbol is already being collected.
pub const EXIT_BUSY: u8 = 3;

/// Arguments for the backfill command.
#[derive(Args, Debug, Clone)]
pub struct BackfillArgs {
    /// Table to backfill (e.g., "ohlcv_1h")
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

    /// Base URL of a running daemon (e.g., "http://127.0.0.1:8080")
    #[arg(long, env = "MDC_REMOTE")]
    pub remote: Option<String>,

    /// Use scripted sources and an in-memory store
    #[arg(long, conflicts_with = "remote")]
    pub dry_run: bool,
}

/// Runs the backfill command.
///
/// Partial success exits 0. A busy symbol exits with [`EXIT_BUSY`].
///
/// # Errors
/// Returns an error for invalid arguments, unreachable dependencies or a
/// refused request other than busy.
pub async fn run_backfill(args: BackfillArgs, config_args: &ConfigArgs) -> Result<ExitCode> {
    let config = config_args.load()?;
    let request = build_request(&args, &config)?;

    tracing::info!(
        "Backfilling {} for {} symbol(s) from {} to {}",
        request.table,
        request.symbols.len(),
        request.start,
        request.end
    );

    if let Some(remote) = &args.remote {
        return run_remote(remote, &request).await;
    }

    let context = AppContext::open(config, args.dry_run).await?;
    let (cancel, signal) = cancel_pair();
    let orchestrator = context.orchestrator(signal)?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight batches");
            cancel.cancel();
        }
    });

    match orchestrator.trigger(request).await {
        Ok(run) => {
            print!("{}", render_run(&run));
            Ok(ExitCode::SUCCESS)
        }
        Err(TriggerError::Busy(symbols)) => {
            eprintln!("Already collecting: {}", symbols.join(", "));
            Ok(ExitCode::from(EXIT_BUSY))
        }
        Err(e) => Err(e.into()),
    }
}

fn build_request(args: &BackfillArgs, config: &mdc_core::AppConfig) -> Result<TriggerRequest> {
    let series = context::series(config, &args.table)?;

    let end = match &args.end {
        Some(value) => context::parse_time(value, "end")?,
        None => context::window_end(series),
    };
    let start = match &args.start {
        Some(value) => context::parse_time(value, "start")?,
        None => context::window_start(config, series, end),
    };
    let symbols = if args.symbols.is_empty() {
        series.symbols.clone()
    } else {
        args.symbols.clone()
    };

    Ok(TriggerRequest {
        table: args.table.clone(),
        symbols,
        start,
        end,
    })
}

async fn run_remote(base_url: &str, request: &TriggerRequest) -> Result<ExitCode> {
    let url = format!("{}/api/backfill", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(request)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .with_context(|| format!("Invalid response from {url}"))?;

    if status == reqwest::StatusCode::CONFLICT {
        eprintln!("Already collecting: {}", body["busy"]);
        return Ok(ExitCode::from(EXIT_BUSY));
    }
    if !status.is_success() {
        return Err(anyhow!(
            "Backfill refused ({}): {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        ));
    }

    let run: CollectionRun = serde_json::from_value(body["run"].clone())
        .context("Response is missing the run summary")?;
    print!("{}", render_run(&run));
    Ok(ExitCode::SUCCESS)
}

/// Human-readable run report.
fn render_run(run: &CollectionRun) -> String {
    let mut out = String::new();
    let rule = "=".repeat(80);

    out.push('\n');
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!("BACKFILL {:?} ({})\n", run.outcome(), run.source));
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&run.summary());
    out.push('\n');

    if !run.unsupported.is_empty() {
        out.push_str(&format!("Unsupported: {}\n", run.unsupported.join(", ")));
    }
    if run.undispatched > 0 {
        out.push_str(&format!("Left for next run: {} sub-range(s)\n", run.undispatched));
    }

    for (symbol, summary) in &run.symbols {
        if let Some(error) = &summary.error {
            out.push_str(&format!("{symbol}: {error}\n"));
        }
    }

    if !run.failures.is_empty() {
        out.push('\n');
        out.push_str(&format!("{:<12} {:<22} {:<22} {:<18} Message\n", "Symbol", "Start", "End", "Reason"));
        out.push_str(&"-".repeat(80));
        out.push('\n');
        for failure in &run.failures {
            out.push_str(&format!(
                "{:<12} {:<22} {:<22} {:<18} {}\n",
                failure.symbol,
                failure.start.format("%Y-%m-%d %H:%M:%S"),
                failure.end.format("%Y-%m-%d %H:%M:%S"),
                format!("{:?}", failure.reason),
                failure.message
            ));
        }
    }

    out
}
