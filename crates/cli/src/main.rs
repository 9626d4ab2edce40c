use clap::{Parser, Subcommand};
use std::process::ExitCode;

mod commands;

use commands::{BackfillArgs, ConfigArgs, GapsArgs, RunArgs, StatusArgs};

#[derive(Parser)]
#[command(name = "mdc")]
#[command(
    about = "Market data collector: gap detection, rate-limited backfill and health scoring",
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector daemon with web API
    Run(RunArgs),
    /// Backfill a table once and print the run summary
    Backfill(BackfillArgs),
    /// Show health scores of tracked symbols
    Status(StatusArgs),
    /// List missing ranges without fetching them
    Gaps(GapsArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Reports go to stdout, logs to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => commands::run_daemon(args, &cli.config).await?,
        Commands::Backfill(args) => return commands::run_backfill(args, &cli.config).await,
        Commands::Status(args) => commands::run_status(args, &cli.config).await?,
        Commands::Gaps(args) => commands::run_gaps(args, &cli.config).await?,
    }

    Ok(ExitCode::SUCCESS)
}
