//! Collector daemon: scheduled ticks, config hot reload and the web API.

use super::context::{AppContext, ConfigArgs};
use anyhow::{Context, Result};
use clap::Args;
use mdc_core::{cancel_pair, AppConfig, ConfigWatcher};
use mdc_orchestrator::CollectionOrchestrator;
use mdc_web_api::ApiServer;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Arguments for the run command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Address for the web API (defaults to server.host:server.port)
    #[arg(long)]
    pub addr: Option<String>,

    /// Use scripted sources and an in-memory store
    #[arg(long)]
    pub dry_run: bool,
}

/// Runs the daemon until SIGINT or SIGTERM.
///
/// # Errors
/// Returns an error if configuration, database or source setup fails.
pub async fn run_daemon(args: RunArgs, config_args: &ConfigArgs) -> Result<()> {
    let config = config_args.load()?;
    let context = Arc::new(AppContext::open(config.clone(), args.dry_run).await?);

    let (cancel, signal) = cancel_pair();
    let orchestrator = context.orchestrator(signal.clone())?;
    orchestrator
        .prepare()
        .await
        .context("Failed to prepare series tables")?;

    let (watcher, config_rx) = ConfigWatcher::new(
        config.clone(),
        &config_args.config_dir,
        config_args.profile.clone(),
    );
    let watcher_task = tokio::spawn(async move {
        if let Err(e) = watcher.watch().await {
            error!("Config watcher stopped: {}", e);
        }
    });

    let binder_task = tokio::spawn(bind_new_series(
        Arc::clone(&context),
        orchestrator.clone(),
        config_rx.clone(),
    ));

    let addr = args.addr.unwrap_or_else(|| config.server.addr());
    let server = ApiServer::new(orchestrator.clone());
    let server_signal = signal.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.serve(&addr, server_signal).await {
            error!("Web API stopped: {}", e);
        }
    });

    let orchestrator_task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(config_rx).await })
    };

    info!(
        "Collector running: {} series, tick every {}s",
        config.series.len(),
        config.orchestrator.tick_interval_secs
    );

    shutdown_signal().await?;
    info!("Shutting down, waiting for in-flight batches");
    cancel.cancel();

    if let Err(e) = orchestrator_task.await {
        warn!("Orchestrator task ended abnormally: {}", e);
    }
    if let Err(e) = server_task.await {
        warn!("Web API task ended abnormally: {}", e);
    }
    binder_task.abort();
    watcher_task.abort();

    info!("Collector stopped");
    Ok(())
}

/// Binds an adapter to every series a reload adds.
async fn bind_new_series(
    context: Arc<AppContext>,
    orchestrator: CollectionOrchestrator,
    mut config_rx: watch::Receiver<AppConfig>,
) {
    let mut bound: Vec<String> = context.config.series.iter().map(|s| s.table.clone()).collect();

    while config_rx.changed().await.is_ok() {
        let config = config_rx.borrow_and_update().clone();
        for series in &config.series {
            if bound.contains(&series.table) {
                continue;
            }
            let source = match context.build_source(series) {
                Ok(source) => source,
                Err(e) => {
                    warn!(table = %series.table, "Cannot bind source: {:#}", e);
                    continue;
                }
            };
            match orchestrator.bind_table_source(&series.table, source).await {
                Ok(()) => {
                    info!(table = %series.table, source = %series.source, "Bound source for new series");
                    bound.push(series.table.clone());
                }
                Err(e) => warn!(table = %series.table, error = %e, "Cannot create table for new series"),
            }
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received SIGINT");
        }
    }
    Ok(())
}
