//! Wiring shared by the commands: store, persistence, limiter, sources.

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use mdc_collector::sources::binance;
use mdc_collector::{BinanceKlineSource, Interval, ScriptedSource, SourceRateLimiter};
use mdc_core::{AppConfig, CancelSignal, ConfigLoader, SeriesConfig};
use mdc_data::{DatabaseClient, InMemoryStore, ObservationStore, PersistenceLayer};
use mdc_orchestrator::CollectionOrchestrator;
use std::sync::Arc;

/// Configuration location flags common to every command.
#[derive(clap::Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Directory holding Config.toml
    #[arg(long, global = true, default_value = mdc_core::config_loader::DEFAULT_CONFIG_DIR)]
    pub config_dir: String,

    /// Profile overlay (loads Config.<profile>.toml on top)
    #[arg(long, global = true, env = "MDC_PROFILE")]
    pub profile: Option<String>,
}

impl ConfigArgs {
    /// Loads and validates the layered configuration.
    ///
    /// # Errors
    /// Returns an error if the files cannot be parsed or fail validation.
    pub fn load(&self) -> Result<AppConfig> {
        ConfigLoader::load_from(&self.config_dir, self.profile.as_deref())
            .with_context(|| format!("Failed to load configuration from {}", self.config_dir))
    }
}

pub struct AppContext {
    pub config: AppConfig,
    pub store: Arc<dyn ObservationStore>,
    pub persistence: PersistenceLayer,
    pub limiter: Arc<SourceRateLimiter>,
    /// Sources are scripted and storage is in memory.
    pub dry_run: bool,
}

impl AppContext {
    /// Connects to Postgres and creates the configured tables.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let client = DatabaseClient::connect(&config.database).await?;
        client
            .ensure_tables(config.series.iter().map(|s| s.table.as_str()))
            .await?;
        let store: Arc<dyn ObservationStore> = Arc::new(client.observations());
        Ok(Self::with_store(config, store, false))
    }

    /// In-memory store with scripted sources; touches neither network nor database.
    #[must_use]
    pub fn dry_run(config: AppConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::new()), true)
    }

    /// Picks `dry_run` or `connect` based on the flag.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn open(config: AppConfig, dry_run: bool) -> Result<Self> {
        if dry_run {
            tracing::info!("Dry run: in-memory store, scripted sources");
            Ok(Self::dry_run(config))
        } else {
            Self::connect(config).await
        }
    }

    fn with_store(config: AppConfig, store: Arc<dyn ObservationStore>, dry_run: bool) -> Self {
        let persistence = PersistenceLayer::new(Arc::clone(&store), config.persistence.clone());
        let limiter = Arc::new(SourceRateLimiter::new(&config.rate_limits));
        Self {
            config,
            store,
            persistence,
            limiter,
            dry_run,
        }
    }

    /// Builds an orchestrator with a source bound to every configured series.
    ///
    /// # Errors
    /// Returns an error if a series names a source this binary cannot build.
    pub fn orchestrator(&self, cancel: CancelSignal) -> Result<CollectionOrchestrator> {
        let orchestrator = CollectionOrchestrator::new(
            self.config.clone(),
            self.persistence.clone(),
            Arc::clone(&self.limiter),
            cancel,
        );
        for series in &self.config.series {
            let source = self.build_source(series)?;
            orchestrator.register_table_source(&series.table, source);
        }
        Ok(orchestrator)
    }

    /// Adapter for one series. Scripted in dry runs.
    ///
    /// # Errors
    /// Returns an error for sources this binary cannot build.
    pub fn build_source(&self, series: &SeriesConfig) -> Result<Arc<dyn mdc_core::SourceAdapter>> {
        if self.dry_run {
            let fields: Vec<&str> = series.required_fields.iter().map(String::as_str).collect();
            let source = ScriptedSource::new(series.source.clone(), series.cadence());
            let source = if fields.is_empty() {
                source
            } else {
                source.with_fields(&fields)
            };
            return Ok(Arc::new(source));
        }

        match series.source.as_str() {
            binance::SOURCE_NAME => {
                let Some(interval) = Interval::from_cadence_secs(series.cadence_secs) else {
                    bail!(
                        "{}: no {} kline interval for a {}s cadence",
                        series.table,
                        binance::SOURCE_NAME,
                        series.cadence_secs
                    );
                };
                let source = BinanceKlineSource::new(interval, self.config.scheduler.fetch_timeout())?
                    .with_rate_limiter(Arc::clone(&self.limiter));
                Ok(Arc::new(source))
            }
            other => bail!("{}: unknown source {other:?}", series.table),
        }
    }
}

/// Looks up a series by table.
///
/// # Errors
/// Returns an error naming the configured tables if `table` is unknown.
pub fn series<'a>(config: &'a AppConfig, table: &str) -> Result<&'a SeriesConfig> {
    config.series_for_table(table).with_context(|| {
        let known: Vec<&str> = config.series.iter().map(|s| s.table.as_str()).collect();
        format!("Unknown table {table}. Configured: {}", known.join(", "))
    })
}

/// Parses an RFC 3339 timestamp argument.
///
/// # Errors
/// Returns an error describing the expected format.
pub fn parse_time(value: &str, what: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    value
        .parse::<chrono::DateTime<chrono::Utc>>()
        .with_context(|| format!("Invalid {what} time {value:?}. Use ISO 8601 format (e.g., 2026-01-01T00:00:00Z)"))
}

/// Default window end: now, truncated to the cadence.
#[must_use]
pub fn window_end(series: &SeriesConfig) -> chrono::DateTime<chrono::Utc> {
    use chrono::DurationRound;
    let now = chrono::Utc::now();
    now.duration_trunc(series.cadence()).unwrap_or(now)
}

/// Default window start: `lookback` before `end`.
#[must_use]
pub fn window_start(
    config: &AppConfig,
    series: &SeriesConfig,
    end: chrono::DateTime<chrono::Utc>,
) -> chrono::DateTime<chrono::Utc> {
    end - ChronoDuration::days(series.lookback_days(&config.gaps).max(1))
}
