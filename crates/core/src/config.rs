use crate::error::ConfigError;
use crate::types::HealthConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gaps: GapConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
    #[serde(default)]
    pub series: Vec<SeriesConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_acquire_timeout_secs() -> u64 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/market_data".to_string(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

/// Backfill scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Largest time span requested from an upstream in a single fetch.
    pub max_batch_span_secs: i64,
    /// Retries after a `Transient` failure before the sub-range is given up.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Base delay applied when a sub-range is requeued after `RateLimited`.
    pub requeue_base_delay_ms: u64,
    pub max_requeues: u32,
    /// Wall-clock budget of a single run. Remaining gaps wait for the next run.
    pub max_run_duration_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Symbols processed in parallel within one run.
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_span_secs: 7 * 24 * 3600,
            max_retries: 4,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            requeue_base_delay_ms: 1_000,
            max_requeues: 5,
            max_run_duration_secs: 900,
            fetch_timeout_secs: 30,
            concurrency: 10,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn max_batch_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_batch_span_secs)
    }

    #[must_use]
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    #[must_use]
    pub const fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    #[must_use]
    pub const fn requeue_base_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_base_delay_ms)
    }

    #[must_use]
    pub const fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_duration_secs)
    }

    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Gap detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    pub max_lookback_days: i64,
    /// Share of expected rows that must be present before an interior range counts as filled.
    pub required_fill_ratio: f64,
    /// Rows below this completeness percentage are treated as missing.
    pub completeness_threshold: f64,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            max_lookback_days: 365,
            required_fill_ratio: 0.95,
            completeness_threshold: 80.0,
        }
    }
}

/// Deadlock / lock-timeout retry policy of the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_jitter_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub tick_interval_secs: u64,
    /// Post-run score at or above which a symbol is `Healthy`.
    pub healthy_threshold: f64,
    /// Symbols scoring below this on a tick are collected again.
    pub retrigger_below: f64,
    pub concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 300,
            healthy_threshold: 80.0,
            retrigger_below: 95.0,
            concurrency: 10,
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Source key, matching `SourceAdapter::name`.
    pub source: String,
    pub min_interval_ms: u64,
    #[serde(default)]
    pub max_per_window: Option<u32>,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

const fn default_window_secs() -> u64 {
    60
}

impl RateLimitConfig {
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// One observation table and the symbols tracked in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesConfig {
    pub table: String,
    pub source: String,
    pub cadence_secs: i64,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Age at which freshness reaches zero. Defaults to ten cadences.
    #[serde(default)]
    pub stale_threshold_secs: Option<i64>,
    #[serde(default = "default_freshness_weight")]
    pub freshness_weight: f64,
    #[serde(default = "default_completeness_weight")]
    pub completeness_weight: f64,
    #[serde(default = "default_recent_rows")]
    pub recent_rows: u32,
    /// Overrides `gaps.max_lookback_days` for this table.
    #[serde(default)]
    pub lookback_days: Option<i64>,
}

const fn default_freshness_weight() -> f64 {
    0.6
}

const fn default_completeness_weight() -> f64 {
    0.4
}

const fn default_recent_rows() -> u32 {
    24
}

impl SeriesConfig {
    #[must_use]
    pub fn cadence(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cadence_secs)
    }

    #[must_use]
    pub fn stale_threshold(&self) -> chrono::Duration {
        self.stale_threshold_secs
            .map_or_else(|| self.cadence() * 10, chrono::Duration::seconds)
    }

    #[must_use]
    pub fn lookback_days(&self, gaps: &GapConfig) -> i64 {
        self.lookback_days.unwrap_or(gaps.max_lookback_days)
    }

    #[must_use]
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            cadence: self.cadence(),
            stale_threshold: self.stale_threshold(),
            freshness_weight: self.freshness_weight,
            completeness_weight: self.completeness_weight,
            recent_rows: self.recent_rows,
            required_fields: self.required_fields.clone(),
        }
    }
}

/// Returns true if `name` is safe to splice into SQL as a table identifier.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl AppConfig {
    /// Rejects configurations the engine cannot run with.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_batch_span_secs <= 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_batch_span_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.concurrency == 0 || self.orchestrator.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gaps.required_fill_ratio) {
            return Err(ConfigError::Invalid(format!(
                "gaps.required_fill_ratio must be within [0, 1], got {}",
                self.gaps.required_fill_ratio
            )));
        }

        let mut seen = HashSet::new();
        for series in &self.series {
            if !is_valid_identifier(&series.table) {
                return Err(ConfigError::InvalidTable(series.table.clone()));
            }
            if series.cadence_secs <= 0 {
                return Err(ConfigError::InvalidCadence {
                    table: series.table.clone(),
                    cadence_secs: series.cadence_secs,
                });
            }
            if series.freshness_weight < 0.0 || series.completeness_weight < 0.0 {
                return Err(ConfigError::InvalidWeights {
                    table: series.table.clone(),
                });
            }
            if series.stale_threshold() < series.cadence() {
                return Err(ConfigError::Invalid(format!(
                    "{}: stale_threshold_secs must not be shorter than the cadence",
                    series.table
                )));
            }
            for symbol in &series.symbols {
                if !seen.insert((series.table.as_str(), symbol.as_str())) {
                    return Err(ConfigError::Invalid(format!(
                        "symbol {symbol} listed twice for table {}",
                        series.table
                    )));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn series_for_table(&self, table: &str) -> Option<&SeriesConfig> {
        self.series.iter().find(|s| s.table == table)
    }
}
