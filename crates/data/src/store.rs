//! Storage seam shared by the persistence layer, gap detector and health scorer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdc_core::Observation;
use serde::Serialize;
use thiserror::Error;

/// SQLSTATE raised by Postgres when it breaks a deadlock.
pub const SQLSTATE_DEADLOCK: &str = "40P01";
/// SQLSTATE raised when `lock_timeout` expires.
pub const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

/// Failure of a store operation, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Deadlocks and lock timeouts are retried by the persistence layer.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Deadlock(_) | Self::LockTimeout(_))
    }

    /// Maps a Postgres SQLSTATE onto the store taxonomy.
    #[must_use]
    pub fn from_sqlstate(code: Option<&str>, message: &str) -> Self {
        match code {
            Some(SQLSTATE_DEADLOCK) => Self::Deadlock(message.to_string()),
            Some(SQLSTATE_LOCK_NOT_AVAILABLE) => Self::LockTimeout(message.to_string()),
            _ => Self::Database(message.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted,
            sqlx::Error::Database(db) => {
                Self::from_sqlstate(db.code().as_deref(), db.message())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Aggregates over `[start, end]` for one symbol, used to derive gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageStats {
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
    pub row_count: i64,
    /// Rows below the completeness threshold.
    pub low_quality_count: i64,
    pub low_min: Option<DateTime<Utc>>,
    pub low_max: Option<DateTime<Utc>>,
}

/// Table-oriented observation storage.
///
/// Implementations must apply a batch atomically and take row locks in the
/// order the batch is given.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Creates the observation table if it does not exist.
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError>;

    /// Upserts a batch already sorted by `(symbol, timestamp)` in one transaction.
    ///
    /// On conflict the stored completeness is recomputed from the merged
    /// fields against `required`. Returns the number of rows written.
    async fn write_sorted(
        &self,
        table: &str,
        batch: &[Observation],
        required: &[String],
    ) -> Result<u64, StoreError>;

    /// Coverage aggregates of `symbol` within `[start, end]`.
    async fn coverage(
        &self,
        table: &str,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        completeness_threshold: f64,
    ) -> Result<CoverageStats, StoreError>;

    /// Most recent `limit` rows of `symbol`, newest first.
    async fn recent(
        &self,
        table: &str,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<Observation>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert!(matches!(
            StoreError::from_sqlstate(Some("40P01"), "deadlock detected"),
            StoreError::Deadlock(_)
        ));
        assert!(matches!(
            StoreError::from_sqlstate(Some("55P03"), "canceling statement due to lock timeout"),
            StoreError::LockTimeout(_)
        ));
        assert!(matches!(
            StoreError::from_sqlstate(Some("23505"), "duplicate key"),
            StoreError::Database(_)
        ));
        assert!(matches!(
            StoreError::from_sqlstate(None, "io"),
            StoreError::Database(_)
        ));
    }

    #[test]
    fn test_pool_timeout_is_exhaustion() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err, StoreError::PoolExhausted);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_variants() {
        assert!(StoreError::Deadlock(String::new()).is_retryable());
        assert!(StoreError::LockTimeout(String::new()).is_retryable());
        assert!(!StoreError::Database(String::new()).is_retryable());
        assert!(!StoreError::InvalidTable("x".to_string()).is_retryable());
    }
}
