//! Observation repository.
//!
//! One table per series, keyed on `(symbol, timestamp)`. Table names come
//! from configuration and are validated before being spliced into SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdc_core::config::is_valid_identifier;
use mdc_core::Observation;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;

use crate::models::ObservationRecord;
use crate::store::{CoverageStats, ObservationStore, StoreError};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Postgres-backed `ObservationStore`.
#[derive(Debug, Clone)]
pub struct ObservationRepository {
    pool: PgPool,
    lock_timeout: Duration,
}

impl ObservationRepository {
    /// Creates a new repository instance.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets how long a write waits on a row lock before failing with `LockTimeout`.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

fn checked_table(table: &str) -> Result<&str, StoreError> {
    if is_valid_identifier(table) {
        Ok(table)
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

#[async_trait]
impl ObservationStore for ObservationRepository {
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        let table = checked_table(table)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                symbol TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                fields JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                source TEXT NOT NULL,
                completeness DOUBLE PRECISION NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (symbol, timestamp)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upserts the batch row by row inside one transaction, in the given order.
    ///
    /// Existing fields are merged with the non-null fields of the new row, so
    /// a later partial delivery never erases a populated value. Completeness
    /// is rescored from the merged document against `required` (`$6`).
    async fn write_sorted(
        &self,
        table: &str,
        batch: &[Observation],
        required: &[String],
    ) -> Result<u64, StoreError> {
        let table = checked_table(table)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let merged = format!(
            "(EXCLUDED.fields || {table}.fields || jsonb_strip_nulls(EXCLUDED.fields))"
        );
        let upsert = format!(
            r#"
            INSERT INTO {table} (symbol, timestamp, fields, source, completeness, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (symbol, timestamp) DO UPDATE
            SET fields = {merged},
                source = EXCLUDED.source,
                completeness = CASE
                    WHEN cardinality($6::text[]) = 0 THEN COALESCE(
                        (SELECT COUNT(*) FILTER (WHERE f.value <> 'null'::jsonb) * 100.0
                                / NULLIF(COUNT(*), 0)
                         FROM jsonb_each({merged}) f),
                        0)::double precision
                    ELSE ((SELECT COUNT(*) FROM unnest($6::text[]) r(name)
                           WHERE {merged} ->> r.name IS NOT NULL) * 100.0
                          / cardinality($6::text[]))::double precision
                END,
                updated_at = NOW()
            "#
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        let mut written = 0u64;
        for obs in batch {
            let result = sqlx::query(&upsert)
                .bind(&obs.symbol)
                .bind(obs.timestamp)
                .bind(Json(&obs.fields))
                .bind(&obs.source)
                .bind(obs.completeness)
                .bind(required)
                .execute(&mut *tx)
                .await?;

            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn coverage(
        &self,
        table: &str,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        completeness_threshold: f64,
    ) -> Result<CoverageStats, StoreError> {
        let table = checked_table(table)?;

        #[allow(clippy::type_complexity)]
        let row: (
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
            i64,
            i64,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
        ) = sqlx::query_as(&format!(
            r#"
            SELECT MIN(timestamp),
                   MAX(timestamp),
                   COUNT(*),
                   COUNT(*) FILTER (WHERE completeness < $4),
                   MIN(timestamp) FILTER (WHERE completeness < $4),
                   MAX(timestamp) FILTER (WHERE completeness < $4)
            FROM {table}
            WHERE symbol = $1 AND timestamp >= $2 AND timestamp <= $3
            "#
        ))
        .bind(symbol)
        .bind(start)
        .bind(end)
        .bind(completeness_threshold)
        .fetch_one(&self.pool)
        .await?;

        Ok(CoverageStats {
            min: row.0,
            max: row.1,
            row_count: row.2,
            low_quality_count: row.3,
            low_min: row.4,
            low_max: row.5,
        })
    }

    async fn recent(
        &self,
        table: &str,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<Observation>, StoreError> {
        let table = checked_table(table)?;

        let records = sqlx::query_as::<_, ObservationRecord>(&format!(
            r#"
            SELECT symbol, timestamp, fields, source, completeness
            FROM {table}
            WHERE symbol = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#
        ))
        .bind(symbol)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(Observation::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_table_accepts_identifiers() {
        assert_eq!(checked_table("ohlcv_1h"), Ok("ohlcv_1h"));
        assert_eq!(checked_table("onchain_metrics"), Ok("onchain_metrics"));
    }

    #[test]
    fn test_checked_table_rejects_injection() {
        assert!(matches!(
            checked_table("ohlcv; DROP TABLE ohlcv"),
            Err(StoreError::InvalidTable(_))
        ));
        assert!(matches!(
            checked_table("\"Quoted\""),
            Err(StoreError::InvalidTable(_))
        ));
    }
}
