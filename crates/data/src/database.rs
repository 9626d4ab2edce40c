use anyhow::{Context, Result};
use mdc_core::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::repositories::ObservationRepository;
use crate::store::ObservationStore;

/// Owner of the bounded connection pool.
pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    /// Creates a new database client connected to the configured `PostgreSQL` database.
    ///
    /// # Errors
    /// Returns an error if the database connection cannot be established.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .context("Failed to connect to database")?;

        tracing::info!(
            max_connections = config.max_connections,
            "Database pool ready"
        );

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[must_use]
    pub fn observations(&self) -> ObservationRepository {
        ObservationRepository::new(self.pool.clone())
    }

    /// Creates every configured observation table that does not exist yet.
    ///
    /// # Errors
    /// Returns an error if a table name is invalid or the DDL fails.
    pub async fn ensure_tables<'a>(&self, tables: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let repo = self.observations();
        for table in tables {
            repo.ensure_table(table)
                .await
                .with_context(|| format!("Failed to create table {table}"))?;
        }
        Ok(())
    }
}
