//! In-process `ObservationStore`.
//!
//! Mirrors the row-locking behaviour of the Postgres repository: a write
//! takes one lock per row in batch order and holds all of them until the
//! batch commits. Two writers that lock overlapping rows in opposite orders
//! can therefore deadlock here just as they would in Postgres; a lock wait
//! longer than `lock_timeout` fails with `StoreError::LockTimeout`.
//!
//! Tables spring into existence on first use unless the store is built
//! `with_strict_tables`, in which case only `ensure_table` (or `seed`)
//! creates them, as in Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdc_core::Observation;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use crate::store::{CoverageStats, ObservationStore, StoreError};

type RowKey = (String, DateTime<Utc>);

#[derive(Default)]
struct Table {
    rows: BTreeMap<RowKey, Observation>,
    locks: HashMap<RowKey, Arc<RowLock<()>>>,
}

/// Thread-safe in-memory observation store.
pub struct InMemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    lock_timeout: Option<Duration>,
    write_delay: Option<Duration>,
    strict_tables: bool,
    injected_write_errors: Mutex<VecDeque<StoreError>>,
    injected_read_errors: Mutex<VecDeque<StoreError>>,
    commits: Mutex<Vec<Vec<RowKey>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            lock_timeout: None,
            write_delay: None,
            strict_tables: false,
            injected_write_errors: Mutex::new(VecDeque::new()),
            injected_read_errors: Mutex::new(VecDeque::new()),
            commits: Mutex::new(Vec::new()),
        }
    }

    /// Fails row lock waits longer than `timeout`.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Sleeps between acquiring each row lock, widening the window in which
    /// concurrent writers interleave.
    #[must_use]
    pub const fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Fails reads and writes against tables `ensure_table` never created.
    #[must_use]
    pub const fn with_strict_tables(mut self) -> Self {
        self.strict_tables = true;
        self
    }

    #[must_use]
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.lock().contains_key(table)
    }

    /// Makes the next writes fail with the given errors, one per call.
    pub fn fail_next_writes(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.injected_write_errors.lock().extend(errors);
    }

    /// Makes the next coverage / recent queries fail, one per call.
    pub fn fail_next_reads(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.injected_read_errors.lock().extend(errors);
    }

    /// Inserts rows directly, bypassing locks and merge rules.
    pub fn seed(&self, table: &str, observations: impl IntoIterator<Item = Observation>) {
        let mut tables = self.tables.lock();
        let rows = &mut tables.entry(table.to_string()).or_default().rows;
        for obs in observations {
            rows.insert((obs.symbol.clone(), obs.timestamp), obs);
        }
    }

    /// Committed row, if any.
    #[must_use]
    pub fn get(&self, table: &str, symbol: &str, timestamp: DateTime<Utc>) -> Option<Observation> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.rows.get(&(symbol.to_string(), timestamp)).cloned())
    }

    /// All committed rows of `symbol`, oldest first.
    #[must_use]
    pub fn rows(&self, table: &str, symbol: &str) -> Vec<Observation> {
        self.tables.lock().get(table).map_or_else(Vec::new, |t| {
            t.rows
                .values()
                .filter(|o| o.symbol == symbol)
                .cloned()
                .collect()
        })
    }

    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, |t| t.rows.len())
    }

    /// Key order of every committed batch, in commit order.
    #[must_use]
    pub fn commit_log(&self) -> Vec<Vec<(String, DateTime<Utc>)>> {
        self.commits.lock().clone()
    }

    fn row_lock(&self, table: &str, key: &RowKey) -> Arc<RowLock<()>> {
        let mut tables = self.tables.lock();
        let table = tables.entry(table.to_string()).or_default();
        Arc::clone(table.locks.entry(key.clone()).or_default())
    }

    async fn lock_row(&self, lock: Arc<RowLock<()>>) -> Result<OwnedMutexGuard<()>, StoreError> {
        match self.lock_timeout {
            Some(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout("row lock wait exceeded".to_string())),
            None => Ok(lock.lock_owned().await),
        }
    }

    fn check_table(&self, table: &str) -> Result<(), StoreError> {
        if self.strict_tables && !self.has_table(table) {
            return Err(StoreError::Database(format!(
                "relation \"{table}\" does not exist"
            )));
        }
        Ok(())
    }

    fn take_read_error(&self) -> Result<(), StoreError> {
        self.injected_read_errors.lock().pop_front().map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ObservationStore for InMemoryStore {
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        self.tables.lock().entry(table.to_string()).or_default();
        Ok(())
    }

    async fn write_sorted(
        &self,
        table: &str,
        batch: &[Observation],
        required: &[String],
    ) -> Result<u64, StoreError> {
        if let Some(err) = self.injected_write_errors.lock().pop_front() {
            return Err(err);
        }
        if batch.is_empty() {
            return Ok(0);
        }
        self.check_table(table)?;

        // Guards are held until the end of this function, like a transaction.
        let mut held: Vec<(RowKey, OwnedMutexGuard<()>)> = Vec::with_capacity(batch.len());
        for obs in batch {
            let key = (obs.symbol.clone(), obs.timestamp);
            if held.iter().any(|(k, _)| *k == key) {
                continue;
            }
            let guard = self.lock_row(self.row_lock(table, &key)).await?;
            held.push((key, guard));
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
        }

        {
            let mut tables = self.tables.lock();
            let rows = &mut tables.entry(table.to_string()).or_default().rows;
            for obs in batch {
                let key = (obs.symbol.clone(), obs.timestamp);
                match rows.get_mut(&key) {
                    Some(existing) => existing.merge_from(obs, required),
                    None => {
                        rows.insert(key, obs.clone());
                    }
                }
            }
        }

        self.commits
            .lock()
            .push(held.iter().map(|(k, _)| k.clone()).collect());

        Ok(batch.len() as u64)
    }

    async fn coverage(
        &self,
        table: &str,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        completeness_threshold: f64,
    ) -> Result<CoverageStats, StoreError> {
        self.take_read_error()?;
        self.check_table(table)?;
        if start > end {
            return Ok(CoverageStats::default());
        }

        let tables = self.tables.lock();
        let Some(t) = tables.get(table) else {
            return Ok(CoverageStats::default());
        };

        let mut stats = CoverageStats::default();
        let range = (symbol.to_string(), start)..=(symbol.to_string(), end);
        for obs in t.rows.range(range).map(|(_, o)| o) {
            stats.min = Some(stats.min.map_or(obs.timestamp, |m| m.min(obs.timestamp)));
            stats.max = Some(stats.max.map_or(obs.timestamp, |m| m.max(obs.timestamp)));
            stats.row_count += 1;
            if obs.completeness < completeness_threshold {
                stats.low_quality_count += 1;
                stats.low_min = Some(stats.low_min.map_or(obs.timestamp, |m| m.min(obs.timestamp)));
                stats.low_max = Some(stats.low_max.map_or(obs.timestamp, |m| m.max(obs.timestamp)));
            }
        }

        Ok(stats)
    }

    async fn recent(
        &self,
        table: &str,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<Observation>, StoreError> {
        self.take_read_error()?;
        self.check_table(table)?;

        let tables = self.tables.lock();
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };

        Ok(t.rows
            .values()
            .rev()
            .filter(|o| o.symbol == symbol)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
