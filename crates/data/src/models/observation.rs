//! Row shape of an observation table.
//!
//! Domain fields live in a JSONB column so one schema serves candles,
//! on-chain metrics and macro series alike.

use chrono::{DateTime, Utc};
use mdc_core::{FieldMap, Observation};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// An observation as stored in Postgres.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ObservationRecord {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// Field name to value, `null` where the upstream sent nothing
    pub fields: Json<FieldMap>,
    /// Producing adapter (e.g., "binance_futures")
    pub source: String,
    /// Share of expected fields populated, 0 to 100
    pub completeness: f64,
}

impl From<ObservationRecord> for Observation {
    fn from(record: ObservationRecord) -> Self {
        Self {
            symbol: record.symbol,
            timestamp: record.timestamp,
            fields: record.fields.0,
            source: record.source,
            completeness: record.completeness,
        }
    }
}

impl From<&Observation> for ObservationRecord {
    fn from(obs: &Observation) -> Self {
        Self {
            symbol: obs.symbol.clone(),
            timestamp: obs.timestamp,
            fields: Json(obs.fields.clone()),
            source: obs.source.clone(),
            completeness: obs.completeness,
        }
    }
}
