use chrono::{DateTime, Utc};
use mdc_collector::BackfillError;
use thiserror::Error;

/// Why a manual trigger was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    /// A run is already in flight for these symbols.
    #[error("symbols already collecting: {}", .0.join(", "))]
    Busy(Vec<String>),

    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error("{symbol} is not tracked in {table}")]
    UnknownSymbol { table: String, symbol: String },

    #[error("no source registered under {0}")]
    UnknownSource(String),

    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("no symbols requested")]
    NoSymbols,

    #[error(transparent)]
    Backfill(#[from] BackfillError),
}
