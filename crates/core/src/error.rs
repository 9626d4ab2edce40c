//! Error types shared across the collector crates.
//!
//! `SourceError` is the four-way taxonomy every upstream adapter maps its
//! failures into. The backfill scheduler owns the retry policy for each
//! variant; adapters only classify.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single `SourceAdapter::fetch` call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Upstream asked us to back off. The sub-range is requeued.
    #[error("rate limited by upstream{}", retry_after_suffix(.retry_after))]
    RateLimited {
        /// Delay suggested by the upstream, when it sent one.
        retry_after: Option<Duration>,
    },

    /// The symbol is not served by this source. Permanent.
    #[error("symbol not found: {symbol}")]
    NotFound {
        /// The unsupported symbol.
        symbol: String,
    },

    /// Network failure, timeout or 5xx. Retried with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Response failed schema validation. The batch is dropped.
    #[error("malformed response: {0}")]
    Malformed(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |d| {
        format!(", retry after {}ms", d.as_millis())
    })
}

impl SourceError {
    /// Creates a rate limit error without a retry hint.
    #[must_use]
    pub const fn rate_limited() -> Self {
        Self::RateLimited { retry_after: None }
    }

    /// Creates a rate limit error carrying the upstream's retry hint.
    #[must_use]
    pub const fn rate_limited_for(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after: Some(retry_after),
        }
    }

    /// Creates a not found error.
    pub fn not_found(symbol: impl Into<String>) -> Self {
        Self::NotFound {
            symbol: symbol.into(),
        }
    }

    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a malformed response error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Returns true if retrying the same request later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Returns true if the symbol should not be requested from this source again.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the upstream's retry hint, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for source adapter calls.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Configuration problems. Rejected up front and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("{table}: cadence must be positive, got {cadence_secs}s")]
    InvalidCadence { table: String, cadence_secs: i64 },

    #[error("{table}: health weights must be non-negative")]
    InvalidWeights { table: String },

    #[error("configuration error: {0}")]
    Invalid(String),
}
