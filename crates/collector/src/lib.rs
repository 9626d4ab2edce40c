//! Collection pipeline of the market data collector.
//!
//! This crate provides:
//! - `SourceRateLimiter`: per-source call pacing
//! - Source adapters (Binance klines, scripted)
//! - `GapDetector`: missing-range detection over the observation store
//! - `BackfillScheduler`: rate-limited, retrying gap fill
//! - `HealthScorer`: freshness and completeness scoring

pub mod backfill;
pub mod gap_detector;
pub mod health;
pub mod rate_limiter;
pub mod sources;

pub use backfill::{split_gap, BackfillError, BackfillRequest, BackfillScheduler};
pub use gap_detector::{compute_gaps, merge_gaps, GapDetector, GapQuery};
pub use health::{score_rows, HealthScorer};
pub use rate_limiter::SourceRateLimiter;
pub use sources::{BinanceKlineSource, Interval, ScriptedResponse, ScriptedSource};
