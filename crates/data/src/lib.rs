//! Observation storage for the market data collector.
//!
//! This crate provides:
//! - Database client for `PostgreSQL`
//! - The `ObservationStore` seam with Postgres and in-memory implementations
//! - `PersistenceLayer`, the single writer used by every component

pub mod database;
pub mod memory_store;
pub mod models;
pub mod persistence;
pub mod repositories;
pub mod store;

pub use database::DatabaseClient;
pub use memory_store::InMemoryStore;
pub use models::ObservationRecord;
pub use persistence::{sort_for_write, PersistenceLayer, UpsertOutcome};
pub use repositories::ObservationRepository;
pub use store::{CoverageStats, ObservationStore, StoreError};
