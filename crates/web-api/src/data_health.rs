//! Collection status endpoint.
//!
//! `/api/status` returns every tracked `(table, symbol)` with its state and
//! best-known health, plus an overall verdict across all of them.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use mdc_core::SymbolState;
use mdc_orchestrator::{CollectionOrchestrator, SymbolStatus};
use serde::Serialize;

/// Overall collection status response.
#[derive(Debug, Clone, Serialize)]
pub struct DataHealthResponse {
    /// "healthy", "degraded" or "unhealthy".
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub symbols: Vec<SymbolStatus>,
    pub summary: HealthSummary,
}

/// Symbol counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub unsupported: usize,
    /// Scheduled or collecting right now.
    pub active: usize,
    pub idle: usize,
}

impl HealthSummary {
    #[must_use]
    pub fn from_statuses(statuses: &[SymbolStatus]) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            match status.state {
                SymbolState::Healthy => summary.healthy += 1,
                SymbolState::Degraded => summary.degraded += 1,
                SymbolState::Failed => summary.failed += 1,
                SymbolState::Unsupported => summary.unsupported += 1,
                SymbolState::Scheduled | SymbolState::Collecting => summary.active += 1,
                SymbolState::Idle => summary.idle += 1,
            }
        }
        summary
    }
}

/// Any failed symbol makes the whole collector unhealthy.
fn determine_status(summary: &HealthSummary) -> &'static str {
    if summary.failed > 0 {
        "unhealthy"
    } else if summary.degraded > 0 || summary.unsupported > 0 {
        "degraded"
    } else {
        "healthy"
    }
}

/// GET /api/status - Returns the status of every tracked symbol.
pub async fn data_health(State(orchestrator): State<CollectionOrchestrator>) -> Json<DataHealthResponse> {
    let symbols = orchestrator.statuses().await;
    let summary = HealthSummary::from_statuses(&symbols);

    Json(DataHealthResponse {
        status: determine_status(&summary).to_string(),
        timestamp: Utc::now(),
        symbols,
        summary,
    })
}
