use chrono::{DateTime, Utc};
use mdc_core::{HealthRecord, SymbolRunSummary, SymbolState};
use serde::{Deserialize, Serialize};

/// Best-known view of one tracked `(table, symbol)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolStatus {
    pub table: String,
    pub symbol: String,
    pub source: String,
    pub state: SymbolState,
    /// Last computed health. Kept through failures so status never goes blank.
    pub health: Option<HealthRecord>,
    pub last_run: Option<SymbolRunSummary>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SymbolStatus {
    #[must_use]
    pub fn new(table: &str, symbol: &str, source: &str) -> Self {
        Self {
            table: table.to_string(),
            symbol: symbol.to_string(),
            source: source.to_string(),
            state: SymbolState::Idle,
            health: None,
            last_run: None,
            last_run_at: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub(crate) fn transition(&mut self, state: SymbolState) {
        if self.state != state {
            tracing::debug!(
                table = %self.table,
                symbol = %self.symbol,
                from = %self.state,
                to = %state,
                "Symbol state change"
            );
        }
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// Result of one orchestrator tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub scored: usize,
    pub triggered: usize,
    /// Symbols skipped because a run was already in flight.
    pub busy: usize,
    pub unsupported: usize,
    pub failed: usize,
}
