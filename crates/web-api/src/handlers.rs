use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mdc_core::{CollectionRun, RunOutcome};
use mdc_orchestrator::{CollectionOrchestrator, SymbolStatus, TriggerError, TriggerRequest};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
pub struct BackfillResponse {
    pub outcome: RunOutcome,
    pub summary: String,
    pub run: CollectionRun,
}

/// `TriggerError` as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub TriggerError);

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        Self(err)
    }
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match &self.0 {
            TriggerError::Busy(_) => StatusCode::CONFLICT,
            TriggerError::InvalidRange { .. } | TriggerError::NoSymbols => StatusCode::BAD_REQUEST,
            TriggerError::UnknownTable(_) | TriggerError::UnknownSymbol { .. } => StatusCode::NOT_FOUND,
            TriggerError::UnknownSource(_) => StatusCode::SERVICE_UNAVAILABLE,
            TriggerError::Backfill(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self.0 {
            TriggerError::Busy(symbols) => json!({ "error": self.0.to_string(), "busy": symbols }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Liveness probe.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Gets the status of one tracked symbol.
///
/// # Errors
/// Returns `StatusCode::NOT_FOUND` if the symbol is not tracked in the table.
pub async fn get_symbol_status(
    State(orchestrator): State<CollectionOrchestrator>,
    Path((table, symbol)): Path<(String, String)>,
) -> Result<Json<SymbolStatus>, StatusCode> {
    orchestrator
        .status(&table, &symbol)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Runs a manual backfill and returns its summary.
///
/// Partial failures are a 200 with `outcome = partial_success`.
///
/// # Errors
/// 409 when a requested symbol is already collecting, 400 for an invalid
/// range, 404 for an unknown table or symbol.
pub async fn trigger_backfill(
    State(orchestrator): State<CollectionOrchestrator>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<BackfillResponse>, ApiError> {
    let run = orchestrator.trigger(request).await.map_err(|e| {
        tracing::warn!(error = %e, "Manual backfill refused");
        ApiError(e)
    })?;

    Ok(Json(BackfillResponse {
        outcome: run.outcome(),
        summary: run.summary(),
        run,
    }))
}

/// Clears `Unsupported` on a symbol.
///
/// # Errors
/// Returns 404 if the symbol is not tracked.
pub async fn reset_symbol(
    State(orchestrator): State<CollectionOrchestrator>,
    Path((table, symbol)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    orchestrator.reset(&table, &symbol).await?;
    Ok(StatusCode::NO_CONTENT)
}
