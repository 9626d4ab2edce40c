use crate::{data_health, handlers};
use axum::{
    routing::{get, post},
    Router,
};
use mdc_core::CancelSignal;
use mdc_orchestrator::CollectionOrchestrator;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct ApiServer {
    orchestrator: CollectionOrchestrator,
}

impl ApiServer {
    #[must_use]
    pub const fn new(orchestrator: CollectionOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/health", get(handlers::health))
            .route("/api/status", get(data_health::data_health))
            .route("/api/status/:table/:symbol", get(handlers::get_symbol_status))
            .route("/api/backfill", post(handlers::trigger_backfill))
            .route("/api/symbols/:table/:symbol/reset", post(handlers::reset_symbol))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors),
            )
            .with_state(self.orchestrator.clone())
    }

    /// Starts the web server listening on the specified address.
    ///
    /// Returns once `shutdown` fires and in-flight requests have drained.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the address or serve requests.
    pub async fn serve(self, addr: &str, shutdown: CancelSignal) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web API listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}
