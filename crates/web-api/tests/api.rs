use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, DurationRound, Utc};
use mdc_collector::{ScriptedSource, SourceRateLimiter};
use mdc_core::{AppConfig, CancelSignal, SeriesConfig};
use mdc_data::{InMemoryStore, PersistenceLayer};
use mdc_orchestrator::CollectionOrchestrator;
use mdc_web_api::ApiServer;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.series = vec![SeriesConfig {
        table: "ohlcv_1h".to_string(),
        source: "scripted".to_string(),
        cadence_secs: 3600,
        symbols: vec!["BTC".to_string(), "ETH".to_string()],
        required_fields: vec!["value".to_string()],
        stale_threshold_secs: None,
        freshness_weight: 0.6,
        completeness_weight: 0.4,
        recent_rows: 24,
        lookback_days: Some(2),
    }];
    config
}

fn setup(source: ScriptedSource) -> (CollectionOrchestrator, Arc<ScriptedSource>, Router) {
    let config = config();
    let store = Arc::new(InMemoryStore::new());
    let persistence = PersistenceLayer::new(store, config.persistence.clone());
    let limiter = Arc::new(SourceRateLimiter::with_default_interval(
        &[],
        Duration::from_millis(1),
    ));
    let orchestrator = CollectionOrchestrator::new(config, persistence, limiter, CancelSignal::never());
    let source = Arc::new(source);
    orchestrator.register_source(source.clone());
    let router = ApiServer::new(orchestrator.clone()).router();
    (orchestrator, source, router)
}

fn scripted() -> ScriptedSource {
    ScriptedSource::new("scripted", ChronoDuration::hours(1))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn backfill_body(symbols: &[&str], hours: i64) -> Value {
    let end = Utc::now().duration_trunc(ChronoDuration::hours(1)).unwrap();
    let start = end - ChronoDuration::hours(hours);
    json!({
        "table": "ohlcv_1h",
        "symbols": symbols,
        "start": start.to_rfc3339(),
        "end": end.to_rfc3339(),
    })
}

// ============================================================================
// Status
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (_, _, router) = setup(scripted());
    let response = router.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_status_lists_tracked_symbols() {
    let (_, _, router) = setup(scripted());
    let response = router.oneshot(get("/api/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["symbols"].as_array().unwrap().len(), 2);
    assert_eq!(body["symbols"][0]["symbol"], "BTC");
    assert_eq!(body["symbols"][0]["state"], "idle");
    assert_eq!(body["summary"]["idle"], 2);
}

#[tokio::test]
async fn test_symbol_status_and_unknown_symbol() {
    let (_, _, router) = setup(scripted());

    let response = router.clone().oneshot(get("/api/status/ohlcv_1h/ETH")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["table"], "ohlcv_1h");

    let response = router.oneshot(get("/api/status/ohlcv_1h/DOGE")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Manual backfill
// ============================================================================

#[tokio::test]
async fn test_backfill_success() {
    let (orchestrator, _, router) = setup(scripted());

    let response = router
        .oneshot(post_json("/api/backfill", &backfill_body(&["BTC"], 3)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["outcome"], "success");
    assert_eq!(body["run"]["records_written"], 4);
    let status = orchestrator.status("ohlcv_1h", "BTC").await.unwrap();
    assert_eq!(status.state, mdc_core::SymbolState::Healthy);
}

#[tokio::test]
async fn test_backfill_partial_success_is_ok() {
    let source = scripted();
    source.mark_unsupported("ETH");
    let (_, _, router) = setup(source);

    let response = router
        .oneshot(post_json("/api/backfill", &backfill_body(&["BTC", "ETH"], 3)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["outcome"], "partial_success");
    assert_eq!(body["run"]["unsupported"], json!(["ETH"]));
}

#[tokio::test]
async fn test_backfill_invalid_range() {
    let (_, source, router) = setup(scripted());
    let mut body = backfill_body(&["BTC"], 3);
    let start = body["start"].clone();
    body["start"] = body["end"].clone();
    body["end"] = start;

    let response = router.oneshot(post_json("/api/backfill", &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn test_backfill_single_instant_is_accepted() {
    let (_, source, router) = setup(scripted());
    let body = backfill_body(&["BTC"], 0);

    let response = router.oneshot(post_json("/api/backfill", &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(source.calls_for("BTC").len(), 1);
}

#[tokio::test]
async fn test_backfill_unknown_table() {
    let (_, _, router) = setup(scripted());
    let mut body = backfill_body(&["BTC"], 3);
    body["table"] = json!("funding_8h");

    let response = router.oneshot(post_json("/api/backfill", &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backfill_busy_returns_conflict() {
    let (orchestrator, _, router) =
        setup(scripted().with_latency(Duration::from_millis(500)));

    let first = {
        let router = router.clone();
        tokio::spawn(async move {
            router
                .oneshot(post_json("/api/backfill", &backfill_body(&["BTC"], 3)))
                .await
                .unwrap()
        })
    };

    // Wait until the first request holds the symbol.
    for _ in 0..100 {
        if orchestrator
            .status("ohlcv_1h", "BTC")
            .await
            .is_some_and(|s| s.state.is_active())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = router
        .oneshot(post_json("/api/backfill", &backfill_body(&["BTC", "ETH"], 3)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["busy"], json!(["BTC"]));

    let first = first.await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
}

// ============================================================================
// Reset
// ============================================================================

#[tokio::test]
async fn test_reset_unsupported_symbol() {
    let source = scripted();
    source.mark_unsupported("ETH");
    let (orchestrator, _, router) = setup(source);

    router
        .clone()
        .oneshot(post_json("/api/backfill", &backfill_body(&["ETH"], 3)))
        .await
        .unwrap();
    assert_eq!(
        orchestrator.status("ohlcv_1h", "ETH").await.unwrap().state,
        mdc_core::SymbolState::Unsupported
    );

    let response = router
        .clone()
        .oneshot(post_json("/api/symbols/ohlcv_1h/ETH/reset", &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        orchestrator.status("ohlcv_1h", "ETH").await.unwrap().state,
        mdc_core::SymbolState::Idle
    );

    let response = router
        .oneshot(post_json("/api/symbols/ohlcv_1h/DOGE/reset", &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
