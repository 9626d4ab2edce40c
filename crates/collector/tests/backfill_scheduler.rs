//! Backfill scheduler against the in-memory store and scripted source.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use mdc_collector::{
    BackfillError, BackfillRequest, BackfillScheduler, GapDetector, ScriptedResponse,
    ScriptedSource, SourceRateLimiter,
};
use mdc_core::{
    cancel_pair, CancelSignal, FailureReason, FieldMap, GapConfig, Observation,
    PersistenceConfig, RunOutcome, SchedulerConfig, SourceError, StopReason,
};
use mdc_data::{InMemoryStore, PersistenceLayer, StoreError};
use std::sync::Arc;
use std::time::Duration;

const TABLE: &str = "ohlcv_1h";

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_batch_span_secs: 7 * 24 * 3600,
        max_retries: 2,
        retry_base_delay_ms: 100,
        retry_max_delay_ms: 1_000,
        requeue_base_delay_ms: 200,
        max_requeues: 2,
        max_run_duration_secs: 900,
        fetch_timeout_secs: 30,
        concurrency: 4,
    }
}

fn harness(config: SchedulerConfig) -> (Arc<InMemoryStore>, BackfillScheduler) {
    let store = Arc::new(InMemoryStore::new());
    let persistence = PersistenceLayer::new(
        store.clone(),
        PersistenceConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_jitter_ms: 0,
        },
    );
    let detector = GapDetector::new(store.clone(), GapConfig::default());
    let limiter = Arc::new(SourceRateLimiter::with_default_interval(
        &[],
        Duration::from_millis(10),
    ));
    let scheduler = BackfillScheduler::new(persistence, detector, limiter, config);
    (store, scheduler)
}

fn request(symbols: &[&str], start: DateTime<Utc>, end: DateTime<Utc>) -> BackfillRequest {
    BackfillRequest {
        table: TABLE.to_string(),
        symbols: symbols.iter().map(|s| (*s).to_string()).collect(),
        cadence: ChronoDuration::hours(1),
        desired_start: start,
        desired_end: end,
        lookback_days: 365,
        required_fields: vec!["value".to_string()],
    }
}

fn source() -> Arc<ScriptedSource> {
    Arc::new(ScriptedSource::new("scripted", ChronoDuration::hours(1)))
}

fn seeded_row(symbol: &str, ts: DateTime<Utc>) -> Observation {
    let mut fields = FieldMap::new();
    fields.insert("value".to_string(), Some(1.0));
    Observation::new(symbol, ts, "seed", fields)
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fills_detected_gaps() {
    let (store, scheduler) = harness(scheduler_config());
    store.seed(TABLE, vec![seeded_row("BTC", at(9)), seeded_row("BTC", at(11))]);
    let source = source();

    let run = scheduler
        .run(&request(&["BTC"], at(8), at(12)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(run.outcome(), RunOutcome::Success);
    assert_eq!(run.gaps_found, 2);
    assert_eq!(run.batches_attempted, 2);
    assert_eq!(run.batches_succeeded, 2);
    assert_eq!(run.records_written, 4);

    let calls = source.calls_for("BTC");
    assert_eq!((calls[0].start, calls[0].end), (at(8), at(8)));
    assert_eq!((calls[1].start, calls[1].end), (at(10), at(12)));

    let rows = store.rows(TABLE, "BTC");
    let stamps: Vec<_> = rows.iter().map(|r| r.timestamp).collect();
    assert_eq!(stamps, vec![at(8), at(9), at(10), at(11), at(12)]);
}

#[tokio::test(start_paused = true)]
async fn test_complete_symbol_issues_no_fetch() {
    let (store, scheduler) = harness(scheduler_config());
    store.seed(TABLE, (8..=12).map(|h| seeded_row("BTC", at(h))));
    let source = source();

    let run = scheduler
        .run(&request(&["BTC"], at(8), at(12)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(run.gaps_found, 0);
    assert!(source.calls().is_empty());
    assert_eq!(run.outcome(), RunOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_sub_ranges_are_sequential_per_symbol() {
    let mut config = scheduler_config();
    config.max_batch_span_secs = 2 * 3600;
    let (_store, scheduler) = harness(config);
    let source = source();

    let run = scheduler
        .run(
            &request(&["BTC", "ETH", "SOL"], at(0), at(9)),
            source.clone(),
            &CancelSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(run.batches_succeeded, 15);
    for symbol in ["BTC", "ETH", "SOL"] {
        let calls = source.calls_for(symbol);
        assert_eq!(calls.len(), 5);
        for pair in calls.windows(2) {
            assert!(pair[0].end < pair[1].start);
            assert!(pair[0].at <= pair[1].at);
        }
    }
}

// ============================================================================
// Transient failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_with_backoff() {
    let (store, scheduler) = harness(scheduler_config());
    let source = source();
    source.script(
        "BTC",
        [
            ScriptedResponse::Fail(SourceError::transient("connection reset")),
            ScriptedResponse::Fail(SourceError::transient("502")),
        ],
    );

    let run = scheduler
        .run(&request(&["BTC"], at(8), at(10)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(run.outcome(), RunOutcome::Success);
    assert_eq!(run.batches_attempted, 1);
    assert_eq!(run.batches_succeeded, 1);
    let calls = source.calls_for("BTC");
    assert_eq!(calls.len(), 3);
    assert!(calls[1].at - calls[0].at >= Duration::from_millis(100));
    assert!(calls[2].at - calls[1].at >= Duration::from_millis(200));
    assert_eq!(store.rows(TABLE, "BTC").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_exhaustion_is_partial_failure() {
    let (_store, scheduler) = harness(scheduler_config());
    let source = source();
    source.script(
        "BTC",
        (0..3).map(|_| ScriptedResponse::Fail(SourceError::transient("timeout"))),
    );

    let run = scheduler
        .run(&request(&["BTC"], at(8), at(10)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(run.outcome(), RunOutcome::PartialSuccess);
    assert_eq!(run.batches_failed, 1);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].reason, FailureReason::RetriesExhausted);
    assert_eq!((run.failures[0].start, run.failures[0].end), (at(8), at(10)));
    assert!(run.symbols["BTC"].collection_failed());
}

#[tokio::test(start_paused = true)]
async fn test_fetch_timeout_counts_as_transient() {
    let mut config = scheduler_config();
    config.fetch_timeout_secs = 1;
    let (_store, scheduler) = harness(config);
    let source = source();
    source.script("BTC", [ScriptedResponse::Hang]);

    let run = scheduler
        .run(&request(&["BTC"], at(8), at(10)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(run.batches_succeeded, 1);
    assert_eq!(source.calls_for("BTC").len(), 2);
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rate_limited_range_is_requeued_at_back() {
    let mut config = scheduler_config();
    config.max_batch_span_secs = 2 * 3600;
    let (store, scheduler) = harness(config);
    let source = source();
    source.script("BTC", [ScriptedResponse::Fail(SourceError::rate_limited())]);

    let run = scheduler
        .run(&request(&["BTC"], at(0), at(3)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    let starts: Vec<_> = source.calls_for("BTC").iter().map(|c| c.start).collect();
    assert_eq!(starts, vec![at(0), at(2), at(0)]);
    assert_eq!(run.outcome(), RunOutcome::Success);
    assert_eq!(run.batches_attempted, 2);
    assert_eq!(store.rows(TABLE, "BTC").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_is_honoured() {
    let (_store, scheduler) = harness(scheduler_config());
    let source = source();
    source.script(
        "BTC",
        [ScriptedResponse::Fail(SourceError::rate_limited_for(Duration::from_secs(5)))],
    );

    scheduler
        .run(&request(&["BTC"], at(8), at(10)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    let calls = source.calls_for("BTC");
    assert_eq!(calls.len(), 2);
    let waited = calls[1].at - calls[0].at;
    assert!(waited >= Duration::from_secs(5));
    assert!(waited <= Duration::from_millis(5_300));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_requeues_are_bounded() {
    let (_store, scheduler) = harness(scheduler_config());
    let source = source();
    source.script(
        "BTC",
        (0..3).map(|_| ScriptedResponse::Fail(SourceError::rate_limited())),
    );

    let run = scheduler
        .run(&request(&["BTC"], at(8), at(10)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(source.calls_for("BTC").len(), 3);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].reason, FailureReason::RateLimited);
}

// ============================================================================
// Permanent failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_not_found_skips_symbol_only() {
    let (store, scheduler) = harness(scheduler_config());
    let source = source();
    source.mark_unsupported("XYZ");

    let run = scheduler
        .run(&request(&["BTC", "XYZ"], at(8), at(10)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(run.unsupported, vec!["XYZ".to_string()]);
    assert!(run.symbols["XYZ"].not_found);
    assert_eq!(source.calls_for("XYZ").len(), 1);
    assert_eq!(store.rows(TABLE, "BTC").len(), 3);
    assert_eq!(run.outcome(), RunOutcome::PartialSuccess);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_drops_only_that_range() {
    let mut config = scheduler_config();
    config.max_batch_span_secs = 2 * 3600;
    let (store, scheduler) = harness(config);
    let source = source();
    source.script(
        "BTC",
        [ScriptedResponse::Fail(SourceError::malformed("missing close"))],
    );

    let run = scheduler
        .run(&request(&["BTC"], at(0), at(3)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(run.batches_failed, 1);
    assert_eq!(run.batches_succeeded, 1);
    assert_eq!(run.failures[0].reason, FailureReason::Malformed);
    assert_eq!(source.calls_for("BTC").len(), 2);
    let stamps: Vec<_> = store.rows(TABLE, "BTC").iter().map(|r| r.timestamp).collect();
    assert_eq!(stamps, vec![at(2), at(3)]);
}

// ============================================================================
// Persistence failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_records_range_and_continues() {
    let mut config = scheduler_config();
    config.max_batch_span_secs = 2 * 3600;
    let (store, scheduler) = harness(config);
    store.fail_next_writes([StoreError::Database("check constraint".to_string())]);
    let source = source();

    let run = scheduler
        .run(&request(&["BTC"], at(0), at(3)), source, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].reason, FailureReason::Persistence);
    assert_eq!(run.batches_succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pool_exhaustion_ends_symbol() {
    let mut config = scheduler_config();
    config.max_batch_span_secs = 2 * 3600;
    let (store, scheduler) = harness(config);
    store.fail_next_writes([StoreError::PoolExhausted]);
    let source = source();

    let run = scheduler
        .run(&request(&["BTC"], at(0), at(3)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert!(run.symbols["BTC"].error.is_some());
    assert!(run.symbols["BTC"].collection_failed());
    assert_eq!(source.calls_for("BTC").len(), 1);
    assert_eq!(run.undispatched, 1);
}

#[tokio::test(start_paused = true)]
async fn test_gap_query_failure_is_symbol_error() {
    let (store, scheduler) = harness(scheduler_config());
    store.fail_next_reads([StoreError::Database("relation does not exist".to_string())]);
    let source = source();

    let run = scheduler
        .run(&request(&["BTC"], at(0), at(3)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert!(run.symbols["BTC"].error.is_some());
    assert!(source.calls().is_empty());
    assert_eq!(run.outcome(), RunOutcome::PartialSuccess);
}

// ============================================================================
// Deadline and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_deadline_returns_partial_run() {
    let mut config = scheduler_config();
    config.max_batch_span_secs = 3600;
    config.max_run_duration_secs = 1;
    let (store, scheduler) = harness(config);
    let source = Arc::new(
        ScriptedSource::new("scripted", ChronoDuration::hours(1))
            .with_latency(Duration::from_millis(600)),
    );

    let run = scheduler
        .run(&request(&["BTC"], at(0), at(3)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(run.stopped_early, Some(StopReason::Deadline));
    assert_eq!(run.batches_succeeded, 2);
    assert_eq!(run.undispatched, 2);
    assert_eq!(store.rows(TABLE, "BTC").len(), 2);
    assert_eq!(run.outcome(), RunOutcome::PartialSuccess);
}

#[tokio::test(start_paused = true)]
async fn test_requeue_wait_is_cut_short_by_deadline() {
    let mut config = scheduler_config();
    config.max_run_duration_secs = 1;
    config.requeue_base_delay_ms = 5_000;
    let (store, scheduler) = harness(config);
    let source = source();
    source.script("BTC", [ScriptedResponse::Fail(SourceError::rate_limited())]);

    let started = tokio::time::Instant::now();
    let run = scheduler
        .run(&request(&["BTC"], at(8), at(10)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(source.calls_for("BTC").len(), 1);
    assert_eq!(run.stopped_early, Some(StopReason::Deadline));
    assert_eq!(run.undispatched, 1);
    assert_eq!(run.batches_succeeded, 0);
    assert!(store.rows(TABLE, "BTC").is_empty());
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1_500), "ran {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_beyond_deadline_is_not_awaited() {
    let mut config = scheduler_config();
    config.max_run_duration_secs = 2;
    let (_store, scheduler) = harness(config);
    let source = source();
    source.script(
        "BTC",
        [ScriptedResponse::Fail(SourceError::rate_limited_for(Duration::from_secs(60)))],
    );

    let started = tokio::time::Instant::now();
    let run = scheduler
        .run(&request(&["BTC"], at(8), at(10)), source.clone(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(source.calls_for("BTC").len(), 1);
    assert_eq!(run.stopped_early, Some(StopReason::Deadline));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_dispatches_nothing() {
    let mut config = scheduler_config();
    config.max_batch_span_secs = 3600;
    let (_store, scheduler) = harness(config);
    let source = source();
    let (handle, signal) = cancel_pair();
    handle.cancel();

    let run = scheduler
        .run(&request(&["BTC"], at(0), at(3)), source.clone(), &signal)
        .await
        .unwrap();

    assert!(source.calls().is_empty());
    assert_eq!(run.stopped_early, Some(StopReason::Cancelled));
    assert_eq!(run.undispatched, 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run_lets_in_flight_finish() {
    let mut config = scheduler_config();
    config.max_batch_span_secs = 3600;
    let (store, scheduler) = harness(config);
    let source = Arc::new(
        ScriptedSource::new("scripted", ChronoDuration::hours(1))
            .with_latency(Duration::from_millis(500)),
    );
    let (handle, signal) = cancel_pair();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(750)).await;
        handle.cancel();
    });

    let run = scheduler
        .run(&request(&["BTC"], at(0), at(3)), source.clone(), &signal)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(run.stopped_early, Some(StopReason::Cancelled));
    assert_eq!(run.batches_succeeded, 2);
    assert_eq!(store.rows(TABLE, "BTC").len(), 2);
    assert_eq!(run.undispatched, 2);
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_invalid_cadence_rejected_before_work() {
    let (_store, scheduler) = harness(scheduler_config());
    let source = source();
    let mut req = request(&["BTC"], at(0), at(3));
    req.cadence = ChronoDuration::zero();

    let err = scheduler
        .run(&req, source.clone(), &CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, BackfillError::InvalidConfig(_)));
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn test_sub_second_cadence_rejected_before_work() {
    let (_store, scheduler) = harness(scheduler_config());
    let source = source();
    let mut req = request(&["BTC"], at(0), at(3));
    req.cadence = ChronoDuration::milliseconds(500);

    let err = scheduler
        .run(&req, source.clone(), &CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, BackfillError::InvalidConfig(_)));
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn test_zero_batch_span_rejected() {
    let mut config = scheduler_config();
    config.max_batch_span_secs = 0;
    let (_store, scheduler) = harness(config);

    let err = scheduler
        .run(&request(&["BTC"], at(0), at(3)), source(), &CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, BackfillError::InvalidConfig(_)));
}
