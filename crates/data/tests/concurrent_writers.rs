//! Concurrent writers delivering overlapping batches in arbitrary orders.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures_util::future::join_all;
use mdc_core::{FieldMap, Observation, PersistenceConfig};
use mdc_data::{InMemoryStore, PersistenceLayer};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;

const SYMBOLS: [&str; 3] = ["BTCUSDT", "ETHUSDT", "SOLUSDT"];
const WRITERS: usize = 8;
const WINDOW_HOURS: i64 = 24;
const STRIDE_HOURS: i64 = 3;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
}

fn window(writer: usize) -> std::ops::Range<i64> {
    let start = writer as i64 * STRIDE_HOURS;
    start..start + WINDOW_HOURS
}

fn row(writer: usize, symbol: &str, hour: i64) -> Observation {
    let mut fields = FieldMap::new();
    fields.insert("close".to_string(), Some(writer as f64));
    fields.insert(format!("writer_{writer}"), Some(hour as f64));
    Observation::new(symbol, base() + ChronoDuration::hours(hour), "test", fields)
}

/// Every symbol over the writer's window, shuffled with a per-writer seed.
fn shuffled_batch(writer: usize) -> Vec<Observation> {
    let mut rows: Vec<Observation> = SYMBOLS
        .iter()
        .flat_map(|symbol| window(writer).map(move |h| row(writer, symbol, h)))
        .collect();
    rows.shuffle(&mut StdRng::seed_from_u64(writer as u64 + 17));
    rows
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shuffled_overlapping_batches_never_deadlock() {
    // A lock wait this long only happens on a lock-order cycle.
    let store = Arc::new(
        InMemoryStore::new()
            .with_lock_timeout(Duration::from_secs(2))
            .with_write_delay(Duration::from_millis(1)),
    );
    let layer = PersistenceLayer::new(
        store.clone(),
        PersistenceConfig {
            max_retries: 0,
            base_delay_ms: 1,
            max_jitter_ms: 0,
        },
    );

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let layer = layer.clone();
            let rows = shuffled_batch(writer);
            tokio::spawn(async move { layer.upsert_batch("ohlcv_1h", rows, &[]).await })
        })
        .collect();

    let joined = tokio::time::timeout(Duration::from_secs(30), join_all(handles))
        .await
        .expect("writers finished without deadlock");

    let per_writer = SYMBOLS.len() as u64 * WINDOW_HOURS as u64;
    for result in joined {
        let outcome = result.expect("task panicked").expect("writer succeeded");
        assert_eq!(outcome.records_written, per_writer);
        assert_eq!(outcome.retries, 0);
    }

    let last_hour = (WRITERS as i64 - 1) * STRIDE_HOURS + WINDOW_HOURS;
    for symbol in SYMBOLS {
        let rows = store.rows("ohlcv_1h", symbol);
        assert_eq!(rows.len() as i64, last_hour, "{symbol}");

        // Every writer covering a slot left its own field on the merged row.
        for row in &rows {
            let hour = (row.timestamp - base()).num_hours();
            for writer in (0..WRITERS).filter(|w| window(*w).contains(&hour)) {
                assert!(
                    row.fields.contains_key(&format!("writer_{writer}")),
                    "{symbol} hour {hour} lost writer {writer}"
                );
            }
        }
    }

    // Every commit took its row locks in canonical order.
    for commit in store.commit_log() {
        let mut sorted = commit.clone();
        sorted.sort();
        assert_eq!(commit, sorted);
    }
}

#[tokio::test]
async fn test_commits_are_in_symbol_then_timestamp_order() {
    let store = Arc::new(InMemoryStore::new());
    let layer = PersistenceLayer::new(store.clone(), PersistenceConfig::default());

    layer
        .upsert_batch("ohlcv_1h", shuffled_batch(0), &[])
        .await
        .unwrap();

    let log = store.commit_log();
    assert_eq!(log.len(), 1);
    let mut sorted = log[0].clone();
    sorted.sort();
    assert_eq!(log[0], sorted);
    assert_eq!(log[0][0].0, "BTCUSDT");
    assert_eq!(log[0].last().map(|(s, _)| s.as_str()), Some("SOLUSDT"));
}
