//! Per-source call pacing.
//!
//! Each source key gets a minimum spacing between calls and, optionally, a
//! cap on calls per window. Waiters on one key queue on a fair async mutex,
//! so with `N` concurrent callers nobody waits longer than `N × min_interval`
//! (plus window-cap waits when a cap is configured).

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use mdc_core::RateLimitConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Type alias for the governor rate limiter.
type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Spacing used for keys without explicit configuration.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

struct KeyLimiter {
    min_interval: Duration,
    last_call: tokio::sync::Mutex<Option<Instant>>,
    window: Option<GovernorLimiter>,
}

impl KeyLimiter {
    fn new(min_interval: Duration, max_per_window: Option<u32>, window: Duration) -> Self {
        let window = max_per_window
            .and_then(NonZeroU32::new)
            .and_then(|cap| {
                Quota::with_period(window / cap.get()).map(|quota| quota.allow_burst(cap))
            })
            .map(RateLimiter::direct);

        Self {
            min_interval,
            last_call: tokio::sync::Mutex::new(None),
            window,
        }
    }
}

/// Shared rate limiter keyed by source name.
pub struct SourceRateLimiter {
    default_interval: Duration,
    configured: HashMap<String, RateLimitConfig>,
    keys: Mutex<HashMap<String, Arc<KeyLimiter>>>,
}

impl SourceRateLimiter {
    #[must_use]
    pub fn new(configs: &[RateLimitConfig]) -> Self {
        Self::with_default_interval(configs, DEFAULT_MIN_INTERVAL)
    }

    #[must_use]
    pub fn with_default_interval(configs: &[RateLimitConfig], default_interval: Duration) -> Self {
        Self {
            default_interval,
            configured: configs
                .iter()
                .map(|c| (c.source.clone(), c.clone()))
                .collect(),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Minimum spacing that applies to `key`.
    #[must_use]
    pub fn min_interval(&self, key: &str) -> Duration {
        self.configured
            .get(key)
            .map_or(self.default_interval, RateLimitConfig::min_interval)
    }

    fn limiter_for(&self, key: &str) -> Arc<KeyLimiter> {
        let mut keys = self.keys.lock();
        let limiter = keys.entry(key.to_string()).or_insert_with(|| {
            let limiter = match self.configured.get(key) {
                Some(config) => KeyLimiter::new(
                    config.min_interval(),
                    config.max_per_window,
                    config.window(),
                ),
                None => KeyLimiter::new(self.default_interval, None, Duration::ZERO),
            };
            Arc::new(limiter)
        });
        Arc::clone(limiter)
    }

    /// Waits until a call to `key` is allowed, then records it.
    pub async fn acquire(&self, key: &str) {
        let limiter = self.limiter_for(key);
        let mut last_call = limiter.last_call.lock().await;

        if let Some(previous) = *last_call {
            tokio::time::sleep_until(previous + limiter.min_interval).await;
        }
        if let Some(window) = &limiter.window {
            window.until_ready().await;
        }

        *last_call = Some(Instant::now());
    }

    /// Records a call to `key` if one is allowed right now.
    ///
    /// Returns `false` without waiting when the key is busy or paced.
    pub fn try_acquire(&self, key: &str) -> bool {
        let limiter = self.limiter_for(key);
        let Ok(mut last_call) = limiter.last_call.try_lock() else {
            return false;
        };

        let now = Instant::now();
        if let Some(previous) = *last_call {
            if now < previous + limiter.min_interval {
                return false;
            }
        }
        if let Some(window) = &limiter.window {
            if window.check().is_err() {
                return false;
            }
        }

        *last_call = Some(now);
        true
    }
}

impl std::fmt::Debug for SourceRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRateLimiter")
            .field("default_interval", &self.default_interval)
            .field("configured", &self.configured.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(source: &str, min_interval_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            source: source.to_string(),
            min_interval_ms,
            max_per_window: None,
            window_secs: 60,
        }
    }

    // ========================================================================
    // Pacing
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_sequential_acquires_are_spaced() {
        let limiter = SourceRateLimiter::new(&[config("binance_futures", 120)]);
        let started = Instant::now();

        for _ in 0..5 {
            limiter.acquire("binance_futures").await;
        }

        assert!(started.elapsed() >= Duration::from_millis(4 * 120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_is_immediate() {
        let limiter = SourceRateLimiter::new(&[config("binance_futures", 1_000)]);
        let started = Instant::now();
        limiter.acquire("binance_futures").await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_violate_spacing() {
        let interval = Duration::from_millis(50);
        let limiter = Arc::new(SourceRateLimiter::new(&[config("glassnode", 50)]));
        let started = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire("glassnode").await;
                Instant::now()
            }));
        }

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.unwrap());
        }
        stamps.sort();

        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
        // No caller waited longer than N × interval.
        for stamp in &stamps {
            assert!(*stamp - started <= interval * 8);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = SourceRateLimiter::new(&[config("a", 1_000), config("b", 1_000)]);
        limiter.acquire("a").await;
        let started = Instant::now();
        limiter.acquire("b").await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_key_uses_default_interval() {
        let limiter = SourceRateLimiter::with_default_interval(&[], Duration::from_millis(300));
        assert_eq!(limiter.min_interval("fred"), Duration::from_millis(300));

        let started = Instant::now();
        limiter.acquire("fred").await;
        limiter.acquire("fred").await;
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    // ========================================================================
    // Non-blocking path
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_respects_interval() {
        let limiter = SourceRateLimiter::new(&[config("binance_futures", 200)]);
        assert!(limiter.try_acquire("binance_futures"));
        assert!(!limiter.try_acquire("binance_futures"));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(limiter.try_acquire("binance_futures"));
    }

    #[tokio::test]
    async fn test_window_cap_limits_burst() {
        let limiter = SourceRateLimiter::new(&[RateLimitConfig {
            source: "coingecko".to_string(),
            min_interval_ms: 0,
            max_per_window: Some(3),
            window_secs: 60,
        }]);

        assert!(limiter.try_acquire("coingecko"));
        assert!(limiter.try_acquire("coingecko"));
        assert!(limiter.try_acquire("coingecko"));
        assert!(!limiter.try_acquire("coingecko"));
    }
}
