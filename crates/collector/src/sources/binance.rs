//! Binance USD-M futures klines.
//!
//! Fetches historical candles from `/fapi/v1/klines`, paginating when a
//! range holds more candles than one response carries.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use mdc_core::{FieldMap, Observation, SourceAdapter, SourceError, SourceResult};
use reqwest::StatusCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::http;
use crate::rate_limiter::SourceRateLimiter;

/// Maximum candles per request (Binance limit is 1500)
const MAX_CANDLES_PER_REQUEST: usize = 1500;

/// Binance Futures API base URL
const BINANCE_FUTURES_API: &str = "https://fapi.binance.com";

/// Binance error code for an unknown symbol.
const INVALID_SYMBOL_CODE: i64 = -1121;

/// Rate limit key and `Observation::source` tag of this adapter.
pub const SOURCE_NAME: &str = "binance_futures";

/// Fields carried by every kline observation.
pub const KLINE_FIELDS: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// Kline interval accepted by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    FourHours,
    OneDay,
}

impl Interval {
    const ALL: [Self; 6] = [
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
    ];

    /// Returns the Binance API string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }

    #[must_use]
    pub const fn duration_secs(self) -> i64 {
        match self {
            Self::OneMinute => 60,
            Self::FiveMinutes => 300,
            Self::FifteenMinutes => 900,
            Self::OneHour => 3_600,
            Self::FourHours => 14_400,
            Self::OneDay => 86_400,
        }
    }

    #[must_use]
    pub fn duration(self) -> ChronoDuration {
        ChronoDuration::seconds(self.duration_secs())
    }

    /// Interval matching a series cadence, if Binance serves one.
    #[must_use]
    pub fn from_cadence_secs(secs: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.duration_secs() == secs)
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                anyhow!("Invalid interval: '{s}'. Valid values: 1m, 5m, 15m, 1h, 4h, 1d")
            })
    }
}

/// Reference `SourceAdapter` for Binance futures candles.
pub struct BinanceKlineSource {
    client: reqwest::Client,
    base_url: String,
    interval: Interval,
    page_limit: usize,
    limiter: Option<Arc<SourceRateLimiter>>,
}

impl BinanceKlineSource {
    /// Creates an adapter against the public Binance Futures API.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(interval: Interval, timeout: Duration) -> Result<Self> {
        Self::with_base_url(BINANCE_FUTURES_API, interval, timeout)
    }

    /// Creates an adapter against a custom base URL.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_base_url(base_url: &str, interval: Interval, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            interval,
            page_limit: MAX_CANDLES_PER_REQUEST,
            limiter: None,
        })
    }

    /// Paces follow-up pages through `limiter`. The first page of each
    /// fetch is paced by the caller.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<SourceRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit.clamp(1, MAX_CANDLES_PER_REQUEST);
        self
    }

    /// Fetches a single page starting at `start`.
    async fn fetch_page(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SourceResult<Vec<Observation>> {
        let url = format!("{}/fapi/v1/klines", self.base_url);
        let start_ms = start.timestamp_millis().to_string();
        let end_ms = end.timestamp_millis().to_string();
        let limit = self.page_limit.to_string();

        let response = http::send(|| {
            self.client.get(&url).query(&[
                ("symbol", symbol),
                ("interval", self.interval.as_str()),
                ("startTime", start_ms.as_str()),
                ("endTime", end_ms.as_str()),
                ("limit", limit.as_str()),
            ])
        })
        .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| http::classify_transport(&e))?;

        if !status.is_success() {
            return Err(classify_error(status, &headers, symbol, &body));
        }

        let data: Vec<Vec<serde_json::Value>> = serde_json::from_str(&body)
            .map_err(|e| SourceError::malformed(format!("kline payload: {e}")))?;

        data.iter()
            .map(|kline| parse_kline(kline, symbol, self.interval))
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for BinanceKlineSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SourceResult<Vec<Observation>> {
        let mut records = Vec::new();
        let mut cursor = start;
        let mut first_page = true;

        while cursor <= end {
            if !first_page {
                if let Some(limiter) = &self.limiter {
                    limiter.acquire(SOURCE_NAME).await;
                }
            }
            first_page = false;

            let page = self.fetch_page(symbol, cursor, end).await?;
            let full_page = page.len() >= self.page_limit;
            let Some(last) = page.last().map(|o| o.timestamp) else {
                break;
            };
            records.extend(page);

            if !full_page {
                break;
            }
            // Move start to one interval after the last record
            cursor = last + self.interval.duration();
        }

        tracing::debug!(
            symbol,
            start = %start,
            end = %end,
            candles = records.len(),
            "Fetched klines"
        );

        Ok(records)
    }
}

/// Binance reports an unknown symbol as HTTP 400 with code -1121.
fn classify_error(
    status: StatusCode,
    headers: &reqwest::header::HeaderMap,
    symbol: &str,
    body: &str,
) -> SourceError {
    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("code").and_then(serde_json::Value::as_i64));

    if code == Some(INVALID_SYMBOL_CODE) {
        return SourceError::not_found(symbol);
    }
    http::classify_status(status, headers, symbol, body)
}

/// Parses a single kline from the Binance API response.
///
/// Binance kline format:
/// ```text
/// [
///   1499040000000,      // 0: Open time
///   "0.01634000",       // 1: Open
///   "0.80000000",       // 2: High
///   "0.01575800",       // 3: Low
///   "0.01577100",       // 4: Close
///   "148976.11427815",  // 5: Volume
///   ...
/// ]
/// ```
fn parse_kline(
    kline: &[serde_json::Value],
    symbol: &str,
    interval: Interval,
) -> SourceResult<Observation> {
    if kline.len() < 6 {
        return Err(SourceError::malformed(format!(
            "kline has {} columns, expected at least 6",
            kline.len()
        )));
    }

    let timestamp = kline[0]
        .as_i64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| SourceError::malformed("kline open time is not a timestamp"))?;

    let fields: FieldMap = KLINE_FIELDS
        .iter()
        .enumerate()
        .map(|(i, name)| ((*name).to_string(), parse_f64_from_json(&kline[i + 1])))
        .collect();

    let required: Vec<String> = KLINE_FIELDS.iter().map(|f| (*f).to_string()).collect();

    Ok(Observation::new(symbol, timestamp, SOURCE_NAME, fields)
        .with_required_fields(&required)
        .truncate_to(interval.duration()))
}

/// Parses a number from a JSON value (handles both string and number formats).
fn parse_f64_from_json(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse::<f64>().ok().filter(|v| v.is_finite()),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
