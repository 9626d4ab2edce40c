//! HTTP failure classification shared by the source adapters.

use mdc_core::SourceError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

/// Builds the shared HTTP client used by adapters.
///
/// # Errors
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Parses a `Retry-After` header given in seconds.
#[must_use]
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success status onto the source error taxonomy.
#[must_use]
pub fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    symbol: &str,
    body: &str,
) -> SourceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => match retry_after(headers) {
            Some(delay) => SourceError::rate_limited_for(delay),
            None => SourceError::rate_limited(),
        },
        StatusCode::NOT_FOUND => SourceError::not_found(symbol),
        s if s.is_server_error() => SourceError::transient(format!("HTTP {s}: {}", truncate(body))),
        s => SourceError::malformed(format!("HTTP {s}: {}", truncate(body))),
    }
}

/// Maps a transport-level failure onto the source error taxonomy.
#[must_use]
pub fn classify_transport(err: &reqwest::Error) -> SourceError {
    if err.is_decode() {
        SourceError::malformed(err.to_string())
    } else if err.is_timeout() {
        SourceError::transient(format!("request timed out: {err}"))
    } else {
        SourceError::transient(err.to_string())
    }
}

/// Sends a request, retrying once immediately if the connection could not be
/// established.
///
/// # Errors
/// Returns the classified transport error of the last attempt.
pub async fn send<F>(build: F) -> Result<Response, SourceError>
where
    F: Fn() -> RequestBuilder,
{
    match build().send().await {
        Ok(response) => Ok(response),
        Err(e) if e.is_connect() => {
            tracing::debug!(error = %e, "Connection failed, retrying once");
            build().send().await.map_err(|e| classify_transport(&e))
        }
        Err(e) => Err(classify_transport(&e)),
    }
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 200;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
