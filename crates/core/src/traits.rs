use crate::error::SourceResult;
use crate::types::Observation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Uniform fetch interface over one upstream data provider.
///
/// Adapters classify every failure into `SourceError` and leave retry
/// policy to the caller. At most one immediate internal retry is allowed
/// for connection-level failures.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Rate limit key of this source.
    fn name(&self) -> &str;

    /// Fetches observations for `symbol` in the inclusive range `[start, end]`.
    ///
    /// An empty vector means the upstream has no data for the range.
    async fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SourceResult<Vec<Observation>>;
}
