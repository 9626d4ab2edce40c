//! Deterministic in-process source.
//!
//! Replays a per-symbol script of responses and synthesizes complete rows
//! once a script runs out. Drives tests and `mdc backfill --dry-run`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mdc_core::{FieldMap, Observation, SourceAdapter, SourceError, SourceResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// One complete row per cadence step of the requested range.
    Generate,
    /// Exactly these rows.
    Rows(Vec<Observation>),
    Fail(SourceError),
    /// Never completes; exercises fetch timeouts.
    Hang,
}

/// A recorded `fetch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub at: tokio::time::Instant,
}

pub struct ScriptedSource {
    name: String,
    cadence: ChronoDuration,
    fields: Vec<String>,
    latency: Option<Duration>,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    unsupported: Mutex<HashSet<String>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl ScriptedSource {
    #[must_use]
    pub fn new(name: impl Into<String>, cadence: ChronoDuration) -> Self {
        Self {
            name: name.into(),
            cadence,
            fields: vec!["value".to_string()],
            latency: None,
            scripts: Mutex::new(HashMap::new()),
            unsupported: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Field names of generated rows.
    #[must_use]
    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Delay applied to every call before it answers.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues replies for `symbol`, consumed one per call.
    pub fn script(&self, symbol: &str, responses: impl IntoIterator<Item = ScriptedResponse>) {
        self.scripts
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .extend(responses);
    }

    /// Every call for `symbol` fails with `NotFound`.
    pub fn mark_unsupported(&self, symbol: &str) {
        self.unsupported.lock().insert(symbol.to_string());
    }

    #[must_use]
    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn calls_for(&self, symbol: &str) -> Vec<FetchCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Complete rows at every cadence step of `[start, end]`.
    #[must_use]
    pub fn generate(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Observation> {
        let mut rows = Vec::new();
        if self.cadence <= ChronoDuration::zero() {
            return rows;
        }
        let mut ts = start;
        while ts <= end {
            let fields: FieldMap = self
                .fields
                .iter()
                .map(|f| (f.clone(), Some(ts.timestamp() as f64)))
                .collect();
            rows.push(Observation::new(symbol, ts, self.name.clone(), fields));
            ts += self.cadence;
        }
        rows
    }

    fn next_response(&self, symbol: &str) -> ScriptedResponse {
        if self.unsupported.lock().contains(symbol) {
            return ScriptedResponse::Fail(SourceError::not_found(symbol));
        }
        self.scripts
            .lock()
            .get_mut(symbol)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedResponse::Generate)
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SourceResult<Vec<Observation>> {
        self.calls.lock().push(FetchCall {
            symbol: symbol.to_string(),
            start,
            end,
            at: tokio::time::Instant::now(),
        });

        let response = self.next_response(symbol);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match response {
            ScriptedResponse::Generate => Ok(self.generate(symbol, start, end)),
            ScriptedResponse::Rows(rows) => Ok(rows),
            ScriptedResponse::Fail(err) => Err(err),
            ScriptedResponse::Hang => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
        }
    }
}
