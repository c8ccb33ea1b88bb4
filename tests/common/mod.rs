#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::Instant;

use toolgate::catalog::CatalogIndex;
use toolgate::embedding::EmbeddingProvider;
use toolgate::error::UpstreamError;
use toolgate::models::{RebuildReason, UpstreamOperation};
use toolgate::snapshot::SnapshotStore;
use toolgate::upstream::{Connector, SupervisorSettings, UpstreamClient, UpstreamEvent, UpstreamSession};

pub fn op(name: &str, description: &str) -> UpstreamOperation {
    UpstreamOperation::new(name, description, json!({"type": "object"}))
}

pub fn sample_catalog() -> Vec<UpstreamOperation> {
    vec![
        op("github_create_issue", "Open a new issue in a GitHub repository"),
        op("weather_forecast", "Get the weather forecast for a city"),
        op("gmail_send", "Send an email message"),
    ]
}

#[derive(Default)]
struct AggregatorState {
    catalog: Vec<UpstreamOperation>,
    refuse_connects: u32,
    connect_times: Vec<Instant>,
    events: Option<mpsc::UnboundedSender<UpstreamEvent>>,
    failing: HashSet<String>,
    reporting_errors: HashSet<String>,
    invocations: Vec<String>,
}

/// Scriptable stand-in for the upstream aggregator.
#[derive(Clone, Default)]
pub struct FakeAggregator {
    state: Arc<Mutex<AggregatorState>>,
}

impl FakeAggregator {
    pub fn new(catalog: Vec<UpstreamOperation>) -> Self {
        let agg = Self::default();
        agg.state.lock().catalog = catalog;
        agg
    }

    pub fn set_catalog(&self, catalog: Vec<UpstreamOperation>) {
        self.state.lock().catalog = catalog;
    }

    pub fn update(&self, f: impl FnOnce(&mut Vec<UpstreamOperation>)) {
        f(&mut self.state.lock().catalog);
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_connects(&self, n: u32) {
        self.state.lock().refuse_connects = n;
    }

    /// Calls to `name` fail with an RPC error.
    pub fn fail_calls_to(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    /// Calls to `name` succeed at the transport level but carry `isError`.
    pub fn report_error_from(&self, name: &str) {
        self.state.lock().reporting_errors.insert(name.to_string());
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connect_times.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connect_times.len()
    }

    pub fn invocations(&self) -> Vec<String> {
        self.state.lock().invocations.clone()
    }

    /// Push an event on the most recent session.
    pub fn push(&self, event: UpstreamEvent) {
        if let Some(tx) = &self.state.lock().events {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl Connector for FakeAggregator {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> Result<Arc<dyn UpstreamSession>, UpstreamError> {
        let mut state = self.state.lock();
        state.connect_times.push(Instant::now());
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(UpstreamError::Transport("connection refused".into()));
        }
        state.events = Some(events);
        Ok(Arc::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<AggregatorState>>,
}

#[async_trait]
impl UpstreamSession for FakeSession {
    async fn list_operations(&self) -> Result<Vec<UpstreamOperation>, UpstreamError> {
        Ok(self.state.lock().catalog.clone())
    }

    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError> {
        let mut state = self.state.lock();
        state.invocations.push(name.to_string());
        if state.failing.contains(name) {
            return Err(UpstreamError::Rpc {
                code: -32000,
                message: format!("{} exploded", name),
            });
        }
        if state.reporting_errors.contains(name) {
            return Ok(json!({
                "content": [{"type": "text", "text": "rate limit exceeded"}],
                "isError": true
            }));
        }
        Ok(json!({
            "content": [{"type": "text", "text": format!("{} ok", name)}],
            "structuredContent": arguments
        }))
    }
}

const KEYWORDS: [&str; 3] = ["issue", "weather", "email"];

/// Deterministic embedder: one dimension per keyword, plus a small bias so
/// no vector is zero. Counts every text it embeds.
#[derive(Default)]
pub struct KeywordEmbedder {
    calls: AtomicUsize,
    texts: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keywords"
    }

    fn dims(&self) -> usize {
        KEYWORDS.len()
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                KEYWORDS
                    .iter()
                    .map(|k| if lower.contains(k) { 1.0 } else { 0.05 })
                    .collect()
            })
            .collect())
    }
}

/// Wraps [`KeywordEmbedder`]; every call parks until [`release`](Self::release).
pub struct GatedEmbedder {
    inner: Arc<KeywordEmbedder>,
    entered: Notify,
    gate: Semaphore,
}

impl GatedEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: KeywordEmbedder::new(),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        })
    }

    /// Resolves once some call is parked at the gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.gate.add_permits(16);
    }

    pub fn inner(&self) -> &KeywordEmbedder {
        &self.inner
    }
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.entered.notify_one();
        let _permit = self.gate.acquire().await?;
        self.inner.embed(texts).await
    }
}

pub struct Harness {
    pub upstream: Arc<UpstreamClient>,
    pub index: Arc<CatalogIndex>,
    pub signals: mpsc::UnboundedReceiver<RebuildReason>,
}

/// Wire a supervisor and an index over `agg` without connecting.
pub fn harness(
    agg: &FakeAggregator,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Option<SnapshotStore>,
) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let upstream = UpstreamClient::new(Arc::new(agg.clone()), SupervisorSettings::default(), tx);
    let index = Arc::new(CatalogIndex::new(Arc::clone(&upstream), embedder, store, 2));
    Harness {
        upstream,
        index,
        signals: rx,
    }
}

/// Poll `cond` every 10ms until it holds or five seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
