//! The service object that owns every component of a running proxy.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::catalog::{run_sync_loop, CatalogIndex};
use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::health::HealthReport;
use crate::models::{RebuildReason, RebuildReport, RebuildStatus};
use crate::router::RequestRouter;
use crate::sessions::SessionTable;
use crate::snapshot::SnapshotStore;
use crate::tools::{ToolContext, ToolRegistry};
use crate::upstream::http::HttpConnector;
use crate::upstream::{Connector, UpstreamClient};

/// One upstream connection, one catalog, one session table, shared by all
/// downstream transports.
pub struct ProxyContext {
    config: Arc<Config>,
    upstream: Arc<UpstreamClient>,
    index: Arc<CatalogIndex>,
    router: Arc<RequestRouter>,
    sessions: SessionTable,
    tools: Arc<ToolRegistry>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<RebuildReason>>>,
}

impl ProxyContext {
    /// Wire the components together. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Arc<Self> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let upstream = UpstreamClient::new(
            connector,
            config.upstream.supervisor_settings(),
            signals_tx,
        );
        let store = config.index.snapshot_path.clone().map(SnapshotStore::new);
        let index = Arc::new(CatalogIndex::new(
            Arc::clone(&upstream),
            embedder,
            store,
            config.embedding.batch_size,
        ));
        let router = Arc::new(RequestRouter::new(
            Arc::clone(&upstream),
            Arc::clone(&index),
            config.retrieval.clone(),
        ));

        Arc::new(Self {
            config: Arc::new(config),
            upstream,
            index,
            router,
            sessions: SessionTable::new(),
            tools: Arc::new(ToolRegistry::with_builtins()),
            signals: Mutex::new(Some(signals_rx)),
        })
    }

    /// Build a context talking HTTP to the configured aggregator.
    pub fn from_config(config: Config, api_key: String) -> Result<Arc<Self>> {
        let connector = HttpConnector::new(&config.upstream, api_key)?;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        Ok(Self::new(config, Arc::new(connector), embedder))
    }

    /// Seed the embedding cache from disk, start the rebuild driver, and
    /// begin connecting upstream. Calling it twice is a no-op.
    pub async fn start(&self) {
        let Some(signals) = self.signals.lock().take() else {
            return;
        };
        if let Err(e) = self.index.load_persisted().await {
            warn!(error = %format!("{:#}", e), "ignoring unreadable catalog snapshot");
        }
        tokio::spawn(run_sync_loop(Arc::clone(&self.index), signals));
        self.upstream.start();
    }

    pub async fn shutdown(&self) {
        self.upstream.shutdown().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.upstream
    }

    pub fn index(&self) -> &Arc<CatalogIndex> {
        &self.index
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn tool_context(&self) -> ToolContext {
        ToolContext::new(Arc::clone(&self.router))
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::project(
            self.upstream.state(),
            self.index.operation_count(),
            self.index.last_indexed_at(),
            self.sessions.counts(),
        )
    }
}

/// One-shot sync: connect, rebuild, persist, disconnect.
pub async fn run_sync(config: Config, api_key: String) -> Result<RebuildReport> {
    let connect_timeout = Duration::from_secs(config.upstream.request_timeout_secs);
    let ctx = ProxyContext::from_config(config, api_key)?;

    if let Err(e) = ctx.index.load_persisted().await {
        warn!(error = %format!("{:#}", e), "ignoring unreadable catalog snapshot");
    }
    ctx.upstream.start();
    if !ctx.upstream.wait_connected(connect_timeout).await {
        ctx.shutdown().await;
        bail!(
            "could not connect to upstream within {}s",
            connect_timeout.as_secs()
        );
    }

    let report = ctx.index.rebuild(RebuildReason::Startup).await;
    ctx.shutdown().await;

    if report.status == RebuildStatus::Failed {
        bail!("sync {}", report);
    }
    Ok(report)
}
