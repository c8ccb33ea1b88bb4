//! Catalog index: fingerprinting, incremental re-embedding, and snapshot
//! publication.
//!
//! # Rebuild Pipeline
//!
//! ```text
//! list_operations ─▶ dedupe ─▶ fingerprint ─┬─ same as published ─▶ unchanged
//!                                           │
//!                                           └─ differs ─▶ cache lookup ─▶ embed misses (batched)
//!                                                                      ─▶ publish Arc ─▶ persist
//! ```
//!
//! The embedding cache is keyed by `(name, description)`. A schema-only
//! change therefore produces a new fingerprint and a new snapshot, but no
//! embedding call. The cache is rebuilt for every rebuild from the previous
//! snapshot (in memory, or the persisted file after a cold start) and
//! dropped afterwards.
//!
//! Only one rebuild runs at a time. A request arriving while one is in
//! flight is dropped, not queued: the running rebuild already reads the
//! latest upstream catalog, and the poll timer catches anything later.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::embedding::EmbeddingProvider;
use crate::models::{
    CatalogEntry, CatalogSnapshot, RebuildReason, RebuildReport, RebuildStatus, UpstreamOperation,
};
use crate::snapshot::SnapshotStore;
use crate::upstream::UpstreamClient;

const IDLE: u8 = 0;
const REBUILDING: u8 = 1;

/// Order-independent, schema-sensitive digest of an upstream catalog.
///
/// Entries are sorted by name and rendered as `name|description|schema`,
/// one per line; the SHA-256 of the joined text is returned as hex.
pub fn fingerprint(operations: &[UpstreamOperation]) -> String {
    let mut sorted: Vec<&UpstreamOperation> = operations.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let lines: Vec<String> = sorted
        .iter()
        .map(|op| {
            let schema = serde_json::to_string(&op.schema).unwrap_or_default();
            format!("{}|{}|{}", op.name, op.description, schema)
        })
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// `(name, description) → embedding`, seeded from a previous snapshot.
struct EmbeddingCache {
    vectors: HashMap<(String, String), Vec<f32>>,
}

impl EmbeddingCache {
    /// Only vectors of `dims` length are kept (any length when `dims` is 0),
    /// so a model change never mixes dimensionalities.
    fn seeded(previous: Option<&CatalogSnapshot>, dims: usize) -> Self {
        let vectors = previous
            .map(|snap| {
                snap.entries
                    .iter()
                    .filter(|e| !e.embedding.is_empty())
                    .filter(|e| dims == 0 || e.embedding.len() == dims)
                    .map(|e| ((e.name.clone(), e.description.clone()), e.embedding.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Self { vectors }
    }

    fn take(&mut self, name: &str, description: &str) -> Option<Vec<f32>> {
        self.vectors
            .remove(&(name.to_string(), description.to_string()))
    }
}

/// Marks the index as rebuilding; returns it to idle when dropped.
struct RebuildGuard<'a> {
    phase: &'a AtomicU8,
}

impl<'a> RebuildGuard<'a> {
    fn acquire(phase: &'a AtomicU8) -> Option<Self> {
        phase
            .compare_exchange(IDLE, REBUILDING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { phase })
    }
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(IDLE, Ordering::Release);
    }
}

/// Owns the published catalog snapshot and rebuilds it from upstream.
pub struct CatalogIndex {
    upstream: Arc<UpstreamClient>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Option<SnapshotStore>,
    batch_size: usize,
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
    /// Persisted snapshot read at startup; used only to seed the first
    /// rebuild's embedding cache.
    seed: Mutex<Option<Arc<CatalogSnapshot>>>,
    phase: AtomicU8,
}

impl CatalogIndex {
    pub fn new(
        upstream: Arc<UpstreamClient>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Option<SnapshotStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            upstream,
            embedder,
            store,
            batch_size: batch_size.max(1),
            current: RwLock::new(None),
            seed: Mutex::new(None),
            phase: AtomicU8::new(IDLE),
        }
    }

    /// Read the persisted snapshot, if any, as the cold-start cache seed.
    ///
    /// Returns the number of entries found. A corrupt file is an error; the
    /// caller may log it and start with an empty cache.
    pub async fn load_persisted(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let Some(snapshot) = store.load().await? else {
            return Ok(0);
        };
        let count = snapshot.len();
        info!(
            path = %store.path().display(),
            entries = count,
            "loaded persisted catalog snapshot"
        );
        *self.seed.lock() = Some(Arc::new(snapshot));
        Ok(count)
    }

    /// The published snapshot, if a rebuild has ever completed.
    pub fn current_snapshot(&self) -> Option<Arc<CatalogSnapshot>> {
        self.current.read().clone()
    }

    pub fn operation_count(&self) -> usize {
        self.current.read().as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub fn last_indexed_at(&self) -> Option<DateTime<Utc>> {
        self.current.read().as_ref().map(|s| s.built_at)
    }

    pub fn is_rebuilding(&self) -> bool {
        self.phase.load(Ordering::Acquire) == REBUILDING
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Bring the published snapshot in line with the upstream catalog.
    ///
    /// Never fails: errors are reported in the returned [`RebuildReport`]
    /// and the previously published snapshot stays in place.
    pub async fn rebuild(&self, reason: RebuildReason) -> RebuildReport {
        if !self.upstream.is_connected() {
            debug!(%reason, "rebuild skipped: upstream disconnected");
            return RebuildReport::skipped(
                RebuildStatus::SkippedDisconnected,
                reason,
                self.operation_count(),
            );
        }

        let Some(_guard) = RebuildGuard::acquire(&self.phase) else {
            debug!(%reason, "rebuild skipped: another rebuild is in flight");
            return RebuildReport::skipped(
                RebuildStatus::SkippedInFlight,
                reason,
                self.operation_count(),
            );
        };

        let report = match self.rebuild_exclusive(reason).await {
            Ok(report) => report,
            Err(e) => RebuildReport::failed(reason, self.operation_count(), format!("{:#}", e)),
        };

        match report.status {
            RebuildStatus::Rebuilt => info!(
                %reason,
                added = report.added,
                removed = report.removed,
                unchanged = report.unchanged,
                total = report.total,
                "catalog rebuilt"
            ),
            RebuildStatus::Failed => warn!(
                %reason,
                error = report.error.as_deref().unwrap_or_default(),
                "catalog rebuild failed"
            ),
            _ => debug!(%reason, total = report.total, "catalog unchanged"),
        }
        report
    }

    async fn rebuild_exclusive(&self, reason: RebuildReason) -> Result<RebuildReport> {
        let listed = self.upstream.list_operations().await?;
        let operations = dedupe(listed);
        let fingerprint = fingerprint(&operations);

        let current = self.current_snapshot();
        if let Some(snap) = &current {
            if snap.fingerprint == fingerprint && !snap.is_empty() {
                return Ok(RebuildReport {
                    status: RebuildStatus::Unchanged,
                    reason,
                    added: 0,
                    removed: 0,
                    unchanged: snap.len(),
                    total: snap.len(),
                    error: None,
                });
            }
        }

        let previous = current.or_else(|| self.seed.lock().clone());
        let mut cache = EmbeddingCache::seeded(previous.as_deref(), self.embedder.dims());

        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(operations.len());
        let mut misses: Vec<usize> = Vec::new();
        for (i, op) in operations.iter().enumerate() {
            let hit = cache.take(&op.name, &op.description);
            if hit.is_none() {
                misses.push(i);
            }
            vectors.push(hit);
        }
        let unchanged = operations.len() - misses.len();

        for batch in misses.chunks(self.batch_size) {
            let texts: Vec<String> = batch
                .iter()
                .map(|&i| operations[i].embedding_text())
                .collect();
            let embedded = self.embedder.embed(&texts).await?;
            if embedded.len() != texts.len() {
                bail!(
                    "embedding provider returned {} vectors for {} texts",
                    embedded.len(),
                    texts.len()
                );
            }
            for (&i, vector) in batch.iter().zip(embedded) {
                vectors[i] = Some(vector);
            }
        }

        let mut entries = Vec::with_capacity(operations.len());
        let mut dims: Option<usize> = None;
        for (op, vector) in operations.into_iter().zip(vectors) {
            let Some(embedding) = vector else {
                bail!("no embedding produced for '{}'", op.name);
            };
            match dims {
                None => dims = Some(embedding.len()),
                Some(d) if d != embedding.len() => bail!(
                    "embedding for '{}' has {} dims, expected {}",
                    op.name,
                    embedding.len(),
                    d
                ),
                Some(_) => {}
            }
            entries.push(CatalogEntry {
                name: op.name,
                description: op.description,
                parameter_schema: op.schema,
                embedding,
            });
        }

        let removed = match &previous {
            Some(prev) => {
                let names: HashSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();
                prev.entries
                    .iter()
                    .filter(|e| !names.contains(e.name.as_str()))
                    .count()
            }
            None => 0,
        };

        let snapshot = Arc::new(CatalogSnapshot {
            entries,
            built_at: Utc::now(),
            fingerprint,
        });
        let total = snapshot.len();

        *self.current.write() = Some(Arc::clone(&snapshot));
        self.seed.lock().take();

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&snapshot).await {
                warn!(error = %format!("{:#}", e), "failed to persist catalog snapshot");
            }
        }

        Ok(RebuildReport {
            status: RebuildStatus::Rebuilt,
            reason,
            added: total - unchanged,
            removed,
            unchanged,
            total,
            error: None,
        })
    }
}

/// Keep the first occurrence of every name.
fn dedupe(operations: Vec<UpstreamOperation>) -> Vec<UpstreamOperation> {
    let mut seen = HashSet::new();
    operations
        .into_iter()
        .filter(|op| {
            let first = seen.insert(op.name.clone());
            if !first {
                warn!(name = %op.name, "duplicate upstream operation name, keeping the first");
            }
            first
        })
        .collect()
}

/// Drive rebuilds from supervisor signals until the channel closes.
///
/// Each signal spawns its own rebuild; overlapping ones are dropped by the
/// index's guard.
pub async fn run_sync_loop(
    index: Arc<CatalogIndex>,
    mut signals: mpsc::UnboundedReceiver<RebuildReason>,
) {
    while let Some(reason) = signals.recv().await {
        let index = Arc::clone(&index);
        tokio::spawn(async move {
            index.rebuild(reason).await;
        });
    }
    debug!("rebuild signal channel closed");
}
