//! Ranking over a published catalog snapshot.
//!
//! # Scoring Algorithm
//!
//! 1. Score every entry: cosine similarity between the query vector and the
//!    entry's embedding (0.0 when either vector has zero magnitude).
//! 2. Sort by score (desc). The sort is stable, so equal scores keep
//!    catalog order.
//! 3. Truncate to `limit` (at least one result when the catalog is non-empty).
//!
//! [`rank`] is a pure function over one snapshot value. Callers obtain the
//! snapshot from [`CatalogIndex::current_snapshot`](crate::catalog::CatalogIndex::current_snapshot)
//! and may rank while a rebuild publishes the next one.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;

use crate::embedding::{cosine_similarity, embed_query, EmbeddingProvider};
use crate::models::CatalogSnapshot;

/// One ranked catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedOperation {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
    /// Raw cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// The shape returned to downstream callers by `discover`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredOperation {
    pub name: String,
    pub description: String,
    /// Similarity clamped to `[0, 1]` and rounded to 4 decimals.
    pub relevance: f64,
    pub parameter_schema: Value,
}

impl From<RankedOperation> for DiscoveredOperation {
    fn from(r: RankedOperation) -> Self {
        Self {
            relevance: relevance(r.score),
            name: r.name,
            description: r.description,
            parameter_schema: r.parameter_schema,
        }
    }
}

/// Rank every entry of `snapshot` against `query`.
pub fn rank(snapshot: &CatalogSnapshot, query: &[f32], limit: usize) -> Vec<RankedOperation> {
    let limit = limit.max(1);

    let mut scored: Vec<(usize, f32)> = snapshot
        .entries
        .iter()
        .enumerate()
        .map(|(i, entry)| (i, cosine_similarity(query, &entry.embedding)))
        .collect();

    // `sort_by` is stable: ties stay in catalog order.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(limit);

    scored
        .into_iter()
        .map(|(i, score)| {
            let entry = &snapshot.entries[i];
            RankedOperation {
                name: entry.name.clone(),
                description: entry.description.clone(),
                parameter_schema: entry.parameter_schema.clone(),
                score,
            }
        })
        .collect()
}

/// Map a raw similarity onto the `[0, 1]` relevance reported downstream.
pub fn relevance(score: f32) -> f64 {
    let clamped = (score as f64).clamp(0.0, 1.0);
    (clamped * 10_000.0).round() / 10_000.0
}

/// Run a search against a snapshot loaded from disk and print the results.
///
/// This is the offline path used by `toolgate search`; the running proxy
/// goes through [`RequestRouter::discover`](crate::router::RequestRouter::discover).
pub async fn run_search(
    snapshot: &CatalogSnapshot,
    provider: &dyn EmbeddingProvider,
    query: &str,
    limit: usize,
) -> Result<()> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    if snapshot.is_empty() {
        println!("No results.");
        return Ok(());
    }

    let query_vec = embed_query(provider, query).await?;
    let results = rank(snapshot, &query_vec, limit);

    for (i, r) in results.iter().enumerate() {
        println!("{}. [{:.4}] {}", i + 1, relevance(r.score), r.name);
        if !r.description.is_empty() {
            println!("    {}", r.description);
        }
    }

    Ok(())
}
