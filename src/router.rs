//! The four downstream operations.
//!
//! [`RequestRouter`] is transport-agnostic: the MCP bridge, the SSE
//! dispatcher and the REST routes all end up here through the tool
//! registry. Upstream and embedding failures are converted into
//! [`RouterError`] values and never escape as panics or task aborts.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::CatalogIndex;
use crate::config::RetrievalConfig;
use crate::embedding::embed_query;
use crate::error::{RouterError, UpstreamError};
use crate::models::{RebuildReason, RebuildStatus};
use crate::search::{rank, DiscoveredOperation};
use crate::upstream::UpstreamClient;

/// One call in a batch, or the arguments of `execute`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(default)]
    pub operation_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Outcome of one call in a batch.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallOutcome {
    pub operation_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallOutcome {
    fn from_result(operation_name: String, result: Result<Value, RouterError>) -> Self {
        match result {
            Ok(value) if is_error_result(&value) => {
                let message = error_text(&value);
                Self {
                    operation_name,
                    success: false,
                    result: Some(value),
                    error: Some(message),
                }
            }
            Ok(value) => Self {
                operation_name,
                success: true,
                result: Some(value),
                error: None,
            },
            Err(e) => Self {
                operation_name,
                success: false,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Result of a forced re-sync.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub status: RebuildStatus,
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub total: usize,
    pub connected: bool,
    pub message: String,
}

/// Dispatches the downstream operations onto the index and the upstream.
pub struct RequestRouter {
    upstream: Arc<UpstreamClient>,
    index: Arc<CatalogIndex>,
    retrieval: RetrievalConfig,
}

impl RequestRouter {
    pub fn new(
        upstream: Arc<UpstreamClient>,
        index: Arc<CatalogIndex>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            upstream,
            index,
            retrieval,
        }
    }

    fn ensure_connected(&self) -> Result<(), RouterError> {
        if self.upstream.is_connected() {
            Ok(())
        } else {
            Err(RouterError::NotReady(format!(
                "upstream is {}",
                self.upstream.state().label()
            )))
        }
    }

    /// Rank catalog operations against a natural-language query.
    pub async fn discover(
        &self,
        query: &str,
        limit: Option<i64>,
    ) -> Result<Vec<DiscoveredOperation>, RouterError> {
        if query.trim().is_empty() {
            return Err(RouterError::invalid("query must not be empty"));
        }
        let limit = resolve_limit(limit, &self.retrieval)?;

        self.ensure_connected()?;
        let snapshot = self
            .index
            .current_snapshot()
            .ok_or_else(|| RouterError::NotReady("catalog has not been indexed yet".into()))?;
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = embed_query(self.index.embedder().as_ref(), query)
            .await
            .map_err(|e| RouterError::Embedding(format!("{:#}", e)))?;

        let results: Vec<DiscoveredOperation> = rank(&snapshot, &query_vec, limit)
            .into_iter()
            .map(DiscoveredOperation::from)
            .collect();
        debug!(query, limit, hits = results.len(), "discover");
        Ok(results)
    }

    /// Forward one call upstream and return its result unmodified.
    pub async fn execute(
        &self,
        operation_name: &str,
        arguments: Value,
    ) -> Result<Value, RouterError> {
        if operation_name.trim().is_empty() {
            return Err(RouterError::invalid("operationName must not be empty"));
        }
        let arguments = normalize_arguments(arguments, "arguments")?;

        self.ensure_connected()?;
        let result = self.upstream.invoke(operation_name, arguments).await;
        if let Err(e) = &result {
            warn!(operation = operation_name, error = %e, "execute failed");
        }
        Ok(result?)
    }

    /// Run several calls concurrently. One call's failure never affects
    /// the others; outcomes are returned in input order.
    pub async fn batch_execute(
        &self,
        calls: Vec<CallRequest>,
    ) -> Result<Vec<CallOutcome>, RouterError> {
        if calls.is_empty() {
            return Err(RouterError::invalid("calls must not be empty"));
        }

        let mut validated = Vec::with_capacity(calls.len());
        for (i, call) in calls.into_iter().enumerate() {
            if call.operation_name.trim().is_empty() {
                return Err(RouterError::invalid(format!(
                    "calls[{}].operationName must not be empty",
                    i
                )));
            }
            let field = format!("calls[{}].arguments", i);
            let arguments = normalize_arguments(call.arguments, &field)?;
            validated.push((call.operation_name, arguments));
        }

        self.ensure_connected()?;

        let names: Vec<String> = validated.iter().map(|(name, _)| name.clone()).collect();
        let handles: Vec<_> = validated
            .into_iter()
            .map(|(name, arguments)| {
                let upstream = Arc::clone(&self.upstream);
                tokio::spawn(async move { upstream.invoke(&name, arguments).await })
            })
            .collect();

        let outcomes: Vec<CallOutcome> = join_all(handles)
            .await
            .into_iter()
            .zip(names)
            .map(|(joined, name)| {
                let result = match joined {
                    Ok(r) => r.map_err(RouterError::from),
                    Err(e) => Err(RouterError::Upstream(UpstreamError::Protocol(format!(
                        "call task failed: {}",
                        e
                    )))),
                };
                CallOutcome::from_result(name, result)
            })
            .collect();

        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(calls = outcomes.len(), failed, "batch executed");
        Ok(outcomes)
    }

    /// Force a catalog re-sync and report what changed.
    pub async fn refresh(&self) -> RefreshSummary {
        let report = self.index.rebuild(RebuildReason::Manual).await;
        RefreshSummary {
            status: report.status,
            added: report.added,
            removed: report.removed,
            unchanged: report.unchanged,
            total: report.total,
            connected: self.upstream.is_connected(),
            message: report.to_string(),
        }
    }
}

fn resolve_limit(limit: Option<i64>, retrieval: &RetrievalConfig) -> Result<usize, RouterError> {
    match limit {
        None => Ok(retrieval.default_limit.min(retrieval.max_limit)),
        Some(n) if n < 1 => Err(RouterError::invalid("limit must be a positive integer")),
        Some(n) => Ok(usize::try_from(n)
            .unwrap_or(usize::MAX)
            .min(retrieval.max_limit)),
    }
}

/// Arguments must be a JSON object; `null` is read as `{}`.
fn normalize_arguments(arguments: Value, field: &str) -> Result<Value, RouterError> {
    match arguments {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(arguments),
        _ => Err(RouterError::invalid(format!("{} must be an object", field))),
    }
}

fn is_error_result(value: &Value) -> bool {
    value.get("isError").and_then(|v| v.as_bool()) == Some(true)
}

/// Text of an `isError` tool result, joined from its text content blocks.
fn error_text(value: &Value) -> String {
    let text: Vec<&str> = value
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();
    if text.is_empty() {
        "operation reported an error".to_string()
    } else {
        text.join("\n")
    }
}
