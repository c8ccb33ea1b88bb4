//! Core data models used throughout Toolgate.
//!
//! These types represent the upstream operations, the embedded catalog
//! built from them, and the state shared between the supervisor, the index
//! and the health reporter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// One operation as listed by the upstream aggregator, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamOperation {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl UpstreamOperation {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }

    /// Text handed to the embedding provider for this operation.
    pub fn embedding_text(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }
}

/// An operation in a built catalog, with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
    pub embedding: Vec<f32>,
}

/// One immutable, fully-built version of the catalog.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub entries: Vec<CatalogEntry>,
    pub built_at: DateTime<Utc>,
    pub fingerprint: String,
}

impl CatalogSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Embedding dimensionality, taken from the first entry.
    pub fn dims(&self) -> usize {
        self.entries.first().map(|e| e.embedding.len()).unwrap_or(0)
    }
}

/// Upstream supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting(u32),
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting(_) => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting(attempt) => write!(f, "connecting (attempt {})", attempt),
            other => f.write_str(other.label()),
        }
    }
}

/// Why a catalog rebuild was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    Startup,
    Connected,
    Notification,
    Poll,
    Manual,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebuildReason::Startup => "startup",
            RebuildReason::Connected => "connected",
            RebuildReason::Notification => "notification",
            RebuildReason::Poll => "poll",
            RebuildReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Outcome class of a rebuild request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStatus {
    Rebuilt,
    Unchanged,
    SkippedDisconnected,
    SkippedInFlight,
    Failed,
}

/// Counts reported by a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildReport {
    pub status: RebuildStatus,
    pub reason: RebuildReason,
    /// Entries whose embedding was computed during this rebuild.
    pub added: usize,
    /// Names present in the previous snapshot but gone upstream.
    pub removed: usize,
    /// Entries whose embedding was reused.
    pub unchanged: usize,
    /// Entries in the catalog published after this request.
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RebuildReport {
    pub fn skipped(status: RebuildStatus, reason: RebuildReason, total: usize) -> Self {
        Self {
            status,
            reason,
            added: 0,
            removed: 0,
            unchanged: 0,
            total,
            error: None,
        }
    }

    pub fn failed(reason: RebuildReason, total: usize, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::skipped(RebuildStatus::Failed, reason, total)
        }
    }

    pub fn did_work(&self) -> bool {
        self.status == RebuildStatus::Rebuilt
    }
}

impl fmt::Display for RebuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            RebuildStatus::Rebuilt | RebuildStatus::Unchanged => write!(
                f,
                "added {}, removed {}, unchanged {} ({} operations indexed)",
                self.added, self.removed, self.unchanged, self.total
            ),
            RebuildStatus::SkippedDisconnected => {
                write!(f, "skipped: upstream is disconnected ({} operations indexed)", self.total)
            }
            RebuildStatus::SkippedInFlight => {
                write!(f, "skipped: a rebuild is already running ({} operations indexed)", self.total)
            }
            RebuildStatus::Failed => write!(
                f,
                "failed: {} ({} operations indexed)",
                self.error.as_deref().unwrap_or("unknown error"),
                self.total
            ),
        }
    }
}
