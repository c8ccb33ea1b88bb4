//! Health projection for external polling.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::ConnectionState;
use crate::sessions::SessionCounts;

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `"ok"` while the upstream is connected, `"disconnected"` otherwise.
    pub status: String,
    /// Supervisor state label (`connected`, `connecting`, …).
    pub connection: String,
    pub operation_count: usize,
    /// RFC 3339 time of the last published rebuild.
    pub last_indexed_at: Option<String>,
    pub session_counts: SessionCounts,
    pub version: String,
}

impl HealthReport {
    pub fn project(
        state: ConnectionState,
        operation_count: usize,
        last_indexed_at: Option<DateTime<Utc>>,
        session_counts: SessionCounts,
    ) -> Self {
        let status = if state.is_connected() {
            "ok"
        } else {
            "disconnected"
        };
        Self {
            status: status.to_string(),
            connection: state.label().to_string(),
            operation_count,
            last_indexed_at: last_indexed_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            session_counts,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Fetch `/health` from a running proxy at `base_url`.
pub async fn fetch_health(base_url: &str) -> Result<HealthReport> {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("toolgate is not reachable at {}", url))?
        .error_for_status()?;
    Ok(resp.json().await?)
}
