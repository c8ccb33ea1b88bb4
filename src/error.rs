//! Typed errors at the component seams.
//!
//! Application plumbing (config, CLI, startup, persistence) uses `anyhow`.
//! The errors here cross component boundaries and are matched on: the
//! router maps them onto JSON-RPC and HTTP error codes.

use thiserror::Error;

/// Failure talking to the upstream aggregator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpstreamError {
    /// No live session; the supervisor is (re)connecting.
    #[error("upstream is not connected")]
    NotConnected,
    /// The connection itself failed (network error, expired session).
    #[error("upstream transport error: {0}")]
    Transport(String),
    /// A single request ran past its deadline; the session may still be fine.
    #[error("upstream request timed out after {0}s")]
    Timeout(u64),
    /// The aggregator answered with a JSON-RPC error.
    #[error("upstream error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// The aggregator answered with something we could not interpret.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl UpstreamError {
    pub fn is_transport(&self) -> bool {
        matches!(self, UpstreamError::Transport(_) | UpstreamError::NotConnected)
    }
}

/// Failure of one of the four downstream operations.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

impl RouterError {
    pub fn invalid(message: impl Into<String>) -> Self {
        RouterError::InvalidInput(message.into())
    }

    /// Machine-readable code used in REST error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::NotReady(_) => "not_ready",
            RouterError::InvalidInput(_) => "bad_request",
            RouterError::Upstream(_) => "upstream_error",
            RouterError::Embedding(_) => "embedding_error",
        }
    }

    /// JSON-RPC error code used by the streaming transports.
    pub fn rpc_code(&self) -> i64 {
        match self {
            RouterError::InvalidInput(_) => -32602,
            RouterError::NotReady(_) => -32002,
            RouterError::Upstream(UpstreamError::Rpc { code, .. }) => *code,
            RouterError::Upstream(_) | RouterError::Embedding(_) => -32603,
        }
    }
}
