//! JSON-RPC 2.0 framing for the legacy SSE transport.
//!
//! The `/mcp` endpoint and the upstream client speak through rmcp. The
//! SSE transport predates Streamable HTTP and frames its messages itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Newest revision an SSE client may ask for.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Revision advertised to SSE clients that do not ask for one.
pub const LEGACY_PROTOCOL_VERSION: &str = "2024-11-05";

/// Any inbound JSON-RPC message: request, notification, or response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// A request expects a response: it has both a method and an id.
    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.as_ref().is_some_and(|id| !id.is_null())
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && !self.is_request()
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
