//! Legacy MCP HTTP+SSE transport.
//!
//! ```text
//! GET  /sse                      → event: endpoint  data: /messages?sessionId=<id>
//!                                  event: message   data: <JSON-RPC response>  …
//! POST /messages?sessionId=<id>  → 202 Accepted (response arrives on the stream)
//!                                → 404 if the session is unknown or closed
//! ```
//!
//! Each stream owns its [`SessionLease`] inside the response body, so the
//! session table entry disappears the moment the client goes away. One
//! worker task per session handles messages strictly in arrival order.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::Json;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::context::ProxyContext;
use crate::error::RouterError;
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcResponse, INVALID_PARAMS, INVALID_REQUEST,
    LEGACY_PROTOCOL_VERSION, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::server::{bad_request, not_found, AppError};
use crate::sessions::{SessionLease, TransportKind};
use crate::tools::{ToolContext, ToolRegistry};

const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Event stream of one SSE session. Dropping it closes the session.
pub struct SessionStream {
    events: BoxStream<'static, Result<Event, Infallible>>,
    _lease: SessionLease,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

/// Handler for `GET /sse`.
pub async fn handle_sse(
    State(ctx): State<Arc<ProxyContext>>,
) -> Sse<KeepAliveStream<SessionStream>> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<Value>();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Event>();
    let lease = ctx.sessions().open(TransportKind::Sse, Some(inbox_tx));

    let dispatcher = JsonRpcDispatcher::new(Arc::clone(ctx.tools()), ctx.tool_context());
    tokio::spawn(session_worker(
        dispatcher,
        inbox_rx,
        outbox_tx,
        lease.id().to_string(),
    ));

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?sessionId={}", lease.id()));
    let events = stream::once(async move { endpoint })
        .chain(UnboundedReceiverStream::new(outbox_rx))
        .map(Ok::<_, Infallible>)
        .boxed();

    Sse::new(SessionStream {
        events,
        _lease: lease,
    })
    .keep_alive(KeepAlive::new().interval(KEEP_ALIVE).text("ping"))
}

async fn session_worker(
    dispatcher: JsonRpcDispatcher,
    mut inbox: mpsc::UnboundedReceiver<Value>,
    outbox: mpsc::UnboundedSender<Event>,
    session_id: String,
) {
    while let Some(message) = inbox.recv().await {
        let Some(response) = dispatcher.handle(message).await else {
            continue;
        };
        let data = match serde_json::to_string(&response) {
            Ok(d) => d,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to encode response");
                continue;
            }
        };
        if outbox.send(Event::default().event("message").data(data)).is_err() {
            break;
        }
    }
    debug!(session_id = %session_id, "sse session worker stopped");
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Handler for `POST /messages?sessionId=…`.
pub async fn handle_message(
    State(ctx): State<Arc<ProxyContext>>,
    Query(query): Query<MessageQuery>,
    Json(message): Json<Value>,
) -> Result<StatusCode, AppError> {
    let session_id = query
        .session_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("sessionId query parameter is required"))?;

    let inbox = ctx
        .sessions()
        .inbox(&session_id)
        .ok_or_else(|| not_found("session not found"))?;
    inbox
        .send(message)
        .map_err(|_| not_found("session not found"))?;

    Ok(StatusCode::ACCEPTED)
}

/// Answers MCP JSON-RPC messages from the tool registry.
#[derive(Clone)]
pub struct JsonRpcDispatcher {
    tools: Arc<ToolRegistry>,
    ctx: ToolContext,
}

impl JsonRpcDispatcher {
    pub fn new(tools: Arc<ToolRegistry>, ctx: ToolContext) -> Self {
        Self { tools, ctx }
    }

    /// Handle one inbound message. Notifications and responses yield `None`.
    pub async fn handle(&self, raw: Value) -> Option<JsonRpcResponse> {
        if raw.is_array() {
            return Some(JsonRpcResponse::error(
                Value::Null,
                INVALID_REQUEST,
                "batch requests are not supported",
            ));
        }
        let msg: JsonRpcMessage = match serde_json::from_value(raw) {
            Ok(m) => m,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    INVALID_REQUEST,
                    format!("invalid request: {}", e),
                ))
            }
        };
        if !msg.is_request() {
            if let Some(method) = msg.method.as_deref() {
                debug!(method, "sse notification");
            }
            return None;
        }

        let id = msg.id.clone().unwrap_or(Value::Null);
        let params = msg.params.unwrap_or(Value::Null);
        let outcome = match msg.method.as_deref().unwrap_or_default() {
            "initialize" => Ok(self.initialize(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => self.call_tool(params).await,
            other => Err(rpc_error(
                METHOD_NOT_FOUND,
                format!("method not found: {}", other),
            )),
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse {
                jsonrpc: "2.0",
                id,
                result: None,
                error: Some(error),
            },
        })
    }

    fn initialize(&self, params: &Value) -> Value {
        let requested = params["protocolVersion"].as_str();
        let version = match requested {
            Some(v) if v == PROTOCOL_VERSION || v == LEGACY_PROTOCOL_VERSION => v,
            _ => LEGACY_PROTOCOL_VERSION,
        };
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": "toolgate",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .definitions()
            .into_iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.parameters,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn call_tool(&self, params: Value) -> Result<Value, JsonRpcError> {
        let name = params["name"]
            .as_str()
            .ok_or_else(|| rpc_error(INVALID_PARAMS, "tools/call requires a tool name"))?;
        let tool = self
            .tools
            .find(name)
            .ok_or_else(|| rpc_error(INVALID_PARAMS, format!("unknown tool: {}", name)))?;

        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(_) => return Err(rpc_error(INVALID_PARAMS, "arguments must be an object")),
        };

        match tool.execute(arguments, &self.ctx).await {
            Ok(value) if tool.passthrough_result() && value["content"].is_array() => Ok(value),
            Ok(value) => {
                let text = serde_json::to_string_pretty(&value).unwrap_or_default();
                Ok(text_result(text, false))
            }
            Err(RouterError::InvalidInput(message)) => Err(rpc_error(INVALID_PARAMS, message)),
            Err(e) => Ok(text_result(e.to_string(), true)),
        }
    }
}

fn rpc_error(code: i64, message: impl Into<String>) -> JsonRpcError {
    JsonRpcError {
        code,
        message: message.into(),
        data: None,
    }
}

fn text_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogIndex;
    use crate::config::RetrievalConfig;
    use crate::embedding::EmbeddingProvider;
    use crate::error::UpstreamError;
    use crate::router::RequestRouter;
    use crate::upstream::{Connector, SupervisorSettings, UpstreamClient, UpstreamEvent, UpstreamSession};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(
            &self,
            _events: mpsc::UnboundedSender<UpstreamEvent>,
        ) -> Result<Arc<dyn UpstreamSession>, UpstreamError> {
            Err(UpstreamError::Transport("unreachable".into()))
        }
    }

    struct ZeroEmbedder;

    #[async_trait]
    impl EmbeddingProvider for ZeroEmbedder {
        fn model_name(&self) -> &str {
            "zero"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0, 0.0]).collect())
        }
    }

    fn dispatcher() -> JsonRpcDispatcher {
        let (tx, _rx) = mpsc::unbounded_channel();
        let upstream = UpstreamClient::new(Arc::new(Unreachable), SupervisorSettings::default(), tx);
        let index = Arc::new(CatalogIndex::new(
            Arc::clone(&upstream),
            Arc::new(ZeroEmbedder),
            None,
            8,
        ));
        let router = Arc::new(RequestRouter::new(upstream, index, RetrievalConfig::default()));
        JsonRpcDispatcher::new(
            Arc::new(ToolRegistry::with_builtins()),
            ToolContext::new(router),
        )
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let d = dispatcher();
        let resp = d
            .handle(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                           "params": {"protocolVersion": "1999-01-01"}}))
            .await
            .unwrap();
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["result"]["protocolVersion"], LEGACY_PROTOCOL_VERSION);
        assert_eq!(v["result"]["serverInfo"]["name"], "toolgate");
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let d = dispatcher();
        assert!(d
            .handle(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_tools_list_has_four_tools() {
        let d = dispatcher();
        let resp = d
            .handle(json!({"jsonrpc": "2.0", "id": "a", "method": "tools/list"}))
            .await
            .unwrap();
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["id"], "a");
        assert_eq!(v["result"]["tools"].as_array().unwrap().len(), 4);
        assert!(v["result"]["tools"][0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let d = dispatcher();
        let resp = d
            .handle(json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"}))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_discover_is_invalid_params() {
        let d = dispatcher();
        let resp = d
            .handle(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                           "params": {"name": "discover", "arguments": {"query": "  "}}}))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_discover_while_disconnected_is_error_result() {
        let d = dispatcher();
        let resp = d
            .handle(json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call",
                           "params": {"name": "discover", "arguments": {"query": "post to slack"}}}))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("not ready"));
    }
}
