//! MCP Streamable HTTP client for the upstream aggregator.
//!
//! rmcp's client owns the wire: the initialize handshake, the session
//! header, JSON or event-stream response bodies, the server-push stream,
//! and ping replies. This module adapts one running rmcp client service to
//! [`UpstreamSession`].
//!
//! `notifications/tools/list_changed` arrives through [`EventForwarder`]
//! and becomes [`UpstreamEvent::CatalogChanged`]. When the service loop
//! ends on its own (transport error, push stream gone, session expired) the
//! watcher task reports [`UpstreamEvent::Closed`] exactly once.

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{
    CallToolRequestParams, ClientCapabilities, ClientInfo, Implementation, ProtocolVersion, Tool,
};
use rmcp::service::{NotificationContext, RunningServiceCancellationToken};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{ClientHandler, Peer, RoleClient, ServiceError, ServiceExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Connector, UpstreamEvent, UpstreamSession};
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::models::UpstreamOperation;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens [`HttpSession`]s against one aggregator URL.
pub struct HttpConnector {
    url: String,
    api_key: String,
    request_timeout: Duration,
    call_timeout: Duration,
}

impl HttpConnector {
    pub fn new(config: &UpstreamConfig, api_key: String) -> anyhow::Result<Self> {
        Ok(Self {
            url: config.url.clone(),
            api_key,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> Result<Arc<dyn UpstreamSession>, UpstreamError> {
        let transport = StreamableHttpClientTransport::from_config(
            StreamableHttpClientTransportConfig::with_uri(self.url.as_str())
                .auth_header(self.api_key.clone()),
        );
        let forwarder = EventForwarder {
            events: events.clone(),
        };

        let running = tokio::time::timeout(self.request_timeout, forwarder.serve(transport))
            .await
            .map_err(|_| UpstreamError::Timeout(self.request_timeout.as_secs()))?
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if let Some(server) = running.peer().peer_info() {
            info!(
                server = %server.server_info.name,
                protocol = %server.protocol_version,
                "upstream session initialized"
            );
        }

        let peer = running.peer().clone();
        let cancel = running.cancellation_token();
        let closing = Arc::new(AtomicBool::new(false));

        let watch_closing = Arc::clone(&closing);
        let watcher = tokio::spawn(async move {
            let outcome = running.waiting().await;
            if watch_closing.load(Ordering::Acquire) {
                debug!("upstream session closed locally");
                return;
            }
            match outcome {
                Ok(reason) => warn!(reason = ?reason, "upstream session ended"),
                Err(e) => warn!(error = %e, "upstream session task failed"),
            }
            let _ = events.send(UpstreamEvent::Closed);
        });

        Ok(Arc::new(HttpSession {
            peer,
            cancel: Mutex::new(Some(cancel)),
            closing,
            watcher: Mutex::new(Some(watcher)),
            request_timeout: self.request_timeout,
            call_timeout: self.call_timeout,
        }))
    }
}

/// Client-side handler: identifies toolgate and forwards list changes.
#[derive(Clone)]
struct EventForwarder {
    events: mpsc::UnboundedSender<UpstreamEvent>,
}

impl ClientHandler for EventForwarder {
    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        debug!("upstream announced a tool list change");
        let _ = self.events.send(UpstreamEvent::CatalogChanged);
        std::future::ready(())
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            meta: None,
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "toolgate".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
        }
    }
}

/// One initialized session with the aggregator.
pub struct HttpSession {
    peer: Peer<RoleClient>,
    cancel: Mutex<Option<RunningServiceCancellationToken>>,
    closing: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
    call_timeout: Duration,
}

impl HttpSession {
    fn stop(&self) {
        self.closing.store(true, Ordering::Release);
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }
}

#[async_trait]
impl UpstreamSession for HttpSession {
    async fn list_operations(&self) -> Result<Vec<UpstreamOperation>, UpstreamError> {
        let tools = tokio::time::timeout(self.request_timeout, self.peer.list_all_tools())
            .await
            .map_err(|_| UpstreamError::Timeout(self.request_timeout.as_secs()))?
            .map_err(upstream_error)?;
        Ok(tools.into_iter().map(to_operation).collect())
    }

    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError> {
        let params = CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments: call_arguments(arguments)?,
            task: None,
        };
        let result = tokio::time::timeout(self.call_timeout, self.peer.call_tool(params))
            .await
            .map_err(|_| UpstreamError::Timeout(self.call_timeout.as_secs()))?
            .map_err(upstream_error)?;
        serde_json::to_value(result)
            .map_err(|e| UpstreamError::Protocol(format!("unencodable tool result: {}", e)))
    }

    async fn close(&self) {
        self.stop();
        let watcher = self.watcher.lock().take();
        if let Some(handle) = watcher {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                debug!("upstream session close timed out");
            }
        }
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn upstream_error(err: ServiceError) -> UpstreamError {
    match err {
        ServiceError::McpError(e) => UpstreamError::Rpc {
            code: i64::from(e.code.0),
            message: e.message.into_owned(),
        },
        ServiceError::Timeout { timeout } => UpstreamError::Timeout(timeout.as_secs()),
        ServiceError::UnexpectedResponse => {
            UpstreamError::Protocol("unexpected response type".to_string())
        }
        other => UpstreamError::Transport(other.to_string()),
    }
}

fn to_operation(tool: Tool) -> UpstreamOperation {
    let schema = if tool.input_schema.is_empty() {
        json!({ "type": "object" })
    } else {
        Value::Object((*tool.input_schema).clone())
    };
    UpstreamOperation::new(tool.name, tool.description.unwrap_or_default(), schema)
}

fn call_arguments(arguments: Value) -> Result<Option<serde_json::Map<String, Value>>, UpstreamError> {
    match arguments {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(None),
        other => Err(UpstreamError::Protocol(format!(
            "tool arguments must be an object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{ErrorCode, ErrorData};

    #[test]
    fn test_to_operation_defaults_empty_schema() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "ping",
            "inputSchema": {}
        }))
        .unwrap();
        let op = to_operation(tool);
        assert_eq!(op.name, "ping");
        assert_eq!(op.description, "");
        assert_eq!(op.schema, json!({"type": "object"}));
    }

    #[test]
    fn test_to_operation_keeps_schema() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "github_create_issue",
            "description": "Open an issue",
            "inputSchema": {"type": "object", "properties": {"title": {"type": "string"}}}
        }))
        .unwrap();
        let op = to_operation(tool);
        assert_eq!(op.description, "Open an issue");
        assert_eq!(op.schema["properties"]["title"]["type"], "string");
    }

    #[test]
    fn test_call_arguments_shapes() {
        assert_eq!(call_arguments(Value::Null).unwrap(), None);
        assert_eq!(
            call_arguments(json!({"a": 1})).unwrap().unwrap()["a"],
            json!(1)
        );
        assert!(matches!(
            call_arguments(json!([1, 2])),
            Err(UpstreamError::Protocol(_))
        ));
    }

    #[test]
    fn test_service_errors_map_to_upstream_errors() {
        let rpc = upstream_error(ServiceError::McpError(ErrorData::new(
            ErrorCode::METHOD_NOT_FOUND,
            "no such tool",
            None,
        )));
        assert_eq!(
            rpc,
            UpstreamError::Rpc {
                code: -32601,
                message: "no such tool".into()
            }
        );
        assert!(upstream_error(ServiceError::TransportClosed).is_transport());
        assert_eq!(
            upstream_error(ServiceError::Timeout {
                timeout: Duration::from_secs(3)
            }),
            UpstreamError::Timeout(3)
        );
    }
}
