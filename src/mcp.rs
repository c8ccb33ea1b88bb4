//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] to rmcp's [`ServerHandler`] so the four
//! proxy operations are served over MCP Streamable HTTP at `/mcp`.
//!
//! rmcp creates one bridge per session. Each bridge holds a
//! [`SessionLease`], so the session table tracks rmcp sessions exactly as
//! long as rmcp keeps their handler alive.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};

use crate::error::RouterError;
use crate::sessions::SessionLease;
use crate::tools::{ToolContext, ToolRegistry};

/// Bridges the tool registry to the MCP JSON-RPC protocol.
#[derive(Clone)]
pub struct McpBridge {
    tools: Arc<ToolRegistry>,
    ctx: ToolContext,
    lease: Option<Arc<SessionLease>>,
}

impl McpBridge {
    pub fn new(tools: Arc<ToolRegistry>, ctx: ToolContext, lease: Option<SessionLease>) -> Self {
        Self {
            tools,
            ctx,
            lease: lease.map(Arc::new),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.lease.as_deref().map(|l| l.id())
    }

    /// Convert a registry tool into an rmcp `Tool` descriptor.
    fn to_mcp_tool(tool: &dyn crate::tools::Tool) -> Tool {
        let schema_value = tool.parameters_schema();
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> = match schema_value {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };
        let read_only = matches!(tool.name(), "discover");

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(read_only)),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

/// Map a tool outcome onto an MCP tool result.
///
/// Upstream results from `execute` are passed through as-is when they
/// parse as a tool result. Invalid input is a protocol error; every other
/// failure is reported in-band with `isError: true`.
fn to_call_result(
    passthrough: bool,
    outcome: Result<serde_json::Value, RouterError>,
) -> Result<CallToolResult, McpError> {
    match outcome {
        Ok(value) => {
            if passthrough {
                if let Ok(result) = serde_json::from_value::<CallToolResult>(value.clone()) {
                    return Ok(result);
                }
            }
            let text = serde_json::to_string_pretty(&value).unwrap_or_default();
            Ok(CallToolResult::success(vec![Content::text(text)]))
        }
        Err(RouterError::InvalidInput(message)) => {
            Err(McpError::new(ErrorCode::INVALID_PARAMS, message, None))
        }
        Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "toolgate".to_string(),
                title: Some("Toolgate".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Toolgate fronts a large catalog of upstream operations. \
                 Call discover with a description of the task to find relevant operations, \
                 then execute (or batch_execute) them by name. \
                 Use refresh if an operation you expect is missing."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self.tools.find(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        let outcome = tool.execute(params, &self.ctx).await;
        to_call_result(tool.passthrough_result(), outcome)
    }
}
