//! The tool surface offered to downstream agents.
//!
//! Every transport (MCP Streamable HTTP, legacy SSE, REST) serves the same
//! [`ToolRegistry`]. The registry holds exactly the four proxy operations;
//! the upstream catalog itself is never listed here, only reachable through
//! `discover` and `execute`.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ToolRegistry                  │
//! │  discover │ execute │ batch_execute │ refresh│
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!                 RequestRouter (via ToolContext)
//! ```

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::RouterError;
use crate::router::{CallRequest, RequestRouter};

/// A tool that agents can list and call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name used in `tools/list`, `tools/call` and `POST /tools/{name}`.
    fn name(&self) -> &str;

    /// One-line description for agent discovery.
    fn description(&self) -> &str;

    /// JSON Schema of the tool's arguments (`type: "object"`).
    fn parameters_schema(&self) -> Value;

    /// Whether a successful result is already an MCP tool result from
    /// upstream and should be handed to the caller unchanged.
    fn passthrough_result(&self) -> bool {
        false
    }

    /// Run the tool. `params` is always a JSON object.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, RouterError>;
}

/// What a tool can reach while executing.
#[derive(Clone)]
pub struct ToolContext {
    router: Arc<RequestRouter>,
}

impl ToolContext {
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }
}

/// Listing entry for one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct DiscoverTool;

#[async_trait]
impl Tool for DiscoverTool {
    fn name(&self) -> &str {
        "discover"
    }

    fn description(&self) -> &str {
        "Find upstream operations relevant to a task. Returns names, descriptions, relevance scores and parameter schemas; call them with execute."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What you want to do, in natural language" },
                "limit": { "type": "integer", "minimum": 1, "description": "Maximum number of operations to return" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, RouterError> {
        let query = params["query"].as_str().unwrap_or("");
        let limit = match params.get("limit") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_i64()
                    .ok_or_else(|| RouterError::invalid("limit must be a positive integer"))?,
            ),
        };
        let results = ctx.router().discover(query, limit).await?;
        Ok(json!(results))
    }
}

pub struct ExecuteTool;

#[async_trait]
impl Tool for ExecuteTool {
    fn name(&self) -> &str {
        "execute"
    }

    fn description(&self) -> &str {
        "Invoke one upstream operation by name. Use discover first to find the name and its parameters."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operationName": { "type": "string", "description": "Operation name as returned by discover" },
                "arguments": { "type": "object", "description": "Arguments matching the operation's parameter schema" }
            },
            "required": ["operationName"]
        })
    }

    fn passthrough_result(&self) -> bool {
        true
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, RouterError> {
        let call = parse_call(params)?;
        ctx.router()
            .execute(&call.operation_name, call.arguments)
            .await
    }
}

pub struct BatchExecuteTool;

#[async_trait]
impl Tool for BatchExecuteTool {
    fn name(&self) -> &str {
        "batch_execute"
    }

    fn description(&self) -> &str {
        "Invoke several upstream operations in parallel. Each call succeeds or fails on its own; results come back in request order."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "calls": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "operationName": { "type": "string" },
                            "arguments": { "type": "object" }
                        },
                        "required": ["operationName"]
                    }
                }
            },
            "required": ["calls"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, RouterError> {
        let calls = match params.get("calls") {
            Some(Value::Array(items)) => items
                .iter()
                .cloned()
                .map(parse_call)
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(RouterError::invalid("calls must be an array")),
        };
        let outcomes = ctx.router().batch_execute(calls).await?;
        Ok(json!(outcomes))
    }
}

pub struct RefreshTool;

#[async_trait]
impl Tool for RefreshTool {
    fn name(&self) -> &str {
        "refresh"
    }

    fn description(&self) -> &str {
        "Re-sync the operation catalog from upstream now and report what changed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value, RouterError> {
        let summary = ctx.router().refresh().await;
        Ok(json!(summary))
    }
}

fn parse_call(params: Value) -> Result<CallRequest, RouterError> {
    if !params.is_object() {
        return Err(RouterError::invalid("each call must be an object"));
    }
    serde_json::from_value(params)
        .map_err(|e| RouterError::invalid(format!("malformed call: {}", e)))
}

/// Registry for the tools served downstream.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with the four proxy operations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DiscoverTool));
        registry.register(Box::new(ExecuteTool));
        registry.register(Box::new(BatchExecuteTool));
        registry.register(Box::new(RefreshTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn definitions(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_the_four_operations() {
        let registry = ToolRegistry::with_builtins();
        let names: Vec<&str> = registry.tools().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["discover", "execute", "batch_execute", "refresh"]);
        assert!(registry.find("search").is_none());
    }

    #[test]
    fn test_schemas_are_objects() {
        for info in ToolRegistry::with_builtins().definitions() {
            assert_eq!(info.parameters["type"], "object", "{}", info.name);
        }
    }

    #[test]
    fn test_parse_call_rejects_non_objects() {
        assert!(parse_call(json!("slack_post")).is_err());
        let call = parse_call(json!({"operationName": "slack_post", "arguments": {"text": "hi"}})).unwrap();
        assert_eq!(call.operation_name, "slack_post");
        assert_eq!(call.arguments["text"], "hi");
    }
}
