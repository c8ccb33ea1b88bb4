//! HTTP server hosting every downstream transport.
//!
//! One axum listener serves all protocols; they share one
//! [`ProxyContext`] and therefore one upstream connection and one catalog.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `*`    | `/mcp` | MCP Streamable HTTP (rmcp) |
//! | `GET`  | `/sse` | Legacy MCP SSE stream; opens a session |
//! | `POST` | `/messages?sessionId=…` | Legacy MCP SSE message endpoint |
//! | `GET`  | `/tools/list` | List the four tools with schemas |
//! | `POST` | `/tools/{name}` | Call a tool (session-less JSON) |
//! | `GET`  | `/health` | Health projection |
//!
//! # Error Contract
//!
//! REST errors use one body shape:
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "not ready: upstream is reconnecting" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (503),
//! `upstream_error` (502), `embedding_error` (500). A request to `/mcp`
//! carrying an unknown `mcp-session-id` also gets the 404 body.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients and cross-origin MCP tool calls.

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::context::ProxyContext;
use crate::error::RouterError;
use crate::health::HealthReport;
use crate::mcp::McpBridge;
use crate::sessions::TransportKind;
use crate::sse::{handle_message, handle_sse};
use crate::tools::ToolInfo;

const MCP_SESSION_HEADER: &str = "mcp-session-id";

/// Build the router with every transport mounted.
pub fn build_app(ctx: Arc<ProxyContext>) -> Router {
    let factory_ctx = Arc::clone(&ctx);
    let mcp_service = StreamableHttpService::new(
        move || {
            let lease = factory_ctx
                .sessions()
                .open(TransportKind::StreamableHttp, None);
            Ok(McpBridge::new(
                Arc::clone(factory_ctx.tools()),
                factory_ctx.tool_context(),
                Some(lease),
            ))
        },
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mcp: Router<Arc<ProxyContext>> = Router::new()
        .nest_service("/mcp", mcp_service)
        .layer(middleware::from_fn(unknown_session_not_found));

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/sse", get(handle_sse))
        .route("/messages", post(handle_message))
        .merge(mcp)
        .layer(cors)
        .with_state(ctx)
}

/// rmcp answers a stale `mcp-session-id` with 401; report it as an unknown
/// session like `/messages` does.
async fn unknown_session_not_found(req: Request, next: Next) -> Response {
    let has_session = req.headers().contains_key(MCP_SESSION_HEADER);
    let response = next.run(req).await;
    if has_session && response.status() == StatusCode::UNAUTHORIZED {
        return not_found("session not found").into_response();
    }
    response
}

/// Starts the proxy and serves until Ctrl-C.
///
/// The upstream session is closed on the way out.
pub async fn run_server(ctx: Arc<ProxyContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config().server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    ctx.start().await;
    let app = build_app(Arc::clone(&ctx));

    info!(
        addr = %bind_addr,
        "toolgate listening (mcp: /mcp, sse: /sse, rest: /tools, health: /health)"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    ctx.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RouterError> for AppError {
    fn from(err: RouterError) -> Self {
        let status = match &err {
            RouterError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RouterError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RouterError::Embedding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

pub fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

pub fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

async fn handle_health(State(ctx): State<Arc<ProxyContext>>) -> Json<HealthReport> {
    Json(ctx.health())
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(ctx): State<Arc<ProxyContext>>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: ctx.tools().definitions(),
    })
}

// ============ POST /tools/{name} ============

/// Session-less tool dispatch. The tool's result is wrapped as
/// `{ "result": … }`.
async fn handle_tool_call(
    State(ctx): State<Arc<ProxyContext>>,
    Path(name): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tool = ctx
        .tools()
        .find(&name)
        .ok_or_else(|| not_found(format!("no tool registered with name: {}", name)))?;

    let params = match params {
        serde_json::Value::Null => serde_json::json!({}),
        serde_json::Value::Object(_) => params,
        _ => return Err(bad_request("request body must be a JSON object")),
    };

    let result = tool.execute(params, &ctx.tool_context()).await?;
    Ok(Json(serde_json::json!({ "result": result })))
}
