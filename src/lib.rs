//! # Toolgate
//!
//! A tool-discovery proxy in front of an MCP tool aggregator.
//!
//! Aggregators expose hundreds of operations; listing all of them to an
//! agent wastes its context window. Toolgate indexes the upstream catalog
//! with embeddings and offers agents four fixed tools instead: `discover`
//! (semantic search over the catalog), `execute`, `batch_execute` and
//! `refresh`.
//!
//! ## Architecture
//!
//! ```text
//!  Aggregator ◀── list / call / push ──▶ UpstreamClient ── signals ──▶ CatalogIndex
//!                                             │                          │
//!                                             │ invoke                   │ Arc<CatalogSnapshot>
//!                                             ▼                          ▼
//!                                      ┌─────────────────────────────────────┐
//!                                      │            RequestRouter            │
//!                                      └──────────────────┬──────────────────┘
//!                              ┌──────────────────────────┼──────────────────────┐
//!                              ▼                          ▼                      ▼
//!                       MCP /mcp (rmcp)         SSE /sse + /messages        REST /tools
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors at component seams |
//! | [`protocol`] | JSON-RPC framing for the SSE transport |
//! | [`upstream`] | Connection supervisor and rmcp client session |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`catalog`] | Fingerprinting and incremental rebuilds |
//! | [`snapshot`] | Atomic on-disk snapshot |
//! | [`search`] | Cosine ranking |
//! | [`router`] | The four downstream operations |
//! | [`tools`] | Tool trait and registry |
//! | [`sessions`] | Downstream session table |
//! | [`mcp`] | rmcp server handler |
//! | [`sse`] | Legacy SSE transport |
//! | [`health`] | Health projection |
//! | [`context`] | Service object owning all components |
//! | [`server`] | axum HTTP server |

pub mod catalog;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod health;
pub mod mcp;
pub mod models;
pub mod protocol;
pub mod router;
pub mod search;
pub mod server;
pub mod sessions;
pub mod snapshot;
pub mod sse;
pub mod tools;
pub mod upstream;
