//! # Toolgate CLI (`toolgate`)
//!
//! ## Usage
//!
//! ```bash
//! toolgate --config ./config/toolgate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `toolgate serve` | Run the proxy (MCP, SSE and REST on one listener) |
//! | `toolgate sync` | Connect once, rebuild the catalog, persist the snapshot |
//! | `toolgate search "<query>"` | Rank operations from the persisted snapshot |
//! | `toolgate health` | Query a running proxy; exits 1 unless it is connected |
//!
//! ## Examples
//!
//! ```bash
//! export TOOLGATE_API_KEY=...
//! toolgate sync --config ./config/toolgate.toml
//! toolgate search "open a github issue" --limit 3
//! toolgate serve
//! toolgate health --url http://127.0.0.1:7332
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use toolgate::context::{run_sync, ProxyContext};
use toolgate::embedding::create_provider;
use toolgate::health::fetch_health;
use toolgate::search::run_search;
use toolgate::snapshot::SnapshotStore;
use toolgate::{config, server};

/// Toolgate: a tool-discovery proxy in front of an MCP tool aggregator.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/toolgate.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "toolgate",
    about = "Toolgate: semantic tool discovery in front of an MCP tool aggregator",
    version,
    long_about = "Toolgate connects to one upstream MCP aggregator, indexes its tool catalog \
    with embeddings, and exposes four operations (discover, execute, batch_execute, refresh) \
    to agents over MCP Streamable HTTP, legacy MCP SSE, and a REST API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/toolgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy.
    ///
    /// Refuses to start when the upstream credential is missing.
    Serve,

    /// Connect to the aggregator once, rebuild the catalog, and persist the
    /// snapshot.
    Sync,

    /// Rank operations from the persisted snapshot.
    Search {
        /// Natural-language description of the task.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Query the health endpoint of a running proxy.
    ///
    /// Exits with status 1 if the proxy is unreachable or its upstream is
    /// disconnected.
    Health {
        /// Base URL of the proxy. Defaults to `http://<server.bind>`.
        #[arg(long)]
        url: Option<String>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolgate=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    // Health only needs the config to find the default address.
    if let Commands::Health { url: Some(url) } = &cli.command {
        return report_health(url).await;
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let api_key = cfg.upstream.resolve_api_key()?;
            let ctx = ProxyContext::from_config(cfg, api_key)?;
            server::run_server(ctx).await?;
        }
        Commands::Sync => {
            let api_key = cfg.upstream.resolve_api_key()?;
            let report = run_sync(cfg, api_key).await?;
            println!("Sync complete: {}", report);
        }
        Commands::Search { query, limit } => {
            let path = cfg
                .index
                .snapshot_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("index.snapshot_path is not configured"))?;
            let snapshot = SnapshotStore::new(&path).load().await?.ok_or_else(|| {
                anyhow::anyhow!(
                    "no catalog snapshot at {}; run `toolgate sync` first",
                    path.display()
                )
            })?;
            let provider = create_provider(&cfg.embedding)?;
            let limit = limit
                .unwrap_or(cfg.retrieval.default_limit)
                .min(cfg.retrieval.max_limit);
            run_search(&snapshot, provider.as_ref(), &query, limit).await?;
        }
        Commands::Health { url } => {
            let url = url.unwrap_or_else(|| format!("http://{}", cfg.server.bind));
            return report_health(&url).await;
        }
    }

    Ok(())
}

async fn report_health(url: &str) -> anyhow::Result<()> {
    let report = fetch_health(url).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}
