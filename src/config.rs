use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::upstream::SupervisorSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Connection settings for the upstream tool aggregator.
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// MCP Streamable HTTP endpoint of the aggregator.
    pub url: String,
    /// Inline credential. Prefer `api_key_env` so the key stays out of the file.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the credential when `api_key` is unset.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_secs: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_disconnect_delay")]
    pub disconnect_delay_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_api_key_env() -> String {
    "TOOLGATE_API_KEY".to_string()
}
fn default_request_timeout() -> u64 {
    60
}
fn default_call_timeout() -> u64 {
    120
}
fn default_reconnect_base() -> u64 {
    2
}
fn default_reconnect_max() -> u64 {
    30
}
fn default_disconnect_delay() -> u64 {
    5
}
fn default_poll_interval() -> u64 {
    15
}

impl UpstreamConfig {
    /// Resolve the aggregator credential.
    ///
    /// A missing credential is the one configuration error the proxy cannot
    /// recover from, so callers treat the error as fatal at startup.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => bail!(
                "missing upstream credential: set {} or upstream.api_key in the config file",
                self.api_key_env
            ),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            base_delay: Duration::from_secs(self.reconnect_base_secs),
            max_delay: Duration::from_secs(self.reconnect_max_secs),
            disconnect_delay: Duration::from_secs(self.disconnect_delay_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Where the last built catalog snapshot is persisted. `None` keeps the
    /// catalog in memory only.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

fn default_snapshot_path() -> Option<PathBuf> {
    Some(PathBuf::from("./data/catalog.json"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_limit() -> usize {
    5
}
fn default_max_limit() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7332".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate upstream
    if config.upstream.url.trim().is_empty() {
        bail!("upstream.url must not be empty");
    }
    if !config.upstream.url.starts_with("http://") && !config.upstream.url.starts_with("https://")
    {
        bail!("upstream.url must be an http(s) URL");
    }
    if config.upstream.reconnect_base_secs == 0 {
        bail!("upstream.reconnect_base_secs must be > 0");
    }
    if config.upstream.reconnect_max_secs < config.upstream.reconnect_base_secs {
        bail!("upstream.reconnect_max_secs must be >= upstream.reconnect_base_secs");
    }
    if config.upstream.poll_interval_secs == 0 {
        bail!("upstream.poll_interval_secs must be > 0");
    }

    // Validate retrieval
    if config.retrieval.default_limit < 1 {
        bail!("retrieval.default_limit must be >= 1");
    }
    if config.retrieval.max_limit < config.retrieval.default_limit {
        bail!("retrieval.max_limit must be >= retrieval.default_limit");
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be openai, ollama, or local.",
            other
        ),
    }

    Ok(config)
}
