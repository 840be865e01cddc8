use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::dispatcher::SHUTDOWN_TOKEN;
use crate::error::{ClientError, CoreResult};
use crate::event_source::ReconnectPolicy;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ApiCfg {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Name of the environment variable holding the organization id, if any.
    #[serde(default)]
    pub organization_env: Option<String>,
}

impl Default for ApiCfg {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            organization_env: None,
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Non-streaming request timeout in milliseconds (default 60000ms).
    /// Streaming bodies are not bounded by it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// A connection healthy this long resets the backoff.
    #[serde(default = "default_backoff_reset_ms")]
    pub backoff_reset_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Batching window; 0 delivers every chunk on its own.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_shutdown_token")]
    pub shutdown_token: String,
    /// Reconnect on transient failures instead of shutting down.
    #[serde(default)]
    pub retry_on_error: bool,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            backoff_reset_ms: default_backoff_reset_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            throttle_ms: default_throttle_ms(),
            shutdown_token: default_shutdown_token(),
            retry_on_error: false,
        }
    }
}

impl StreamCfg {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            backoff_reset_threshold: Duration::from_millis(self.backoff_reset_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_backoff_reset_ms() -> u64 {
    60_000
}
fn default_idle_timeout_ms() -> u64 {
    300_000
}
fn default_throttle_ms() -> u64 {
    300
}
fn default_shutdown_token() -> String {
    SHUTDOWN_TOKEN.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub stream: StreamCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(ClientError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| ClientError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| ClientError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| ClientError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| ClientError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| ClientError::Other(e.into())))?,
        };
        Ok(cfg)
    }
}
