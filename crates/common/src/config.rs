//! Configuration structures for ChatRelay
//!
//! Configuration is layered: an optional YAML file, then `CHATRELAY_*`
//! environment overrides, then backend node descriptors enumerated from
//! `NODE<i>_ENDPOINT`, `NODE<i>_API_KEY` and `NODE<i>_MAX_CONTEXT`.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Context window assumed for a node that does not declare a usable one
pub const DEFAULT_MAX_CONTEXT: usize = 4096;

/// Prefix for environment overrides of top-level settings
const ENV_PREFIX: &str = "CHATRELAY";

/// Top-level configuration for the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Server binding address
    pub bind_address: String,

    /// Server port
    pub port: u16,

    /// Absolute ceiling for one upstream call, in seconds
    pub request_timeout_secs: u64,

    /// Connect timeout for upstream calls, in seconds
    pub connect_timeout_secs: u64,

    /// Idle pooled connections kept per backend host
    pub pool_max_idle_per_host: usize,

    /// Largest accepted request body, in bytes
    pub max_request_bytes: usize,

    /// Path to the `tokenizer.json` shared with the backends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<PathBuf>,

    /// Backend nodes, in rotation order
    pub nodes: Vec<NodeConfig>,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

/// One configured backend node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Chat-completion URL of the backend
    pub endpoint: String,

    /// Bearer credential forwarded to the backend
    pub api_key: String,

    /// Maximum total tokens the backend accepts
    #[serde(default = "default_max_context")]
    pub max_context: usize,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Expose Prometheus metrics on `/metrics`
    pub enable_metrics: bool,
}

fn default_max_context() -> usize {
    DEFAULT_MAX_CONTEXT
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            request_timeout_secs: 600,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 32,
            max_request_bytes: 16 * 1024 * 1024,
            tokenizer_path: None,
            nodes: Vec::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
        }
    }
}

impl RelayConfig {
    /// Load configuration from an optional YAML file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, std::env::vars().collect())
    }

    /// Load configuration from an optional YAML file and an explicit variable set
    pub fn load_from(path: Option<&Path>, vars: HashMap<String, String>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(RelayError::config(format!(
                    "Config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let overrides: config::Map<String, String> = vars
            .iter()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(Some(overrides)),
        );

        let mut config: RelayConfig = builder.build()?.try_deserialize()?;
        config.nodes.extend(Self::nodes_from_vars(vars));
        Ok(config)
    }

    /// Enumerate node descriptors from `NODE<i>_*` variables, ordered by `i`.
    ///
    /// A node needs both an endpoint and a key. An unparsable or zero
    /// `NODE<i>_MAX_CONTEXT` falls back to [`DEFAULT_MAX_CONTEXT`].
    pub fn nodes_from_vars<I>(vars: I) -> Vec<NodeConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let mut indices: Vec<usize> = vars
            .keys()
            .filter_map(|key| {
                key.strip_prefix("NODE")?
                    .strip_suffix("_ENDPOINT")?
                    .parse()
                    .ok()
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();

        let non_empty = |key: String| vars.get(&key).filter(|v| !v.trim().is_empty()).cloned();

        indices
            .into_iter()
            .filter_map(|i| {
                let endpoint = non_empty(format!("NODE{i}_ENDPOINT"))?;
                let Some(api_key) = non_empty(format!("NODE{i}_API_KEY")) else {
                    warn!("NODE{i}_ENDPOINT is set without NODE{i}_API_KEY, skipping node");
                    return None;
                };

                let max_context = match vars.get(&format!("NODE{i}_MAX_CONTEXT")) {
                    None => DEFAULT_MAX_CONTEXT,
                    Some(raw) => match raw.trim().parse::<usize>() {
                        Ok(value) if value > 0 => value,
                        _ => {
                            warn!(
                                "NODE{i}_MAX_CONTEXT={raw:?} is invalid, using default {}",
                                DEFAULT_MAX_CONTEXT
                            );
                            DEFAULT_MAX_CONTEXT
                        }
                    },
                };

                Some(NodeConfig {
                    endpoint: endpoint.trim().to_string(),
                    api_key,
                    max_context,
                })
            })
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(RelayError::config("No valid nodes configured"));
        }
        if self.request_timeout_secs == 0 {
            return Err(RelayError::config("request_timeout_secs must be positive"));
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Socket address the server binds to
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| RelayError::config(format!("Invalid bind address: {}", e)))
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
