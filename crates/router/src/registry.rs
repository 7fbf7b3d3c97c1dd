//! Backend node registry and round-robin rotation
//!
//! The set of nodes is fixed at startup. The only mutable state is the
//! rotation cursor, guarded by a mutex that is held for the read-increment
//! sequence and nothing else.

use chatrelay_common::config::{NodeConfig, DEFAULT_MAX_CONTEXT};
use chatrelay_common::error::{RelayError, Result};
use parking_lot::Mutex;
use reqwest::Url;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immutable backend descriptor
#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    /// Chat-completion URL
    pub endpoint: Url,

    /// Bearer credential
    pub api_key: String,

    /// Maximum total tokens (prompt + response) the node accepts
    pub context_window: usize,
}

impl Node {
    /// Create a node from an already parsed endpoint
    pub fn new(endpoint: Url, api_key: impl Into<String>, context_window: usize) -> Self {
        Self {
            endpoint,
            api_key: api_key.into(),
            context_window,
        }
    }

    /// Validate a configured node descriptor
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let endpoint = Url::parse(config.endpoint.trim()).map_err(|e| {
            RelayError::config(format!("Invalid endpoint {:?}: {}", config.endpoint, e))
        })?;

        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(RelayError::config(format!(
                "Unsupported endpoint scheme: {}",
                endpoint
            )));
        }

        if config.api_key.trim().is_empty() {
            return Err(RelayError::config(format!("Missing API key for {}", endpoint)));
        }

        let context_window = if config.max_context == 0 {
            warn!(
                "Node {} declares a zero context window, using default {}",
                endpoint, DEFAULT_MAX_CONTEXT
            );
            DEFAULT_MAX_CONTEXT
        } else {
            config.max_context
        };

        Ok(Self::new(endpoint, config.api_key.clone(), context_window))
    }
}

// The credential never reaches logs.
impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("endpoint", &self.endpoint.as_str())
            .field("api_key", &"<redacted>")
            .field("context_window", &self.context_window)
            .finish()
    }
}

/// Fixed set of nodes handed out in strict round-robin order
pub struct NodeRegistry {
    /// Nodes in rotation order
    nodes: Vec<Arc<Node>>,

    /// Index of the node returned by the next selection
    cursor: Mutex<usize>,
}

impl NodeRegistry {
    /// Create a registry from validated nodes
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(RelayError::config("No valid nodes configured"));
        }

        for node in &nodes {
            info!(
                "Registered node {} (context window {})",
                node.endpoint, node.context_window
            );
        }

        Ok(Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            cursor: Mutex::new(0),
        })
    }

    /// Build a registry from configuration, skipping invalid descriptors.
    ///
    /// Fails only when no descriptor survives validation.
    pub fn from_configs(configs: &[NodeConfig]) -> Result<Self> {
        let nodes = configs
            .iter()
            .filter_map(|config| match Node::from_config(config) {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!("Skipping node: {}", e);
                    None
                }
            })
            .collect();

        Self::new(nodes)
    }

    /// Select the next node in rotation
    pub fn next_node(&self) -> Arc<Node> {
        let index = {
            let mut cursor = self.cursor.lock();
            let index = *cursor;
            *cursor = (index + 1) % self.nodes.len();
            index
        };

        let node = Arc::clone(&self.nodes[index]);
        debug!("Selected node {} ({})", index, node.endpoint);
        node
    }

    /// All nodes in rotation order
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Number of configured nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false for a constructed registry
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
