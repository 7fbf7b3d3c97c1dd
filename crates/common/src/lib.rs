//! ChatRelay common library
//!
//! This crate contains shared code used across ChatRelay components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{NodeConfig, RelayConfig, DEFAULT_MAX_CONTEXT};
pub use error::{RelayError, Result};
pub use metrics::{MetricsRegistry, METRICS};
