//! Common error types for ChatRelay
//!
//! This module defines all error types used across the ChatRelay system.
//! All errors map to an HTTP status code so handlers can decide what the
//! caller is allowed to see.

use http::StatusCode;
use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for ChatRelay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request body could not be parsed into a chat request
    #[error("Invalid request format: {0}")]
    MalformedRequest(String),

    /// Request carried no messages
    #[error("Empty message list")]
    EmptyConversation,

    /// Last message of the conversation is not a user turn
    #[error("Last message must be from user")]
    InvalidLastRole,

    /// Request body exceeded the configured size limit
    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    /// Connection failure or non-success answer from a node
    #[error("{0}")]
    Transport(String),

    /// Upstream call exceeded its total-duration ceiling
    #[error("Upstream request timed out after {0}")]
    Timeout(String),

    /// Tokenizer loading, encoding or decoding errors
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<AddrParseError> for RelayError {
    fn from(err: AddrParseError) -> Self {
        RelayError::Parse(err.to_string())
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl RelayError {
    /// Convert error to the HTTP status reported to the caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ if self.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error was caused by the caller's input.
    ///
    /// Only these errors may expose their message to the caller; everything
    /// else is reported as an opaque internal error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedRequest(_)
                | RelayError::EmptyConversation
                | RelayError::InvalidLastRole
                | RelayError::PayloadTooLarge(_)
        )
    }

    /// Short machine-friendly label, used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::MalformedRequest(_) => "malformed_request",
            RelayError::EmptyConversation => "empty_conversation",
            RelayError::InvalidLastRole => "invalid_last_role",
            RelayError::PayloadTooLarge(_) => "payload_too_large",
            RelayError::Transport(_) => "transport",
            RelayError::Timeout(_) => "timeout",
            RelayError::Tokenizer(_) => "tokenizer",
            RelayError::Serialization(_) => "serialization",
            RelayError::Io(_) => "io",
            RelayError::Parse(_) => "parse",
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    /// Create a malformed request error
    pub fn malformed(msg: impl Into<String>) -> Self {
        RelayError::MalformedRequest(msg.into())
    }

    /// Create an oversized request error
    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        RelayError::PayloadTooLarge(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        RelayError::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        RelayError::Timeout(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        RelayError::Tokenizer(msg.into())
    }
}

/// Result type alias for ChatRelay operations
pub type Result<T> = std::result::Result<T, RelayError>;
