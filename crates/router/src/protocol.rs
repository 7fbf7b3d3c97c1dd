//! Chat-completion wire types
//!
//! Requests are parsed once, validated once and never mutated afterwards.
//! Fields the relay does not interpret are carried through untouched.

use chatrelay_common::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,

    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Any other string-valued fields sent by the caller
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            name: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ROLE_SYSTEM, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ROLE_USER, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ROLE_ASSISTANT, content)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == ROLE_SYSTEM
    }

    /// Every string value carried by this message, in a stable order
    pub fn string_fields(&self) -> impl Iterator<Item = &str> {
        [self.role.as_str(), self.content.as_str()]
            .into_iter()
            .chain(self.name.as_deref())
            .chain(self.extra.values().map(String::as_str))
    }
}

fn default_stream() -> bool {
    true
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

fn default_max_tokens() -> u32 {
    8192
}

/// Inbound chat-completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,

    #[serde(default = "default_stream")]
    pub stream: bool,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Top-level fields forwarded verbatim (e.g. `model`)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    /// Parse and validate a request body
    pub fn parse(body: &[u8]) -> Result<Self> {
        let request: ChatRequest =
            serde_json::from_slice(body).map_err(|e| RelayError::malformed(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// Check the conversation shape the relay relies on
    pub fn validate(&self) -> Result<()> {
        match self.messages.last() {
            None => Err(RelayError::EmptyConversation),
            Some(last) if last.role != ROLE_USER => Err(RelayError::InvalidLastRole),
            Some(_) => Ok(()),
        }
    }

    /// Outbound payload: this request with `messages` replaced
    pub fn to_payload(&self, messages: &[Message]) -> Result<Value> {
        let mut payload = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut payload {
            fields.insert("messages".to_string(), serde_json::to_value(messages)?);
        }
        Ok(payload)
    }
}
