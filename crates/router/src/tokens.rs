//! Token accounting for chat conversations
//!
//! Counts are estimates used for truncation decisions only. They must be
//! deterministic and use the tokenizer the backends serve with.

use crate::protocol::Message;
use chatrelay_common::error::{RelayError, Result};
use std::path::Path;
use std::sync::Arc;

/// Fixed cost of every message in a conversation
pub const TOKENS_PER_MESSAGE: usize = 3;

/// Extra cost of a message carrying a `name`
pub const TOKENS_PER_NAME: usize = 1;

/// Reply-priming overhead added once per conversation
pub const TOKENS_REPLY_PRIMING: usize = 3;

/// Text to token ids and back
pub trait TokenEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// Encoder backed by a Hugging Face `tokenizer.json`
pub struct HuggingFaceEncoder {
    tokenizer: tokenizers::Tokenizer,
}

impl HuggingFaceEncoder {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(|err| {
            RelayError::tokenizer(format!(
                "Error loading tokenizer {}: {}",
                path.display(),
                err
            ))
        })?;

        Ok(Self { tokenizer })
    }
}

impl From<tokenizers::Tokenizer> for HuggingFaceEncoder {
    fn from(tokenizer: tokenizers::Tokenizer) -> Self {
        Self { tokenizer }
    }
}

impl TokenEncoder for HuggingFaceEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|err| RelayError::tokenizer(format!("Error tokenizing input: {err}")))?;

        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, false)
            .map_err(|err| RelayError::tokenizer(format!("Error de-tokenizing input: {err}")))
    }
}

/// One token per UTF-8 byte.
///
/// Over-estimates any subword tokenizer, so budgets computed with it are
/// conservative. Decoding stops at the last complete character.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteLevelEncoder;

impl TokenEncoder for ByteLevelEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes = ids
            .iter()
            .map(|&id| {
                u8::try_from(id)
                    .map_err(|_| RelayError::tokenizer(format!("Token id {id} is not a byte")))
            })
            .collect::<Result<Vec<u8>>>()?;

        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(err) => {
                let valid = err.utf8_error().valid_up_to();
                let mut bytes = err.into_bytes();
                bytes.truncate(valid);
                String::from_utf8(bytes).map_err(|e| RelayError::tokenizer(e.to_string()))
            }
        }
    }
}

/// Estimates the token cost of a conversation
#[derive(Clone)]
pub struct TokenCounter {
    encoder: Arc<dyn TokenEncoder>,
}

impl TokenCounter {
    pub fn new(encoder: Arc<dyn TokenEncoder>) -> Self {
        Self { encoder }
    }

    /// Per message: fixed overhead, every string field, one more for `name`.
    /// Plus the reply-priming overhead once.
    pub fn count(&self, messages: &[Message]) -> Result<usize> {
        let mut total = TOKENS_REPLY_PRIMING;
        for message in messages {
            total += self.message_cost(message)?;
        }
        Ok(total)
    }

    /// Cost of a single message, excluding the reply-priming overhead
    pub fn message_cost(&self, message: &Message) -> Result<usize> {
        let mut cost = TOKENS_PER_MESSAGE;
        for field in message.string_fields() {
            cost += self.encoder.encode(field)?.len();
        }
        if message.name.is_some() {
            cost += TOKENS_PER_NAME;
        }
        Ok(cost)
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encoder.encode(text)
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.encoder.decode(ids)
    }
}
