//! ChatRelay Router
//!
//! Streaming router for chat-completion requests: picks a backend node in
//! round-robin order, fits the conversation into that node's context window
//! and relays the node's streamed output back to the caller.

pub mod handler;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod tokens;
pub mod truncate;

pub use handler::{reserved_tokens, RequestHandler};
pub use protocol::{ChatRequest, Message};
pub use proxy::{Chunk, StreamingProxy};
pub use registry::{Node, NodeRegistry};
pub use tokens::{ByteLevelEncoder, HuggingFaceEncoder, TokenCounter, TokenEncoder};
pub use truncate::{ContextTruncator, Fitted};
