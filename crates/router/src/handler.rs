//! Chat request handling
//!
//! A request moves through validate, select node, truncate and stream.
//! Validation failures are reported before any node is contacted; once
//! streaming starts, failures travel in-band (see [`crate::proxy`]).

use crate::protocol::ChatRequest;
use crate::proxy::{ChunkStream, StreamingProxy};
use crate::registry::{Node, NodeRegistry};
use crate::truncate::{ContextTruncator, Fitted};
use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatrelay_common::error::{RelayError, Result};
use chatrelay_common::metrics::METRICS;
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

/// Tokens held back for the model's reply: half the window, rounded up, so
/// the prompt gets `context_window / 2`. Independent of the caller's
/// `max_tokens`.
pub fn reserved_tokens(context_window: usize) -> usize {
    context_window - context_window / 2
}

/// A validated request bound to a node, ready to stream
#[derive(Debug)]
pub struct Prepared {
    pub node: Arc<Node>,
    pub payload: Value,
    pub fitted: Fitted,
}

/// Orchestrates registry, truncator and proxy for one request at a time
pub struct RequestHandler {
    registry: Arc<NodeRegistry>,
    truncator: ContextTruncator,
    proxy: StreamingProxy,
}

impl RequestHandler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        truncator: ContextTruncator,
        proxy: StreamingProxy,
    ) -> Self {
        Self {
            registry,
            truncator,
            proxy,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Validate the body, pick a node and fit the conversation to it
    pub fn prepare(&self, body: &[u8]) -> Result<Prepared> {
        let request = ChatRequest::parse(body)?;

        let node = self.registry.next_node();
        let reserved = reserved_tokens(node.context_window);
        info!(
            "Routing to {} (reserved {} tokens for the response, prompt limit {})",
            node.endpoint,
            reserved,
            node.context_window - reserved
        );

        let fitted = self
            .truncator
            .fit_with_report(&request.messages, &node, reserved)?;
        let payload = request.to_payload(&fitted.messages)?;

        METRICS
            .routing
            .requests_routed
            .with_label_values(&[node.endpoint.as_str()])
            .inc();
        METRICS.routing.messages_evicted.inc_by(fitted.evicted as u64);
        if fitted.final_truncated {
            METRICS.routing.final_turn_truncations.inc();
        }
        METRICS.routing.prompt_tokens.observe(fitted.prompt_tokens as f64);

        Ok(Prepared {
            node,
            payload,
            fitted,
        })
    }

    /// Run a request up to the point where the node's output can be streamed
    pub fn handle(&self, body: &[u8]) -> Result<ChunkStream> {
        let prepared = self.prepare(body)?;
        Ok(self.proxy.relay(prepared.node, prepared.payload))
    }
}

/// Error response for failures before streaming starts
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = err.status_code();

        let body = match &err {
            RelayError::MalformedRequest(details) => {
                json!({ "error": "Invalid request format", "details": details })
            }
            RelayError::PayloadTooLarge(details) => {
                json!({ "error": "Request body too large", "details": details })
            }
            RelayError::EmptyConversation | RelayError::InvalidLastRole => {
                json!({ "error": err.to_string() })
            }
            _ => {
                error!("Request failed: {}", err);
                METRICS.requests.internal_errors.inc();
                json!({ "error": "Internal server error" })
            }
        };

        if err.is_client_error() {
            warn!("Rejected request: {}", err);
            METRICS
                .requests
                .requests_rejected
                .with_label_values(&[err.kind()])
                .inc();
        }

        (status, Json(body)).into_response()
    }
}

fn rejected_body(rejection: BytesRejection) -> RelayError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        RelayError::payload_too_large(rejection.body_text())
    } else {
        RelayError::malformed(rejection.body_text())
    }
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(handler): State<Arc<RequestHandler>>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> std::result::Result<Response, ApiError> {
    METRICS.requests.requests_total.inc();
    let body = body.map_err(rejected_body)?;

    let request_id = Uuid::new_v4();
    let stream = info_span!("chat", %request_id).in_scope(|| handler.handle(&body))?;

    let body = Body::from_stream(stream.map(|chunk| Ok::<_, Infallible>(chunk.into_bytes())));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::tokens::{ByteLevelEncoder, TokenCounter};
    use reqwest::Url;
    use std::time::Duration;

    fn handler(windows: &[usize]) -> RequestHandler {
        let nodes = windows
            .iter()
            .enumerate()
            .map(|(i, w)| {
                Node::new(
                    Url::parse(&format!("http://node-{i}.local/v1/chat/completions")).unwrap(),
                    format!("key-{i}"),
                    *w,
                )
            })
            .collect();

        RequestHandler::new(
            Arc::new(NodeRegistry::new(nodes).unwrap()),
            ContextTruncator::new(TokenCounter::new(Arc::new(ByteLevelEncoder))),
            StreamingProxy::new(Duration::from_secs(1), Duration::from_secs(1), 1).unwrap(),
        )
    }

    #[test]
    fn test_reserved_tokens_is_half_rounded_up() {
        assert_eq!(reserved_tokens(4096), 2048);
        assert_eq!(reserved_tokens(4097), 2049);
        assert_eq!(reserved_tokens(1), 1);
        assert_eq!(reserved_tokens(0), 0);
    }

    #[test]
    fn test_prepare_rotates_nodes() {
        let handler = handler(&[4096, 4096, 4096]);
        let body = br#"{"messages":[{"role":"user","content":"hi"}]}"#;

        let hosts: Vec<String> = (0..6)
            .map(|_| {
                let prepared = handler.prepare(body).unwrap();
                prepared.node.endpoint.host_str().unwrap().to_string()
            })
            .collect();

        assert_eq!(
            hosts,
            vec![
                "node-0.local",
                "node-1.local",
                "node-2.local",
                "node-0.local",
                "node-1.local",
                "node-2.local",
            ]
        );
    }

    #[test]
    fn test_prepare_fits_to_half_the_window() {
        let handler = handler(&[80]);
        let body = serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "an old question that no longer fits"},
                {"role": "assistant", "content": "ok"},
                {"role": "user", "content": "now"}
            ]
        });

        let prepared = handler.prepare(body.to_string().as_bytes()).unwrap();

        assert!(prepared.fitted.prompt_tokens <= 40);
        assert_eq!(prepared.payload["model"], "m");
        assert_eq!(
            prepared.fitted.messages,
            vec![
                Message::system("sys"),
                Message::assistant("ok"),
                Message::user("now"),
            ]
        );
        assert_eq!(
            prepared.payload["messages"],
            serde_json::to_value(&prepared.fitted.messages).unwrap()
        );
    }

    #[test]
    fn test_validation_errors_do_not_advance_rotation() {
        let handler = handler(&[4096, 4096]);

        assert!(matches!(
            handler.prepare(br#"{"messages":[]}"#),
            Err(RelayError::EmptyConversation)
        ));
        assert!(matches!(
            handler.prepare(b"[]"),
            Err(RelayError::MalformedRequest(_))
        ));

        let prepared = handler
            .prepare(br#"{"messages":[{"role":"user","content":"hi"}]}"#)
            .unwrap();
        assert_eq!(prepared.node.endpoint.host_str(), Some("node-0.local"));
    }

    #[tokio::test]
    async fn test_api_error_bodies() {
        use axum::body::to_bytes;

        let cases = [
            (
                ApiError(RelayError::EmptyConversation),
                StatusCode::BAD_REQUEST,
                json!({"error": "Empty message list"}),
            ),
            (
                ApiError(RelayError::InvalidLastRole),
                StatusCode::BAD_REQUEST,
                json!({"error": "Last message must be from user"}),
            ),
            (
                ApiError(RelayError::malformed("expected value")),
                StatusCode::BAD_REQUEST,
                json!({"error": "Invalid request format", "details": "expected value"}),
            ),
            (
                ApiError(RelayError::payload_too_large("length limit exceeded")),
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({"error": "Request body too large", "details": "length limit exceeded"}),
            ),
            (
                ApiError(RelayError::tokenizer("vocab file is corrupt")),
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "Internal server error"}),
            ),
        ];

        for (err, status, expected) in cases {
            let response = err.into_response();
            assert_eq!(response.status(), status);
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body, expected);
        }
    }
}
