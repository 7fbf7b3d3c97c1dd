//! Streaming relay to backend nodes
//!
//! Backend output is passed through chunk by chunk without parsing. Any
//! upstream failure becomes a single in-band error chunk that ends the
//! stream, since response headers have already been sent by then.

use crate::registry::Node;
use bytes::Bytes;
use chatrelay_common::config::RelayConfig;
use chatrelay_common::error::{RelayError, Result};
use chatrelay_common::metrics::METRICS;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// One item of a relayed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Raw backend bytes
    Data(Bytes),

    /// Terminal upstream failure
    Error(String),
}

impl Chunk {
    /// Wire form; errors render as `{"error": "<details>"}`
    pub fn into_bytes(self) -> Bytes {
        match self {
            Chunk::Data(bytes) => bytes,
            Chunk::Error(message) => {
                Bytes::from(serde_json::json!({ "error": message }).to_string())
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Chunk::Error(_))
    }
}

/// Lazy, single-consumption stream of chunks
pub type ChunkStream = BoxStream<'static, Chunk>;

/// Relays requests to nodes over a shared connection pool
#[derive(Clone)]
pub struct StreamingProxy {
    client: reqwest::Client,
    timeout: Duration,
}

impl StreamingProxy {
    /// Create a proxy with a pooled client
    pub fn new(
        timeout: Duration,
        connect_timeout: Duration,
        max_idle_per_host: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
            .map_err(|e| RelayError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Self::new(
            config.request_timeout(),
            config.connect_timeout(),
            config.pool_max_idle_per_host,
        )
    }

    /// Post `payload` to `node` and stream its response body back.
    ///
    /// Nothing is sent until the stream is first polled. Dropping the stream
    /// drops the in-flight response, which closes the upstream connection.
    pub fn relay(&self, node: Arc<Node>, payload: Value) -> ChunkStream {
        let request = self
            .client
            .post(node.endpoint.clone())
            .bearer_auth(&node.api_key)
            .timeout(self.timeout)
            .json(&payload);
        let timeout = self.timeout;

        let stream = async_stream::stream! {
            let mut guard = StreamGuard::new(Arc::clone(&node));

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    yield guard.fail(upstream_error(&e, timeout), failure_kind(&e));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let err = RelayError::transport(format!("Model error: {}: {}", status, body));
                yield guard.fail(err, "status");
                return;
            }

            debug!("Streaming response from {} ({})", node.endpoint, status);

            let mut body = response.bytes_stream();
            while let Some(item) = body.next().await {
                match item {
                    Ok(bytes) => {
                        guard.bytes += bytes.len();
                        yield Chunk::Data(bytes);
                    }
                    Err(e) => {
                        yield guard.fail(upstream_error(&e, timeout), failure_kind(&e));
                        return;
                    }
                }
            }

            guard.completed = true;
        };

        stream.boxed()
    }
}

fn upstream_error(err: &reqwest::Error, timeout: Duration) -> RelayError {
    if err.is_timeout() {
        RelayError::timeout(format!("{}s", timeout.as_secs_f64()))
    } else if err.is_connect() {
        RelayError::transport(format!("Connection error: {}", err))
    } else {
        RelayError::transport(err.to_string())
    }
}

fn failure_kind(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_body() || err.is_decode() {
        "body"
    } else {
        "request"
    }
}

/// Tracks one relayed stream from first poll until it is dropped, whether it
/// finished, failed or was abandoned by the caller.
struct StreamGuard {
    node: Arc<Node>,
    started: Instant,
    bytes: usize,
    completed: bool,
    failed: bool,
}

impl StreamGuard {
    fn new(node: Arc<Node>) -> Self {
        METRICS.upstream.active_streams.inc();
        Self {
            node,
            started: Instant::now(),
            bytes: 0,
            completed: false,
            failed: false,
        }
    }

    fn fail(&mut self, err: RelayError, kind: &str) -> Chunk {
        error!("Upstream {} failed: {}", self.node.endpoint, err);
        METRICS.upstream.upstream_errors.with_label_values(&[kind]).inc();
        self.failed = true;
        Chunk::Error(err.to_string())
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        METRICS.upstream.active_streams.dec();
        METRICS.upstream.stream_duration.observe(elapsed.as_secs_f64());

        if self.completed {
            info!(
                "Stream from {} completed: {} bytes in {:?}",
                self.node.endpoint, self.bytes, elapsed
            );
        } else if !self.failed {
            info!(
                "Stream from {} cancelled by caller after {} bytes",
                self.node.endpoint, self.bytes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn proxy(timeout: Duration) -> StreamingProxy {
        StreamingProxy::new(timeout, Duration::from_secs(2), 4).unwrap()
    }

    fn node_at(url: &str) -> Arc<Node> {
        Arc::new(Node::new(Url::parse(url).unwrap(), "secret", 4096))
    }

    async fn collect(stream: ChunkStream) -> Vec<Chunk> {
        stream.collect().await
    }

    #[test]
    fn test_error_chunk_is_json() {
        let bytes = Chunk::Error("Model error: 500".to_string()).into_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"error": "Model error: 500"}));

        let data = Chunk::Data(Bytes::from_static(b"data: {}\n\n"));
        assert!(!data.is_error());
        assert_eq!(data.into_bytes(), Bytes::from_static(b"data: {}\n\n"));
    }

    #[tokio::test]
    async fn test_relay_passes_body_through() {
        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let node = node_at(&format!("{}/v1/chat/completions", server.uri()));
        let stream = proxy(Duration::from_secs(5)).relay(node, json!({"stream": true}));
        let chunks = collect(stream).await;

        assert!(chunks.iter().all(|c| !c.is_error()));
        let relayed: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.into_bytes().to_vec())
            .collect();
        assert_eq!(relayed, body.as_bytes());
    }

    #[tokio::test]
    async fn test_relay_reports_backend_status_as_single_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let node = node_at(&server.uri());
        let chunks = collect(proxy(Duration::from_secs(5)).relay(node, json!({}))).await;

        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            Chunk::Error(message) => {
                assert!(message.contains("500"));
                assert!(message.contains("boom"));
            }
            other => panic!("expected error chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_relay_reports_connection_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let node = node_at(&format!("http://127.0.0.1:{port}/v1/chat/completions"));
        let chunks = collect(proxy(Duration::from_secs(5)).relay(node, json!({}))).await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_error());
    }

    #[tokio::test]
    async fn test_relay_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let node = node_at(&server.uri());
        let chunks = collect(proxy(Duration::from_millis(200)).relay(node, json!({}))).await;

        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            Chunk::Error(message) => assert!(message.contains("timed out")),
            other => panic!("expected timeout chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_upstream_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use tokio::sync::oneshot;

        // Hand-rolled backend: answers with one chunk, then keeps the
        // response open and reports when the client hangs up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut head: Vec<u8> = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      content-type: text/event-stream\r\n\
                      transfer-encoding: chunked\r\n\r\n\
                      d\r\ndata: first\n\n\r\n",
                )
                .await
                .unwrap();

            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            let _ = closed_tx.send(());
        });

        let node = node_at(&format!("http://{addr}/v1/chat/completions"));
        let mut stream = proxy(Duration::from_secs(30)).relay(node, json!({"stream": true}));

        match stream.next().await {
            Some(Chunk::Data(bytes)) => assert!(bytes.starts_with(b"data")),
            other => panic!("expected a data chunk, got {other:?}"),
        }
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), closed_rx)
            .await
            .expect("upstream connection stayed open after the stream was dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_is_lazy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let node = node_at(&server.uri());
        let stream = proxy(Duration::from_secs(5)).relay(node, json!({}));
        drop(stream);

        server.verify().await;
    }
}
