//! HTTP server assembly

use crate::handler::{chat_completions, RequestHandler};
use crate::proxy::StreamingProxy;
use crate::registry::NodeRegistry;
use crate::tokens::{ByteLevelEncoder, HuggingFaceEncoder, TokenCounter, TokenEncoder};
use crate::truncate::ContextTruncator;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chatrelay_common::config::RelayConfig;
use chatrelay_common::error::Result;
use chatrelay_common::metrics::METRICS;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Build the request handler described by `config`
pub fn build_handler(config: &RelayConfig) -> Result<RequestHandler> {
    let registry = NodeRegistry::from_configs(&config.nodes)?;

    let encoder: Arc<dyn TokenEncoder> = match &config.tokenizer_path {
        Some(path) => {
            info!("Loading tokenizer from {}", path.display());
            Arc::new(HuggingFaceEncoder::from_file(path)?)
        }
        None => {
            warn!("No tokenizer_path configured, estimating one token per byte");
            Arc::new(ByteLevelEncoder)
        }
    };

    let truncator = ContextTruncator::new(TokenCounter::new(encoder));
    let proxy = StreamingProxy::from_config(config)?;

    Ok(RequestHandler::new(Arc::new(registry), truncator, proxy))
}

/// Build the axum application
pub fn build_router(handler: Arc<RequestHandler>, config: &RelayConfig) -> Router {
    let mut router = Router::new()
        .route("/", post(chat_completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(health));

    if config.observability.enable_metrics {
        router = router.route("/metrics", get(metrics));
    }

    router
        .layer(DefaultBodyLimit::max(config.max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

/// Serve `router` on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("ChatRelay listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health(State(handler): State<Arc<RequestHandler>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "nodes": handler.registry().len() }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
}
