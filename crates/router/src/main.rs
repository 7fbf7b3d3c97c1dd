//! ChatRelay Router - Main Entry Point
//!
//! Loads node configuration, builds the router and serves chat-completion
//! requests until interrupted.

use anyhow::Context;
use chatrelay_common::RelayConfig;
use chatrelay_router::server;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chatrelay_router=info,chatrelay_common=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ChatRelay Router");

    // Load configuration
    let config_path = std::env::var("CHATRELAY_CONFIG").ok().map(PathBuf::from);
    let config = RelayConfig::load(config_path.as_deref()).context("loading configuration")?;
    config.validate()?;

    info!(
        "Configuration loaded: bind={}:{}, nodes={}, timeout={:?}",
        config.bind_address,
        config.port,
        config.nodes.len(),
        config.request_timeout()
    );

    let handler = Arc::new(server::build_handler(&config)?);
    let router = server::build_router(handler, &config);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    server::serve(listener, router, shutdown_signal()).await?;

    info!("ChatRelay Router shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
