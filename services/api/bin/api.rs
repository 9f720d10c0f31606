//! Main Entrypoint for the Voice Link API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Building the connection registry and the upstream bridge factory.
//! 4. Constructing the Axum router.
//! 5. Serving until Ctrl+C, then tearing down every live session.

use anyhow::Context;
use gemini_realtime::GeminiBridgeFactory;
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use voicelink_api::{config::Config, router::create_router, state::AppState};
use voicelink_core::registry::ConnectionRegistry;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let gemini_config = config
        .gemini_config()
        .context("Failed to build Gemini configuration")?;
    let registry = Arc::new(ConnectionRegistry::with_limit(config.max_connections));
    let app_state = Arc::new(AppState {
        registry: registry.clone(),
        bridge_factory: Arc::new(GeminiBridgeFactory::new(gemini_config)),
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router ---
    let app = create_router(app_state);

    // --- 5. Start Server ---
    info!(
        model = %config.gemini_model,
        voice = %config.gemini_voice,
        input_sample_rate = config.input_sample_rate,
        output_sample_rate = config.output_sample_rate,
        max_connections = config.max_connections,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let closed = registry.shutdown_all().await;
        info!(closed, "Closed all client connections.");
    })
    .await?;

    info!("Server has shut down.");
    Ok(())
}
