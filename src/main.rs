//! MPD Mirror
//!
//! Serves the state of a Music Player Daemon over HTTP and WebSocket.

use mpd_mirror::{api, bus, cache, config, mpd, orchestrator, playlist};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mpd::Executor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mpd_mirror=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting MPD Mirror v{} ({})",
        env!("MIRROR_VERSION"),
        env!("MIRROR_GIT_SHA")
    );

    // Load configuration
    let config = config::load_config()?;
    tracing::info!(
        "Configuration loaded, port: {}, mpd: {}",
        config.port,
        config.mpd.addr()
    );

    // Control connection and idle watcher use separate sockets
    let options = config.mpd.client_options();
    // An unreachable server is retried in the background, not fatal
    let client = mpd::Client::start(config.mpd.addr(), options.clone()).await;
    let watcher = mpd::Watcher::start(config.mpd.addr(), options, Vec::new()).await;

    let bus = bus::create_bus();
    let cache = Arc::new(cache::ResourceCache::new(bus));
    let executor: Arc<dyn Executor> = Arc::new(client.clone());
    let engine = playlist::Engine::new(
        executor.clone(),
        cache.clone(),
        config.playlist.cap,
        config.mpd.background_timeout(),
    );

    // Subscribe before the initial resync so no event is lost
    let shutdown = CancellationToken::new();
    let events = watcher.events();
    let orchestrator =
        orchestrator::Orchestrator::new(executor.clone(), cache.clone(), engine.clone());
    let orchestrator_task = tokio::spawn(orchestrator.run(events, shutdown.clone()));

    let state = api::AppState::new(cache, engine.clone(), executor, config.ws.keepalive());
    let app = api::router(state)
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    // Start server with graceful shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup: stop event processing, then the connections
    tracing::info!("Shutting down...");
    shutdown.cancel();
    if let Err(e) = orchestrator_task.await {
        tracing::warn!("Orchestrator task ended abnormally: {}", e);
    }
    engine.settle().await;
    watcher.close().await;
    if let Err(e) = client.close().await {
        tracing::warn!("Failed to close MPD connection: {}", e);
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
