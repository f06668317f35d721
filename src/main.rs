//! predictive-cache server binary.
//!
//! Loads the configuration, starts the cache and its background schedules,
//! and serves the HTTP API until Ctrl-C.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use predictive_cache::cache::store::CacheStore;
use predictive_cache::config::{Cli, Config};
use predictive_cache::server::api::{build_router, AppState};
use predictive_cache::server::metrics::CacheMetrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "predictive_cache=debug,tower_http=debug"
    } else {
        "predictive_cache=info,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("predictive-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        max_bytes = config.memory.max_bytes,
        max_items = config.memory.max_items,
        default_ttl_ms = config.memory.default_ttl_ms,
        compression = config.compression.enabled,
        prefetch = config.prefetch.enabled,
        "Configuration loaded"
    );

    // Initialize the cache and its schedules.
    let cache = CacheStore::new(config.clone());
    cache.spawn_background();

    // Build application state.
    let state = Arc::new(AppState {
        cache: cache.clone(),
        metrics: CacheMetrics::new()?,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cache.destroy();
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
