use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloudpool_backends::{from_config, UnionCoordinator};
use cloudpool_cache::{spawn_ttl_sweeper, CacheStore};
use cloudpool_server::config::GatewayConfig;
use cloudpool_server::quota::Unlimited;
use cloudpool_server::routes;
use cloudpool_server::state::AppState;
use cloudpool_server::streamer::RangeStreamer;

const DEFAULT_CONFIG_PATH: &str = "cloudpool.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("cloudpool-server starting");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = GatewayConfig::load(&config_path)?;
    info!(path = %config_path.display(), backends = config.backends.len(), "Configuration loaded");

    // Build the backend union
    let union_config = config.union_config();
    let transfer_timeout = union_config.transfer_timeout;
    let mut union = UnionCoordinator::new(union_config);
    for backend in &config.backends {
        let adapter = from_config(backend, &config.rclone, transfer_timeout)
            .with_context(|| format!("Failed to configure backend {}", backend.name))?;
        union.add_backend(adapter, backend.priority)?;
        info!(backend = %backend.name, priority = backend.priority, "Backend registered");
    }
    let union = Arc::new(union);
    if !union.is_available().await {
        warn!("No backend answered its first probe; serving anyway");
    }

    // Open the cache (recovers the checkpointed index)
    let cache = Arc::new(
        CacheStore::open(config.cache_config())
            .with_context(|| format!("Failed to open cache at {}", config.cache.dir.display()))?,
    );
    let stats = cache.stats();
    info!(entries = stats.entries, bytes = stats.current_bytes, "Cache ready");

    let shutdown = CancellationToken::new();
    let sweeper = spawn_ttl_sweeper(Arc::clone(&cache), shutdown.clone());

    let streamer = RangeStreamer::new(Arc::clone(&union), Arc::clone(&cache), Arc::new(Unlimited));
    let state = Arc::new(AppState::new(streamer));
    let app = routes::build_router(state).layer(TraceLayer::new_for_http());

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, "Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "TTL sweeper task failed");
    }
    match cache.checkpoint() {
        Ok(()) => info!("Cache index checkpointed"),
        Err(e) => error!(error = %e, "Failed to checkpoint cache index"),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
