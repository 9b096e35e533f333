//! FileCache - quota managed file cache service

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::{Config, LoggingConfig};
use filecache_api::{AppState, create_router};
use filecache_core::{CacheManager, spawn_maintenance_task};
use filecache_storage::LocalObjectStore;

/// FileCache - quota managed file cache service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "FILECACHE_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "FILECACHE_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args.config)?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting FileCache v{}", env!("CARGO_PKG_VERSION"));

    // Install the metrics recorder before anything records
    let metrics_handle = if config.metrics.enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install metrics recorder")?;
        filecache_api::routes::metrics::describe_metrics();
        Some(Arc::new(handle))
    } else {
        None
    };

    // Initialize object store
    let storage = Arc::new(
        LocalObjectStore::new(&config.cache.base_dir)
            .await
            .with_context(|| format!("Failed to open cache root {:?}", config.cache.base_dir))?,
    );

    // Initialize cache manager, restoring what is on disk
    let cache = Arc::new(CacheManager::open(storage, config.cache.manager_config()).await?);
    cache.ensure_types(&config.types).await?;

    let maintenance = spawn_maintenance_task(cache.clone(), config.cache.maintenance_interval_secs);

    // Create router
    let state = AppState::new(cache.clone(), &config.service.name);
    let app = create_router(state, metrics_handle).layer(TraceLayer::new_for_http());

    // Determine bind address
    let bind_addr = args.bind.unwrap_or(config.server.bind_address);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind_addr, port).parse()?;

    info!("Listening on {}", addr);
    info!("Serving bus name {}", config.service.name);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    if let Err(e) = cache.shutdown().await {
        warn!("Cache shutdown incomplete: {}", e);
    }

    info!("Server stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}
