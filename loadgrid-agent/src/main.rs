//! LoadGrid Agent - one node of the load simulation grid
//!
//! This agent turns intensity levels pushed by the kernel into real load:
//! - CPU duty-cycle workers, a memory ballast and synthetic outbound traffic
//! - a running/idle state machine with hysteresis
//! - metrics blended from simulation, host counters and the telemetry gateway
//! - an HTTP API for levels, metrics and health

mod config;
mod http;
mod load;
mod manager;
mod metrics;
mod telemetry;

use anyhow::{Context, Result};
use config::AgentConfig;
use futures::future::join_all;
use http::AppState;
use manager::ResourceManager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("loadgrid_agent=info,tower_http=info")),
        )
        .init();

    let config = AgentConfig::load()
        .await
        .context("Failed to load agent configuration")?;

    info!(
        "LoadGrid Agent v{} starting - node: {}, profile: {:?}",
        env!("CARGO_PKG_VERSION"),
        config.node.name,
        config.node.profile
    );

    let manager = ResourceManager::new(&config);
    manager.start().await;

    // background telemetry refreshers
    let refresh_token = CancellationToken::new();
    let refreshers = manager.blender().spawn_refreshers(refresh_token.clone());

    let app = http::build_router(AppState { manager: manager.clone() });

    let listener = TcpListener::bind(&config.node.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.node.listen))?;
    info!("Listening on http://{}", config.node.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    refresh_token.cancel();
    for joined in join_all(refreshers).await {
        if let Err(e) = joined {
            warn!("Telemetry refresher ended abnormally: {}", e);
        }
    }
    manager.shutdown().await;

    info!("Agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
