/**
 * LOADGRID KERNEL - Point d'entrée du coordinateur
 *
 * RÔLE : Charge la config de flotte, construit le coordinateur (snapshot canonique, client
 * nœuds, pool de propagation) et sert l'API REST.
 *
 * ARRÊT : Ctrl-C => le serveur cesse d'accepter, puis les propagations en cours sont drainées.
 */

mod config;
mod coordinator;
mod dispatch;
mod health;
mod http;
mod nodes;
mod snapshot;
mod state;

use crate::config::load_config;
use crate::coordinator::Coordinator;
use crate::health::HealthTracker;
use crate::http::AppState;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("loadgrid_kernel=info,tower_http=info")),
        )
        .init();

    let cfg = load_config().await;
    let listen = cfg.listen.clone();

    let coordinator = Arc::new(Coordinator::new(cfg).context("failed to build node HTTP client")?);
    let app_state = AppState {
        coordinator: coordinator.clone(),
        health_tracker: HealthTracker::new(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    info!("[kernel] listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    coordinator.shutdown().await;
    info!("[kernel] stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[kernel] cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("[kernel] shutdown requested");
}
