//! HTTP API of a node
//!
//! Routes:
//! - `GET /` service info and live generator status
//! - `GET /health`
//! - `GET /metrics` (alias `GET /system`)
//! - `GET /resources`, `POST /resources` (partial level vector), `POST /resources/reset`
//! - `POST /system/running` `{is_running}`
//!
//! Every error answers `{"error": "..."}`.

use crate::manager::{NodeState, ResourceManager};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use loadgrid_contracts::{
    ErrorBody, IntensityVector, LevelsAck, NodeHealth, NodeMetrics, RunningToggle, ValidationError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ResourceManager>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("invalid JSON body: {0}")]
    Body(#[from] JsonRejection),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/system", get(metrics))
        .route("/system/running", post(set_running))
        .route("/resources", get(get_resources).post(update_resources))
        .route("/resources/reset", post(reset_resources))
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// GET / (node identity + generator)
async fn index(State(app): State<AppState>) -> Json<Value> {
    let manager = &app.manager;
    Json(json!({
        "service": "loadgrid-agent",
        "version": env!("CARGO_PKG_VERSION"),
        "node": manager.node(),
        "profile": manager.profile(),
        "running": manager.state().running,
        "load": manager.generator_status().await,
    }))
}

async fn health(State(app): State<AppState>) -> Json<NodeHealth> {
    Json(app.manager.health())
}

async fn metrics(State(app): State<AppState>) -> Json<NodeMetrics> {
    Json(app.manager.metrics())
}

async fn get_resources(State(app): State<AppState>) -> Json<NodeState> {
    Json(app.manager.state())
}

// POST /resources (partial update)
async fn update_resources(
    State(app): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<LevelsAck>, ApiError> {
    let Json(raw) = body?;
    let partial = IntensityVector::parse(app.manager.profile(), &raw)?;
    info!("Level update on {}: {:?}", app.manager.node(), partial);
    Ok(Json(app.manager.update(&partial).await))
}

async fn reset_resources(State(app): State<AppState>) -> Json<LevelsAck> {
    Json(app.manager.reset().await)
}

async fn set_running(
    State(app): State<AppState>,
    body: Result<Json<RunningToggle>, JsonRejection>,
) -> Result<Json<LevelsAck>, ApiError> {
    let Json(toggle) = body?;
    Ok(Json(app.manager.set_running(toggle.is_running).await))
}
