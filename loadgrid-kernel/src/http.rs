/**
 * API REST LOADGRID - Serveur HTTP du coordinateur
 *
 * RÔLE :
 * Point d'entrée des dashboards et scripts : réglage des niveaux d'intensité, état et
 * métriques agrégés de la flotte.
 *
 * ROUTES :
 * - /health, /status (alias /services/status), /metrics
 * - /resources (GET snapshot, POST un nœud ou diffusion), /resources/all
 * - /apps/{name}/reset, /apps/{name}/running
 * - /telemetry/{name}/instances (source externe du nombre d'instances)
 *
 * ERREURS : toujours `{"error": "..."}` ; validation => 400, nœud inconnu => 404.
 * CORS permissif (clients dashboard).
 */

use crate::coordinator::{Coordinator, CoordinatorError, DispatchReport, MetricsEntry, NodeStatus, NodeUpdate};
use crate::health::{HealthTracker, KernelHealth};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use loadgrid_contracts::{ErrorBody, IntensityVector, RunningToggle};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub health_tracker: HealthTracker,
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let code = match self {
            CoordinatorError::UnknownNode(_) => StatusCode::NOT_FOUND,
            CoordinatorError::Validation(_) | CoordinatorError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (code, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

fn bad_body(rejection: JsonRejection) -> CoordinatorError {
    CoordinatorError::BadRequest(format!("invalid JSON body: {}", rejection.body_text()))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/services/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .route("/resources", get(get_resources).post(post_resources))
        .route("/resources/all", post(post_resources_all))
        .route("/apps/{name}/reset", post(reset_app))
        .route("/apps/{name}/running", post(set_app_running))
        .route("/telemetry/{name}/instances", get(get_instances))
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// GET /health (état du coordinateur)
async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let coordinator = &app.coordinator;
    Json(app.health_tracker.get_health(coordinator.config().nodes.len(), coordinator.pool_stats()))
}

// GET /status (santé de chaque nœud)
async fn get_status(State(app): State<AppState>) -> Json<BTreeMap<String, NodeStatus>> {
    Json(app.coordinator.status_all().await)
}

// GET /metrics (métriques de chaque nœud)
async fn get_metrics(State(app): State<AppState>) -> Json<BTreeMap<String, MetricsEntry>> {
    Json(app.coordinator.metrics_all().await)
}

// GET /resources (snapshot canonique)
async fn get_resources(State(app): State<AppState>) -> Json<BTreeMap<String, IntensityVector>> {
    Json(app.coordinator.resources())
}

// POST /resources ({app_name, levels} => un nœud, {levels} => diffusion)
async fn post_resources(
    State(app): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, CoordinatorError> {
    let Json(body) = body.map_err(bad_body)?;
    let levels = body
        .get("levels")
        .ok_or_else(|| CoordinatorError::BadRequest("missing field: levels".into()))?;

    match body.get("app_name") {
        None | Some(Value::Null) => {
            let report = app.coordinator.broadcast(levels).await?;
            Ok((StatusCode::ACCEPTED, Json(report)).into_response())
        }
        Some(Value::String(name)) => {
            let update = app.coordinator.set_one(name, levels).await?;
            Ok(Json(update).into_response())
        }
        Some(other) => Err(CoordinatorError::BadRequest(format!("app_name must be a string, got {}", other))),
    }
}

// POST /resources/all ({levels: {nœud: vecteur}})
async fn post_resources_all(
    State(app): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<DispatchReport>), CoordinatorError> {
    let Json(body) = body.map_err(bad_body)?;
    let entries = body
        .get("levels")
        .and_then(Value::as_object)
        .ok_or_else(|| CoordinatorError::BadRequest("levels must be an object keyed by app name".into()))?;

    Ok((StatusCode::ACCEPTED, Json(app.coordinator.set_all(entries).await)))
}

// POST /apps/{name}/reset
async fn reset_app(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<NodeUpdate>, CoordinatorError> {
    Ok(Json(app.coordinator.reset(&name).await?))
}

// POST /apps/{name}/running (forçage admin)
async fn set_app_running(
    State(app): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<RunningToggle>, JsonRejection>,
) -> Result<Json<NodeUpdate>, CoordinatorError> {
    let Json(toggle) = body.map_err(bad_body)?;
    Ok(Json(app.coordinator.set_running(&name, toggle.is_running).await?))
}

// GET /telemetry/{name}/instances
async fn get_instances(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, CoordinatorError> {
    let instances = app.coordinator.instances(&name)?;
    Ok(Json(json!({ "instances": instances })))
}
