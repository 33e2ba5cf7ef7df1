/*!
Nœud simulé pour tester le coordinateur sans agent réel

Chaque `MockNode` est un petit serveur axum sur un port éphémère qui imite l'API d'un agent
(`/health`, `/metrics`, `/resources`, `/resources/reset`, `/system/running`) et enregistre
toutes les requêtes reçues. Le comportement est fixé à la création : sain, en échec,
bloqué (ne répond jamais), lent au premier appel ou éteint (port fermé).
*/

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use loadgrid_contracts::{
    ErrorBody, HealthStatus, IntensityVector, LevelsAck, MetricsSample, MetricsSource, NodeHealth,
    NodeMetrics, ResourceProfile, ResourceRole, RunningToggle,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Comportement d'un nœud simulé
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBehavior {
    /// Répond comme un agent
    Healthy,
    /// Répond toujours avec ce code HTTP
    Failing(u16),
    /// Accepte la connexion mais ne répond jamais
    Hanging,
    /// Le premier appel est appliqué après ce délai (ms), les suivants comme `Healthy`
    SlowFirst(u64),
    /// Aucun serveur derrière l'URL
    Down,
}

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
}

#[derive(Default)]
struct NodeData {
    levels: IntensityVector,
    running: bool,
    last_transition: Option<DateTime<Utc>>,
    received: Vec<ReceivedRequest>,
}

impl NodeData {
    fn is_first(&self) -> bool {
        self.received.len() == 1
    }
}

#[derive(Clone)]
struct MockState {
    name: String,
    behavior: NodeBehavior,
    data: Arc<Mutex<NodeData>>,
}

pub struct MockNode {
    name: String,
    url: String,
    state: MockState,
    server: Option<JoinHandle<()>>,
}

impl MockNode {
    /// Démarre un nœud simulé sur 127.0.0.1 (port éphémère)
    pub async fn start(name: &str, behavior: NodeBehavior) -> Result<Self> {
        let state = MockState {
            name: name.to_string(),
            behavior,
            data: Arc::new(Mutex::new(NodeData::default())),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{}", addr);

        let server = if behavior == NodeBehavior::Down {
            // le port est libéré : les connexions seront refusées
            drop(listener);
            None
        } else {
            let router = Router::new().fallback(handle).with_state(state.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    log::warn!("[mock] server stopped: {}", e);
                }
            }))
        };

        log::info!("🧪 [MOCK] node {} ({:?}) on {}", name, behavior, url);
        Ok(Self { name: name.to_string(), url, state, server })
    }

    pub async fn healthy(name: &str) -> Result<Self> {
        Self::start(name, NodeBehavior::Healthy).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Toutes les requêtes reçues (pour assertions de tests)
    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.state.data.lock().received.clone()
    }

    /// Corps des `POST /resources` reçus, dans l'ordre
    pub fn level_pushes(&self) -> Vec<Value> {
        self.find_requests("POST", "/resources")
            .into_iter()
            .map(|r| r.body)
            .collect()
    }

    pub fn find_requests(&self, method: &str, path: &str) -> Vec<ReceivedRequest> {
        self.state
            .data
            .lock()
            .received
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .cloned()
            .collect()
    }

    /// Niveaux actuellement tenus par le nœud simulé
    pub fn levels(&self) -> IntensityVector {
        self.state.data.lock().levels.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.data.lock().running
    }

    /// Reset des requêtes enregistrées
    pub fn clear(&self) {
        self.state.data.lock().received.clear();
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

async fn handle(State(state): State<MockState>, method: Method, uri: Uri, body: Bytes) -> Response {
    let path = uri.path().to_string();
    let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let first = {
        let mut data = state.data.lock();
        data.received.push(ReceivedRequest {
            method: method.to_string(),
            path: path.clone(),
            body: parsed.clone(),
        });
        data.is_first()
    };

    match state.behavior {
        NodeBehavior::Hanging => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
        NodeBehavior::Failing(code) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(ErrorBody::new("simulated failure"))).into_response()
        }
        NodeBehavior::SlowFirst(delay_ms) => {
            if first {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            respond(&state, &method, &path, parsed)
        }
        NodeBehavior::Healthy | NodeBehavior::Down => respond(&state, &method, &path, parsed),
    }
}

fn respond(state: &MockState, method: &Method, path: &str, body: Value) -> Response {
    let mut data = state.data.lock();

    match (method.as_str(), path) {
        ("GET", "/health") => Json(NodeHealth {
            status: HealthStatus::Healthy,
            node: state.name.clone(),
            uptime_seconds: 0,
            running: data.running,
        })
        .into_response(),

        ("GET", "/metrics") | ("GET", "/system") => Json(metrics_of(&state.name, &data)).into_response(),

        ("POST", "/resources") => match serde_json::from_value::<IntensityVector>(body) {
            Ok(partial) => {
                data.levels.merge(&partial);
                let running = !data.levels.is_idle();
                set_running(&mut data, running);
                Json(ack(&state.name, "updated", &data)).into_response()
            }
            Err(e) => (StatusCode::BAD_REQUEST, Json(ErrorBody::new(e.to_string()))).into_response(),
        },

        ("POST", "/resources/reset") => {
            let keys: Vec<_> = data.levels.iter().map(|(k, _)| (k, 0)).collect();
            data.levels = keys.into_iter().collect();
            set_running(&mut data, false);
            Json(ack(&state.name, "reset", &data)).into_response()
        }

        ("POST", "/system/running") => {
            let toggle: RunningToggle = serde_json::from_value(body).unwrap_or(RunningToggle { is_running: false });
            set_running(&mut data, toggle.is_running);
            let status = if toggle.is_running { "running" } else { "stopped" };
            Json(ack(&state.name, status, &data)).into_response()
        }

        _ => (StatusCode::NOT_FOUND, Json(ErrorBody::new(format!("no route {} {}", method, path)))).into_response(),
    }
}

fn set_running(data: &mut NodeData, running: bool) {
    if data.running != running {
        data.running = running;
        data.last_transition = Some(Utc::now());
    }
}

fn ack(name: &str, status: &str, data: &NodeData) -> LevelsAck {
    LevelsAck {
        status: status.to_string(),
        app_name: name.to_string(),
        levels: data.levels.clone(),
        running: data.running,
    }
}

fn metrics_of(name: &str, data: &NodeData) -> NodeMetrics {
    // profil déduit des clés reçues : un nœud simulé accepte les deux
    let profile = if data.levels.iter().any(|(k, _)| ResourceProfile::Legacy.recognizes(k)) {
        ResourceProfile::Legacy
    } else {
        ResourceProfile::Business
    };
    let cpu = f64::from(data.levels.level_for(profile, ResourceRole::Cpu));
    let memory = f64::from(data.levels.level_for(profile, ResourceRole::Memory));

    let mut sample = MetricsSample::idle(Some(1));
    if data.running {
        sample.running = true;
        sample.cpu_percent = (cpu * 1.3).min(100.0);
        sample.memory_percent = memory.min(100.0);
        sample.memory_used_mb = (memory * 3.52).round() as u64;
        sample.source = MetricsSource::Simulation;
    }

    NodeMetrics {
        node: name.to_string(),
        sample,
        levels: data.levels.clone(),
        request_count: 0,
        error_count: 0,
        orders_processed: 0,
        completions_processed: 0,
        last_transition: data.last_transition,
    }
}
