/**
 * COORDINATEUR - Diffusion des niveaux et agrégation de la flotte
 *
 * RÔLE :
 * Valide les vecteurs d'intensité, tient le snapshot canonique et propage vers les nœuds.
 * - `set_one` : un nœud, propagation attendue (résultat dans `propagation`)
 * - `set_all` / `broadcast` : plusieurs nœuds, envois en arrière-plan via le pool
 * - `status_all` / `metrics_all` : interrogation concurrente, une entrée par nœud quoi qu'il arrive
 *
 * RÈGLE : le snapshot reflète ce qui a été demandé. Une propagation qui échoue ne l'annule
 * jamais et ne fait jamais échouer la requête du client. Chaque envoi porte la révision du
 * snapshot qu'il reflète, le pool garantit qu'un nœud finit sur la plus récente.
 */

use crate::config::KernelConfig;
use crate::dispatch::{PoolStats, PropagationPool, PropagationRecord};
use crate::nodes::{NodeClient, NodeCommand, PropagationError};
use crate::snapshot::CanonicalSnapshot;
use futures::future::join_all;
use loadgrid_contracts::{ErrorBody, IntensityVector, LevelsAck, NodeMetrics, ValidationError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Unknown app: {0}")]
    UnknownNode(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    BadRequest(String),
}

/// Résultat d'un envoi attendu
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropagationOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Réponse des opérations sur un seul nœud
#[derive(Debug, Clone, Serialize)]
pub struct NodeUpdate {
    pub status: String,
    pub app_name: String,
    pub levels: IntensityVector,
    /// État running rapporté par le nœud (absent si la propagation a échoué)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    pub propagation: PropagationOutcome,
}

/// Réponse de `set_all` et de la diffusion : les envois partent en arrière-plan
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub status: String,
    pub dispatch_id: Uuid,
    pub updated: BTreeMap<String, IntensityVector>,
    pub skipped: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatusKind {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub status: NodeStatusKind,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_propagation: Option<PropagationRecord>,
}

/// Entrée de `/metrics` : les métriques du nœud ou l'erreur rencontrée
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MetricsEntry {
    Metrics(Box<NodeMetrics>),
    Error(ErrorBody),
}

pub struct Coordinator {
    config: KernelConfig,
    snapshot: CanonicalSnapshot,
    client: NodeClient,
    pool: PropagationPool,
}

impl Coordinator {
    pub fn new(config: KernelConfig) -> Result<Self, reqwest::Error> {
        let client = NodeClient::new()?;
        let snapshot = CanonicalSnapshot::new(config.profile, config.nodes.keys().map(String::as_str));
        let pool = PropagationPool::new(client.clone(), config.timeouts.propagation());

        info!(
            "[coordinator] {} node(s), profile {:?}",
            config.nodes.len(),
            config.profile
        );
        Ok(Self { config, snapshot, client, pool })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn known(&self, name: &str) -> Result<(String, String), CoordinatorError> {
        let node = self
            .config
            .resolve(name)
            .ok_or_else(|| CoordinatorError::UnknownNode(name.to_string()))?;
        let url = self.config.nodes[node].url.clone();
        Ok((node.to_string(), url))
    }

    /// Un nœud : fusion dans le snapshot puis envoi du vecteur complet, attendu
    pub async fn set_one(&self, name: &str, levels: &Value) -> Result<NodeUpdate, CoordinatorError> {
        let (node, url) = self.known(name)?;
        let partial = IntensityVector::parse(self.config.profile, levels)?;
        let merged = self.snapshot.merge(&node, &partial);
        info!("[coordinator] {} <- {:?} (revision {})", node, partial, merged.number);

        let result = self
            .pool
            .run(&node, &url, NodeCommand::Levels(merged.levels.clone()), Some(merged.number))
            .await;
        Ok(update_response("updated", node, merged.levels, result))
    }

    /// Plusieurs nœuds : chaque entrée est validée seule, les invalides sont ignorées
    pub async fn set_all(&self, entries: &Map<String, Value>) -> DispatchReport {
        let dispatch_id = Uuid::new_v4();
        let mut updated = BTreeMap::new();
        let mut skipped = BTreeMap::new();

        for (name, raw) in entries {
            let checked = self.known(name).and_then(|(node, url)| {
                let partial = IntensityVector::parse(self.config.profile, raw)?;
                Ok((node, url, partial))
            });
            match checked {
                Ok((node, url, partial)) => {
                    let merged = self.snapshot.merge(&node, &partial);
                    let command = NodeCommand::Levels(merged.levels.clone());
                    self.pool
                        .dispatch(node.clone(), url, command, merged.number, dispatch_id)
                        .await;
                    updated.insert(node, merged.levels);
                }
                Err(e) => {
                    warn!("[coordinator] skipping {}: {}", name, e);
                    skipped.insert(name.clone(), e.to_string());
                }
            }
        }

        info!(
            "[coordinator] dispatch {}: {} updated, {} skipped",
            dispatch_id,
            updated.len(),
            skipped.len()
        );
        DispatchReport { status: "accepted".into(), dispatch_id, updated, skipped }
    }

    /// Même vecteur pour toute la flotte ; chaque nœud ne reçoit que ses clés abonnées
    pub async fn broadcast(&self, levels: &Value) -> Result<DispatchReport, CoordinatorError> {
        let vector = IntensityVector::parse(self.config.profile, levels)?;
        let dispatch_id = Uuid::new_v4();
        let mut updated = BTreeMap::new();

        for (node, conf) in &self.config.nodes {
            let keys = self.config.subscribed_keys(node);
            let partial = vector.restricted_to(&keys);
            if partial.is_empty() {
                continue;
            }
            let merged = self.snapshot.merge(node, &partial);
            let levels = merged.levels.restricted_to(&keys);
            let command = NodeCommand::Levels(levels.clone());
            self.pool
                .dispatch(node.clone(), conf.url.clone(), command, merged.number, dispatch_id)
                .await;
            updated.insert(node.clone(), levels);
        }

        info!("[coordinator] broadcast {} to {} node(s)", dispatch_id, updated.len());
        Ok(DispatchReport { status: "accepted".into(), dispatch_id, updated, skipped: BTreeMap::new() })
    }

    pub async fn reset(&self, name: &str) -> Result<NodeUpdate, CoordinatorError> {
        let (node, url) = self.known(name)?;
        let zeroed = self.snapshot.reset(&node);
        info!("[coordinator] reset {}", node);

        let result = self.pool.run(&node, &url, NodeCommand::Reset, Some(zeroed.number)).await;
        Ok(update_response("reset", node, zeroed.levels, result))
    }

    /// Forçage admin de l'état running d'un nœud
    pub async fn set_running(&self, name: &str, running: bool) -> Result<NodeUpdate, CoordinatorError> {
        let (node, url) = self.known(name)?;
        let levels = self.snapshot.get(&node).unwrap_or_default();

        let result = self.pool.run(&node, &url, NodeCommand::Running(running), None).await;
        let status = if running { "running" } else { "stopped" };
        Ok(update_response(status, node, levels, result))
    }

    pub fn resources(&self) -> BTreeMap<String, IntensityVector> {
        self.snapshot.all()
    }

    /// Nombre d'instances déclaré en configuration (1 par défaut)
    pub fn instances(&self, name: &str) -> Result<u32, CoordinatorError> {
        let (node, _) = self.known(name)?;
        Ok(self.config.nodes[&node].instances.unwrap_or(1))
    }

    pub async fn status_all(&self) -> BTreeMap<String, NodeStatus> {
        let limit = self.config.timeouts.query();
        let checks = self.config.nodes.iter().map(|(node, conf)| async move {
            let outcome = self.client.health(&conf.url, limit).await;
            let (status, response_code, error) = match outcome {
                Ok(200) => (NodeStatusKind::Healthy, Some(200), None),
                Ok(code) => (NodeStatusKind::Unhealthy, Some(code), None),
                Err(e) => (NodeStatusKind::Unhealthy, None, Some(e.to_string())),
            };
            let entry = NodeStatus {
                status,
                url: conf.url.clone(),
                response_code,
                error,
                last_propagation: self.pool.last(node),
            };
            (node.clone(), entry)
        });

        join_all(checks).await.into_iter().collect()
    }

    pub async fn metrics_all(&self) -> BTreeMap<String, MetricsEntry> {
        let limit = self.config.timeouts.query();
        let queries = self.config.nodes.iter().map(|(node, conf)| async move {
            let entry = match self.client.metrics(&conf.url, limit).await {
                Ok(metrics) => MetricsEntry::Metrics(Box::new(metrics)),
                Err(e) => {
                    warn!("[coordinator] metrics from {} failed: {}", node, e);
                    MetricsEntry::Error(ErrorBody::new(e.to_string()))
                }
            };
            (node.clone(), entry)
        });

        join_all(queries).await.into_iter().collect()
    }

    /// Attend la fin des propagations en cours
    pub async fn shutdown(&self) {
        self.pool.wait_idle().await;
    }
}

fn update_response(
    status: &str,
    node: String,
    levels: IntensityVector,
    result: Result<LevelsAck, PropagationError>,
) -> NodeUpdate {
    let (running, propagation) = match result {
        Ok(ack) => (Some(ack.running), PropagationOutcome { ok: true, error: None }),
        Err(e) => (None, PropagationOutcome { ok: false, error: Some(e.to_string()) }),
    };
    NodeUpdate { status: status.to_string(), app_name: node, levels, running, propagation }
}
