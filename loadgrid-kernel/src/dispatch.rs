/**
 * POOL DE PROPAGATION - Envois supervisés vers les nœuds
 *
 * RÔLE :
 * Toute mise à jour sortante passe ici, qu'elle soit attendue (`run`, pour `set_one`,
 * reset, bascule running) ou lancée en arrière-plan (`dispatch`, pour `set_all` et la
 * diffusion). Les tâches d'arrière-plan vivent dans un `JoinSet` : jamais détachées,
 * récoltées au fil de l'eau (paniques loguées) et drainées à l'arrêt.
 *
 * ORDRE PAR NŒUD :
 * Chaque nœud a sa voie (un `tokio::sync::Mutex` tenu pendant l'appel HTTP) : deux envois
 * vers le même nœud ne se chevauchent jamais. La voie retient la dernière révision envoyée ;
 * un vecteur de révision inférieure ou égale arrive trop tard et n'est pas poussé.
 *
 * TRAÇABILITÉ :
 * Le dernier résultat par nœud est conservé (`last_propagation` de /status) ainsi que des
 * compteurs globaux (exposés par /health).
 */

use crate::nodes::{NodeClient, NodeCommand, PropagationError};
use crate::state::{new_rw_state, SharedRw};
use loadgrid_contracts::LevelsAck;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Résultat du dernier envoi vers un nœud
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropagationRecord {
    pub command: String,
    pub ok: bool,
    pub at: String, // RFC3339
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub superseded: u64,
}

#[derive(Default)]
struct PoolCounters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    superseded: AtomicU64,
}

/// Dernière révision envoyée à un nœud
type Lane = Arc<Mutex<u64>>;

/// Contexte partagé par toutes les tâches de propagation
#[derive(Clone)]
struct Propagator {
    client: NodeClient,
    limit: Duration,
    records: SharedRw<BTreeMap<String, PropagationRecord>>,
    counters: Arc<PoolCounters>,
    lanes: Arc<parking_lot::Mutex<HashMap<String, Lane>>>,
}

impl Propagator {
    fn lane(&self, node: &str) -> Lane {
        self.lanes.lock().entry(node.to_string()).or_default().clone()
    }

    /// `revision` : `None` pour les commandes hors snapshot (bascule running)
    async fn execute(
        &self,
        node: &str,
        url: &str,
        command: &NodeCommand,
        revision: Option<u64>,
        dispatch_id: Option<Uuid>,
    ) -> Result<LevelsAck, PropagationError> {
        let lane = self.lane(node);
        let mut sent = lane.lock().await;
        if let Some(revision) = revision {
            if revision <= *sent {
                self.counters.superseded.fetch_add(1, Ordering::Relaxed);
                debug!("[propagation] {} <- revision {} dropped, {} already sent", node, revision, *sent);
                return Err(PropagationError::Superseded);
            }
            *sent = revision;
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);

        let result = self.client.send(url, command, self.limit).await;

        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        match &result {
            Ok(ack) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!("[propagation] {} <- {} ok (running: {})", node, command.describe(), ack.running);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("[propagation] {} <- {} failed: {}", node, command.describe(), e);
            }
        }

        let record = PropagationRecord {
            command: match command {
                NodeCommand::Levels(_) => "levels",
                NodeCommand::Reset => "reset",
                NodeCommand::Running(_) => "running",
            }
            .to_string(),
            ok: result.is_ok(),
            at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            response_code: match &result {
                Ok(_) => Some(200),
                Err(e) => e.status_code(),
            },
            error: result.as_ref().err().map(|e| e.to_string()),
            dispatch_id,
        };
        self.records.write().insert(node.to_string(), record);

        result
    }
}

pub struct PropagationPool {
    propagator: Propagator,
    tasks: Mutex<JoinSet<()>>,
}

impl PropagationPool {
    pub fn new(client: NodeClient, limit: Duration) -> Self {
        Self {
            propagator: Propagator {
                client,
                limit,
                records: new_rw_state(BTreeMap::new()),
                counters: Arc::new(PoolCounters::default()),
                lanes: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            },
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Envoi attendu ; le résultat est aussi enregistré
    pub async fn run(
        &self,
        node: &str,
        url: &str,
        command: NodeCommand,
        revision: Option<u64>,
    ) -> Result<LevelsAck, PropagationError> {
        self.propagator.execute(node, url, &command, revision, None).await
    }

    /// Envoi en arrière-plan, rend la main immédiatement
    pub async fn dispatch(&self, node: String, url: String, command: NodeCommand, revision: u64, dispatch_id: Uuid) {
        let mut tasks = self.tasks.lock().await;
        reap(&mut tasks);

        let propagator = self.propagator.clone();
        tasks.spawn(async move {
            let _ = propagator
                .execute(&node, &url, &command, Some(revision), Some(dispatch_id))
                .await;
        });
    }

    /// Attend la fin de toutes les tâches en cours
    pub async fn wait_idle(&self) {
        let mut tasks = self.tasks.lock().await;
        let pending = tasks.len();
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        if pending > 0 {
            info!("[propagation] drained {} task(s)", pending);
        }
    }

    pub fn last(&self, node: &str) -> Option<PropagationRecord> {
        self.propagator.records.read().get(node).cloned()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.propagator.counters;
        PoolStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
        }
    }
}

/// Récolte les tâches déjà terminées sans attendre
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("[propagation] task panicked: {}", e);
        } else {
            warn!("[propagation] task cancelled: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadgrid_contracts::{IntensityVector, ResourceKey};
    use loadgrid_devkit::{MockNode, NodeBehavior};

    fn pool(limit_ms: u64) -> PropagationPool {
        PropagationPool::new(NodeClient::new().unwrap(), Duration::from_millis(limit_ms))
    }

    #[tokio::test]
    async fn test_run_records_outcome() {
        let ok = MockNode::healthy("inventory_system").await.unwrap();
        let down = MockNode::start("user_management", NodeBehavior::Down).await.unwrap();
        let pool = pool(500);

        let levels = NodeCommand::Levels(IntensityVector::new().with(ResourceKey::Storage, 40));
        assert!(pool.run("inventory_system", ok.url(), levels.clone(), Some(1)).await.is_ok());
        assert!(pool.run("user_management", down.url(), levels, Some(1)).await.is_err());

        let record = pool.last("inventory_system").unwrap();
        assert!(record.ok);
        assert_eq!(record.command, "levels");
        assert_eq!(record.dispatch_id, None);

        let record = pool.last("user_management").unwrap();
        assert!(!record.ok);
        assert!(record.error.unwrap().starts_with("transport error"));

        assert_eq!(
            pool.stats(),
            PoolStats { dispatched: 2, succeeded: 1, failed: 1, in_flight: 0, superseded: 0 }
        );
    }

    #[tokio::test]
    async fn test_dispatch_returns_before_slow_node_answers() {
        let hanging = MockNode::start("notification_center", NodeBehavior::Hanging).await.unwrap();
        let pool = pool(300);
        let id = Uuid::new_v4();

        let started = std::time::Instant::now();
        pool.dispatch("notification_center".into(), hanging.url().into(), NodeCommand::Reset, 1, id)
            .await;
        assert!(started.elapsed() < Duration::from_millis(200));

        pool.wait_idle().await;
        let record = pool.last("notification_center").unwrap();
        assert!(!record.ok);
        assert_eq!(record.dispatch_id, Some(id));
        assert!(record.error.unwrap().contains("timed out"));
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_older_revision_is_never_pushed_after_newer() {
        let node = MockNode::healthy("inventory_system").await.unwrap();
        let pool = pool(500);
        let newer = NodeCommand::Levels(IntensityVector::new().with(ResourceKey::Processing, 90));
        let older = NodeCommand::Levels(IntensityVector::new().with(ResourceKey::Processing, 10));

        assert!(pool.run("inventory_system", node.url(), newer, Some(2)).await.is_ok());
        assert_eq!(
            pool.run("inventory_system", node.url(), older, Some(1)).await,
            Err(PropagationError::Superseded)
        );

        assert_eq!(node.level_pushes().len(), 1);
        assert_eq!(node.levels().get(ResourceKey::Processing), 90);
        assert!(pool.last("inventory_system").unwrap().ok);
        assert_eq!(pool.stats().superseded, 1);
        assert_eq!(pool.stats().dispatched, 1);

        // hors snapshot : jamais écartée
        assert!(pool.run("inventory_system", node.url(), NodeCommand::Running(false), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_sends_to_one_node_never_overlap() {
        let node = MockNode::start("inventory_system", NodeBehavior::SlowFirst(300)).await.unwrap();
        let pool = pool(1_000);
        let id = Uuid::new_v4();

        let first = NodeCommand::Levels(IntensityVector::new().with(ResourceKey::Processing, 10));
        let second = NodeCommand::Levels(IntensityVector::new().with(ResourceKey::Processing, 90));
        pool.dispatch("inventory_system".into(), node.url().into(), first, 1, id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.dispatch("inventory_system".into(), node.url().into(), second, 2, id).await;

        pool.wait_idle().await;
        assert_eq!(node.levels().get(ResourceKey::Processing), 90);
        assert_eq!(pool.stats().failed, 0);
    }
}
