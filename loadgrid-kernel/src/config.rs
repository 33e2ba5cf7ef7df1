/**
 * CONFIGURATION KERNEL - Flotte de nœuds et délais de propagation
 *
 * RÔLE :
 * Charge `kernel.yaml` (ou `$LOADGRID_KERNEL_CONFIG`) : adresse d'écoute, profil de ressources,
 * délais, et pour chaque nœud son URL, les clés auxquelles il est abonné et son nombre
 * d'instances. Fichier absent ou invalide => flotte métier par défaut sur localhost:8001..8004.
 *
 * SURCHARGES :
 * `LOADGRID_NODE_<NOM>_URL` remplace l'URL d'un nœud (nom en majuscules, `-` => `_`).
 */

use loadgrid_contracts::{ResourceKey, ResourceProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: String,
    pub profile: ResourceProfile,
    pub timeouts: TimeoutsConf,
    pub nodes: BTreeMap<String, NodeConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutsConf {
    pub propagation_secs: u64,
    pub query_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeConf {
    pub url: String,
    /// Clés reçues lors d'une diffusion (toutes si absent)
    #[serde(default)]
    pub keys: Option<Vec<ResourceKey>>,
    #[serde(default)]
    pub instances: Option<u32>,
}

impl Default for TimeoutsConf {
    fn default() -> Self {
        Self { propagation_secs: 10, query_secs: 5 }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        let apps = [
            ("user_management", 8001, 1),
            ("payment_processing", 8002, 3),
            ("inventory_system", 8003, 1),
            ("notification_center", 8004, 3),
        ];
        let nodes = apps
            .iter()
            .map(|(name, port, instances)| {
                (
                    name.to_string(),
                    NodeConf {
                        url: format!("http://localhost:{}", port),
                        keys: None,
                        instances: Some(*instances),
                    },
                )
            })
            .collect();

        Self {
            listen: "0.0.0.0:8000".into(),
            profile: ResourceProfile::Business,
            timeouts: TimeoutsConf::default(),
            nodes,
        }
    }
}

impl TimeoutsConf {
    pub fn propagation(&self) -> Duration {
        Duration::from_secs(self.propagation_secs)
    }

    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }
}

/// `inventory-system` et `inventory_system` désignent le même nœud
pub fn canonical_name(name: &str) -> String {
    name.trim().replace('-', "_")
}

impl KernelConfig {
    /// Nom configuré correspondant à `name`
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let wanted = canonical_name(name);
        self.nodes
            .keys()
            .find(|k| canonical_name(k) == wanted)
            .map(String::as_str)
    }

    /// Clés de diffusion d'un nœud : son abonnement, sinon tout le profil
    pub fn subscribed_keys(&self, node: &str) -> Vec<ResourceKey> {
        match self.nodes.get(node).and_then(|n| n.keys.clone()) {
            Some(keys) => keys,
            None => self.profile.keys().to_vec(),
        }
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, node) in self.nodes.iter_mut() {
            let var = format!("LOADGRID_NODE_{}_URL", canonical_name(name).to_uppercase());
            if let Some(url) = lookup(&var).filter(|v| !v.is_empty()) {
                info!("[config] {} -> {} (from {})", name, url, var);
                node.url = url;
            }
        }
    }
}

/// Parse un YAML de config ; vide => défauts
pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("LOADGRID_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());

    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[config] config invalide ({}): {}", path, e);
            KernelConfig::default()
        })
    } else {
        warn!("[config] pas de {}, usage config par défaut", path);
        KernelConfig::default()
    };

    cfg.apply_overrides(|key| std::env::var(key).ok());
    cfg
}
