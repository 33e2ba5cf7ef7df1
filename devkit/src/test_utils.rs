/*!
Test Harness pour le coordinateur LoadGrid

Facilite l'écriture de tests du coordinateur avec:
- Démarrage d'une flotte de nœuds simulés
- Génération de la config YAML du kernel pointant vers ces nœuds
- Attente et assertions sur les mises à jour propagées
*/

use crate::mock_node::{MockNode, NodeBehavior};
use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

/// Harness de test : une flotte de nœuds simulés
pub struct TestHarness {
    nodes: Vec<MockNode>,
    propagation_secs: u64,
    query_secs: u64,
}

impl TestHarness {
    /// Crée un nouveau harness de test
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        Self {
            nodes: Vec::new(),
            propagation_secs: 1,
            query_secs: 1,
        }
    }

    /// Ajoute un nœud simulé avec le comportement donné
    pub async fn with_node(mut self, name: &str, behavior: NodeBehavior) -> Result<Self> {
        self.nodes.push(MockNode::start(name, behavior).await?);
        Ok(self)
    }

    /// Les quatre applications métier, toutes saines
    pub async fn business_fleet() -> Result<Self> {
        let mut harness = Self::new();
        for name in ["user_management", "payment_processing", "inventory_system", "notification_center"] {
            harness = harness.with_node(name, NodeBehavior::Healthy).await?;
        }
        Ok(harness)
    }

    pub fn with_timeouts(mut self, propagation_secs: u64, query_secs: u64) -> Self {
        self.propagation_secs = propagation_secs;
        self.query_secs = query_secs;
        self
    }

    pub fn node(&self, name: &str) -> Option<&MockNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn nodes(&self) -> &[MockNode] {
        &self.nodes
    }

    /// Config YAML du kernel pour cette flotte (`profile`: "business" ou "legacy")
    pub fn kernel_yaml(&self, profile: &str) -> String {
        let mut yaml = String::new();
        let _ = writeln!(yaml, "listen: \"127.0.0.1:0\"");
        let _ = writeln!(yaml, "profile: {}", profile);
        let _ = writeln!(yaml, "timeouts:");
        let _ = writeln!(yaml, "  propagation_secs: {}", self.propagation_secs);
        let _ = writeln!(yaml, "  query_secs: {}", self.query_secs);
        let _ = writeln!(yaml, "nodes:");
        for node in &self.nodes {
            let _ = writeln!(yaml, "  {}:", node.name());
            let _ = writeln!(yaml, "    url: \"{}\"", node.url());
        }
        yaml
    }

    /// Attend qu'un nœud ait reçu au moins `count` mises à jour de niveaux
    pub async fn wait_for_pushes(&self, name: &str, count: usize, timeout_ms: u64) -> Result<Vec<Value>> {
        let node = self
            .node(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown mock node: {}", name))?;
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            let pushes = node.level_pushes();
            if pushes.len() >= count {
                log::info!("✅ {} received {} level update(s)", name, pushes.len());
                return Ok(pushes);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        anyhow::bail!("Timeout waiting for {} level update(s) on {}", count, name);
    }

    /// Nombre total de `POST /resources` reçus par la flotte
    pub fn total_pushes(&self) -> usize {
        self.nodes.iter().map(|n| n.level_pushes().len()).sum()
    }

    /// Stats sur les requêtes reçues
    pub fn get_stats(&self) -> TestStats {
        let per_node: BTreeMap<String, usize> = self
            .nodes
            .iter()
            .map(|n| (n.name().to_string(), n.received().len()))
            .collect();

        TestStats {
            total_requests: per_node.values().sum(),
            per_node,
        }
    }

    /// Reset les requêtes enregistrées
    pub fn reset(&self) {
        for node in &self.nodes {
            node.clear();
        }
        log::info!("🧹 Test harness reset");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_requests: usize,
    pub per_node: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_harness_builds_fleet_and_yaml() {
        let harness = TestHarness::business_fleet().await.unwrap().with_timeouts(2, 1);
        assert_eq!(harness.nodes().len(), 4);

        let yaml = harness.kernel_yaml("business");
        assert!(yaml.contains("profile: business"));
        assert!(yaml.contains("propagation_secs: 2"));
        let url = harness.node("inventory_system").unwrap().url().to_string();
        assert!(yaml.contains(&url));
    }

    #[tokio::test]
    async fn test_wait_for_pushes() {
        let harness = TestHarness::new()
            .with_node("inventory_system", NodeBehavior::Healthy)
            .await
            .unwrap();
        let url = harness.node("inventory_system").unwrap().url().to_string();

        reqwest::Client::new()
            .post(format!("{url}/resources"))
            .json(&json!({"orders": 5}))
            .send()
            .await
            .unwrap();

        let pushes = harness.wait_for_pushes("inventory_system", 1, 1000).await.unwrap();
        assert_eq!(pushes, vec![json!({"orders": 5})]);
        assert_eq!(harness.total_pushes(), 1);
        assert_eq!(harness.get_stats().total_requests, 1);

        harness.reset();
        assert_eq!(harness.total_pushes(), 0);
        assert!(harness.wait_for_pushes("missing", 1, 10).await.is_err());
    }
}
