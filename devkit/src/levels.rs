/*!
Builders pour les corps de requêtes de niveaux

Les valeurs sont des `serde_json::Value` brutes : un test peut construire aussi bien une
requête valide qu'une requête que le coordinateur doit rejeter (`{"cpu": 150}`, clé inconnue,
valeur non entière...).
*/

use serde_json::{json, Map, Value};

/// Vecteur de niveaux au format JSON
#[derive(Debug, Clone, Default)]
pub struct LevelsBuilder {
    levels: Map<String, Value>,
}

impl LevelsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.levels.insert(key.to_string(), value.into());
        self
    }

    /// `{"processing": p, "storage": s, "traffic": t}`
    pub fn business(processing: u8, storage: u8, traffic: u8) -> Self {
        Self::new()
            .set("processing", processing)
            .set("storage", storage)
            .set("traffic", traffic)
    }

    /// `{"cpu": c, "memory": m, "network": n}`
    pub fn legacy(cpu: u8, memory: u8, network: u8) -> Self {
        Self::new().set("cpu", cpu).set("memory", memory).set("network", network)
    }

    pub fn build(&self) -> Value {
        Value::Object(self.levels.clone())
    }

    /// Corps `POST /resources` ciblant un seul nœud
    pub fn for_app(&self, app_name: &str) -> Value {
        json!({ "app_name": app_name, "levels": self.build() })
    }

    /// Corps `POST /resources` sans `app_name` (diffusion)
    pub fn broadcast(&self) -> Value {
        json!({ "levels": self.build() })
    }
}

/// Corps `POST /resources/all` : un vecteur par nœud
#[derive(Debug, Clone, Default)]
pub struct FleetLevels {
    nodes: Map<String, Value>,
}

impl FleetLevels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, name: &str, levels: LevelsBuilder) -> Self {
        self.nodes.insert(name.to_string(), levels.build());
        self
    }

    /// Entrée brute, pour les cas invalides (vecteur qui n'est pas un objet...)
    pub fn raw(mut self, name: &str, value: Value) -> Self {
        self.nodes.insert(name.to_string(), value);
        self
    }

    pub fn build(&self) -> Value {
        json!({ "levels": Value::Object(self.nodes.clone()) })
    }
}
