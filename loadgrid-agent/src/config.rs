//! Agent configuration
//!
//! Handles:
//! - node identity, listen address and resource profile
//! - hysteresis window of the running/idle state machine
//! - load generator bounds (memory cap, CPU burst, worker count, traffic targets, record batches)
//! - telemetry cadences and the external gateway
//!
//! Read from TOML, then patched by a few environment variables set by the deployment.

use anyhow::{Context, Result};
use loadgrid_contracts::{IntensityVector, ResourceProfile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node: NodeConfig,
    pub state: StateConfig,
    pub load: LoadConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub listen: String,
    pub profile: ResourceProfile,
    /// Levels applied at startup (missing keys start at 0)
    pub levels: IntensityVector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub hysteresis_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Memory held at level 100
    pub memory_cap_mb: u64,
    /// Length of one CPU work burst
    pub cpu_burst_ms: u64,
    /// Parallel CPU workers used at high levels
    pub max_cpu_workers: usize,
    /// Requests per second at traffic level 100
    pub traffic_max_rps: f64,
    /// Empty means the telemetry gateway, when one is configured
    pub traffic_targets: Vec<String>,
    pub traffic_timeout_ms: u64,
    /// Interval between two order/completion batches
    pub records_period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Running inside the deployment platform: prefer host counters over simulation
    pub hosted: bool,
    /// Base URL serving `/telemetry/{node}/metrics` and `/telemetry/{node}/instances`
    pub gateway_url: Option<String>,
    pub host_refresh_secs: u64,
    pub metrics_refresh_secs: u64,
    pub instances_refresh_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "loadgrid-node".to_string(),
            listen: "0.0.0.0:8001".to_string(),
            profile: ResourceProfile::Business,
            levels: IntensityVector::new(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { hysteresis_ms: 5_000 }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            memory_cap_mb: 200,
            cpu_burst_ms: 50,
            max_cpu_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            traffic_max_rps: 10.0,
            traffic_targets: Vec::new(),
            traffic_timeout_ms: 2_000,
            records_period_ms: 1_000,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            hosted: false,
            gateway_url: None,
            host_refresh_secs: 30,
            metrics_refresh_secs: 120,
            instances_refresh_secs: 60,
            request_timeout_secs: 5,
        }
    }
}

impl StateConfig {
    pub fn hysteresis_window(&self) -> Duration {
        Duration::from_millis(self.hysteresis_ms)
    }
}

impl LoadConfig {
    pub fn cpu_burst(&self) -> Duration {
        Duration::from_millis(self.cpu_burst_ms.max(1))
    }

    pub fn traffic_timeout(&self) -> Duration {
        Duration::from_millis(self.traffic_timeout_ms)
    }

    pub fn records_period(&self) -> Duration {
        Duration::from_millis(self.records_period_ms.max(1))
    }
}

impl TelemetryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AgentConfig {
    /// Load config from `$LOADGRID_AGENT_CONFIG` or the OS config dir, then apply env overrides
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            Self::load_from(&config_path).await?
        } else {
            tracing::info!("No config at {}, using defaults", config_path.display());
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Get config file path (env override first, then OS-specific location)
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("LOADGRID_AGENT_CONFIG") {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("loadgrid-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Deployment-provided overrides; `lookup` is `std::env::var` outside tests
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("LOADGRID_NODE_NAME").filter(|v| !v.is_empty()) {
            self.node.name = name;
        }
        if let Some(port) = lookup("PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.node.listen = format!("0.0.0.0:{port}");
        }
        if let Some(hosted) = lookup("LOADGRID_HOSTED") {
            self.telemetry.hosted = matches!(hosted.as_str(), "1" | "true" | "yes");
        }
        if let Some(url) = lookup("LOADGRID_GATEWAY_URL").filter(|v| !v.is_empty()) {
            self.telemetry.gateway_url = Some(url);
        }
        if let Some(targets) = lookup("LOADGRID_TRAFFIC_TARGETS") {
            self.load.traffic_targets = targets
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Load settings with traffic aimed at the gateway when no explicit target is set
    pub fn effective_load(&self) -> LoadConfig {
        let mut load = self.load.clone();
        if load.traffic_targets.is_empty() {
            if let Some(gateway) = &self.telemetry.gateway_url {
                load.traffic_targets = vec![gateway.clone()];
            }
        }
        load
    }

    /// Re-checks startup levels against the profile (serde does not range-check them)
    pub fn validate(&self) -> Result<()> {
        let rps = self.load.traffic_max_rps;
        if !rps.is_finite() || rps <= 0.0 {
            anyhow::bail!("load.traffic_max_rps must be a positive number, got {}", rps);
        }

        let raw = serde_json::to_value(&self.node.levels)?;
        IntensityVector::parse(self.node.profile, &raw)
            .with_context(|| format!("Invalid startup levels for node {}", self.node.name))?;
        Ok(())
    }
}
