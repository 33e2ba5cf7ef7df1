//! Metrics and health bodies reported by nodes

use crate::resources::IntensityVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the CPU/memory figures of a sample come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsSource {
    /// Derived from intensity levels
    Simulation,
    /// Read from host/container counters
    Container,
    /// Local figures combined with external telemetry
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: u64,
    /// `None` while no source has reported it yet
    pub instance_count: Option<u32>,
    #[serde(alias = "is_running")]
    pub running: bool,
    pub source: MetricsSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_updated_at: Option<DateTime<Utc>>,
}

impl MetricsSample {
    /// Zero-valued sample of an idle node
    pub fn idle(instance_count: Option<u32>) -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_used_mb: 0,
            instance_count,
            running: false,
            source: MetricsSource::Simulation,
            external_cpu_percent: None,
            external_memory_percent: None,
            external_updated_at: None,
        }
    }
}

/// Body of a node's `GET /metrics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node: String,
    #[serde(flatten)]
    pub sample: MetricsSample,
    pub levels: IntensityVector,
    pub request_count: u64,
    pub error_count: u64,
    #[serde(default)]
    pub orders_processed: u64,
    #[serde(default)]
    pub completions_processed: u64,
    pub last_transition: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Body of a node's `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub status: HealthStatus,
    pub node: String,
    pub uptime_seconds: u64,
    pub running: bool,
}
