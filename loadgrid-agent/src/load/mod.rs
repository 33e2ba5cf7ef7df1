//! Load generation for a node
//!
//! Provides:
//! - CPU duty-cycle workers (`cpu`)
//! - a memory ballast held in 1 MiB chunks (`memory`)
//! - synthetic outbound HTTP traffic (`traffic`)
//! - order and completion record batches (`records`)
//!
//! `LoadGenerator` owns at most one generator of each kind and retargets it in place.

pub mod cpu;
pub mod memory;
pub mod records;
pub mod traffic;

use crate::config::LoadConfig;
use cpu::CpuLoad;
use loadgrid_contracts::{IntensityVector, ResourceKey, ResourceProfile, ResourceRole};
use memory::MemoryBallast;
use records::{RecordCounters, RecordLoad};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use traffic::{TrafficCounters, TrafficLoad};

/// Local generator failures. They lower the effective level, never fail a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeneratorFault {
    #[error("memory allocation failed after {reached_mb} MB (target {target_mb} MB)")]
    Allocation { reached_mb: u64, target_mb: u64 },
    #[error("CPU worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Per-kind levels handed to the generator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadTarget {
    pub cpu: u8,
    pub memory: u8,
    pub traffic: u8,
    pub orders: u8,
    pub completions: u8,
}

impl LoadTarget {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn from_levels(levels: &IntensityVector, profile: ResourceProfile) -> Self {
        Self {
            cpu: levels.level_for(profile, ResourceRole::Cpu),
            memory: levels.level_for(profile, ResourceRole::Memory),
            traffic: levels.level_for(profile, ResourceRole::Traffic),
            orders: workload(levels, profile, ResourceKey::Orders),
            completions: workload(levels, profile, ResourceKey::Completions),
        }
    }
}

fn workload(levels: &IntensityVector, profile: ResourceProfile, key: ResourceKey) -> u8 {
    if profile.recognizes(key) {
        levels.get(key)
    } else {
        0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratorStatus {
    pub cpu_level: u8,
    pub cpu_workers: usize,
    pub memory_level: u8,
    pub memory_held_mb: u64,
    pub traffic_level: u8,
    pub orders_level: u8,
    pub completions_level: u8,
}

pub struct LoadGenerator {
    config: LoadConfig,
    cpu: Option<CpuLoad>,
    memory: MemoryBallast,
    memory_level: u8,
    traffic: Option<TrafficLoad>,
    traffic_client: reqwest::Client,
    counters: Arc<TrafficCounters>,
    records: Option<RecordLoad>,
    record_counters: Arc<RecordCounters>,
}

impl LoadGenerator {
    pub fn new(config: LoadConfig) -> Self {
        let traffic_client = reqwest::Client::builder()
            .timeout(config.traffic_timeout())
            .build()
            .unwrap_or_else(|e| {
                warn!("Traffic client falls back to defaults: {}", e);
                reqwest::Client::new()
            });

        Self {
            memory: MemoryBallast::new(config.memory_cap_mb),
            config,
            cpu: None,
            memory_level: 0,
            traffic: None,
            traffic_client,
            counters: Arc::new(TrafficCounters::default()),
            records: None,
            record_counters: Arc::new(RecordCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<TrafficCounters> {
        self.counters.clone()
    }

    pub fn record_counters(&self) -> Arc<RecordCounters> {
        self.record_counters.clone()
    }

    /// Moves every generator to `target`. Unchanged kinds are left running untouched;
    /// a changed kind is stopped (workers awaited) before its replacement starts.
    /// Returns the first fault after applying every kind.
    pub async fn retarget(&mut self, target: LoadTarget) -> Result<(), GeneratorFault> {
        let mut fault = None;

        if let Err(e) = self.retarget_cpu(target.cpu).await {
            fault.get_or_insert(e);
        }
        if let Err(e) = self.retarget_memory(target.memory).await {
            fault.get_or_insert(e);
        }
        self.retarget_traffic(target.traffic).await;
        self.retarget_records(target.orders, target.completions).await;

        let status = self.status();
        info!(
            "Load retargeted: cpu={} ({} workers), memory={} ({} MB), traffic={}, orders={}, completions={}",
            status.cpu_level,
            status.cpu_workers,
            status.memory_level,
            status.memory_held_mb,
            status.traffic_level,
            status.orders_level,
            status.completions_level
        );
        fault.map_or(Ok(()), Err)
    }

    /// Stops everything. Idempotent.
    pub async fn stop(&mut self) -> Result<(), GeneratorFault> {
        self.retarget(LoadTarget::idle()).await
    }

    pub fn status(&self) -> GeneratorStatus {
        GeneratorStatus {
            cpu_level: self.cpu.as_ref().map_or(0, |c| c.level()),
            cpu_workers: self.cpu.as_ref().map_or(0, |c| c.worker_count()),
            memory_level: self.memory_level,
            memory_held_mb: self.memory.held_mb(),
            traffic_level: self.traffic.as_ref().map_or(0, |t| t.level()),
            orders_level: self.records_levels().0,
            completions_level: self.records_levels().1,
        }
    }

    fn records_levels(&self) -> (u8, u8) {
        self.records.as_ref().map_or((0, 0), |r| r.levels())
    }

    async fn retarget_cpu(&mut self, level: u8) -> Result<(), GeneratorFault> {
        if self.cpu.as_ref().map_or(0, |c| c.level()) == level {
            return Ok(());
        }

        let stopped = match self.cpu.take() {
            Some(previous) => previous.stop().await,
            None => Ok(()),
        };

        if level > 0 {
            self.cpu = Some(CpuLoad::start(level, self.config.cpu_burst(), self.config.max_cpu_workers));
        }
        stopped
    }

    async fn retarget_memory(&mut self, level: u8) -> Result<(), GeneratorFault> {
        if self.memory_level == level {
            return Ok(());
        }

        if level == 0 {
            self.memory.release();
            self.memory_level = 0;
            return Ok(());
        }

        match self.memory.resize(level).await {
            Ok(()) => {
                self.memory_level = level;
                Ok(())
            }
            Err(fault) => {
                // keep what was reached; the next update retries
                self.memory_level = self.memory.effective_level();
                Err(fault)
            }
        }
    }

    async fn retarget_traffic(&mut self, level: u8) {
        if self.traffic.as_ref().map_or(0, |t| t.level()) == level {
            return;
        }

        if let Some(previous) = self.traffic.take() {
            previous.stop().await;
        }

        if level > 0 {
            self.traffic = TrafficLoad::start(
                level,
                self.config.traffic_max_rps,
                self.config.traffic_targets.clone(),
                self.traffic_client.clone(),
                self.counters.clone(),
            );
        }
    }

    async fn retarget_records(&mut self, orders: u8, completions: u8) {
        if self.records_levels() == (orders, completions) {
            return;
        }

        if let Some(previous) = self.records.take() {
            previous.stop().await;
        }

        self.records = RecordLoad::start(
            orders,
            completions,
            self.config.records_period(),
            self.record_counters.clone(),
        );
    }
}
