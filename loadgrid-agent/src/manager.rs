//! Resource manager of one node
//!
//! Owns the node's levels and running flag, drives the load generator and answers
//! metrics queries through the blender.
//!
//! Running/idle follows the level sum (`> 0` means running) with a hysteresis window:
//! a flip less than `window` after the previous one is suppressed and a single settle
//! task re-evaluates once the window has elapsed.
//!
//! Locking: updates serialize on the async generator mutex (held over merge, decide and
//! retarget); the state itself sits behind a short-lived `RwLock` so reads never wait on
//! a retarget in progress.

use crate::config::AgentConfig;
use crate::load::records::RecordCounters;
use crate::load::traffic::TrafficCounters;
use crate::load::{GeneratorStatus, LoadGenerator, LoadTarget};
use crate::metrics::MetricsBlender;
use chrono::{DateTime, Utc};
use loadgrid_contracts::{
    HealthStatus, IntensityVector, LevelsAck, NodeHealth, NodeMetrics, ResourceProfile,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Unchanged,
    Transition(bool),
    /// Flip wanted but the window is still open for `remaining`
    Suppressed { remaining: Duration },
}

/// Running flag plus the instant of its last flip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunState {
    pub running: bool,
    pub last_transition: Option<Instant>,
}

impl RunState {
    pub fn new(running: bool) -> Self {
        Self { running, last_transition: None }
    }

    /// The first flip is never suppressed.
    pub fn decide(&self, desired: bool, now: Instant, window: Duration) -> Decision {
        if desired == self.running {
            return Decision::Unchanged;
        }
        match self.last_transition {
            Some(at) => {
                let elapsed = now.saturating_duration_since(at);
                if elapsed < window {
                    Decision::Suppressed { remaining: window - elapsed }
                } else {
                    Decision::Transition(desired)
                }
            }
            None => Decision::Transition(desired),
        }
    }

    /// Returns true when the flag actually changed
    pub fn apply(&mut self, running: bool, now: Instant) -> bool {
        if self.running == running {
            return false;
        }
        self.running = running;
        self.last_transition = Some(now);
        true
    }
}

/// Consistent copy of a node's state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeState {
    pub levels: IntensityVector,
    pub running: bool,
    pub last_transition: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub error_count: u64,
    pub orders_processed: u64,
    pub completions_processed: u64,
    pub instance_count: Option<u32>,
}

struct Inner {
    levels: IntensityVector,
    run: RunState,
    transitioned_at: Option<DateTime<Utc>>,
}

impl Inner {
    fn flip(&mut self, running: bool, now: Instant) -> bool {
        let changed = self.run.apply(running, now);
        if changed {
            self.transitioned_at = Some(Utc::now());
        }
        changed
    }
}

pub struct ResourceManager {
    node: String,
    profile: ResourceProfile,
    window: Duration,
    started: Instant,
    inner: RwLock<Inner>,
    generator: tokio::sync::Mutex<LoadGenerator>,
    counters: Arc<TrafficCounters>,
    records: Arc<RecordCounters>,
    blender: MetricsBlender,
    settle: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceManager {
    pub fn new(config: &AgentConfig) -> Arc<Self> {
        let profile = config.node.profile;
        let mut levels = IntensityVector::zeroed(profile);
        levels.merge(&config.node.levels);
        let running = !levels.is_idle();

        let generator = LoadGenerator::new(config.effective_load());
        let counters = generator.counters();
        let records = generator.record_counters();

        Arc::new(Self {
            node: config.node.name.clone(),
            profile,
            window: config.state.hysteresis_window(),
            started: Instant::now(),
            inner: RwLock::new(Inner { levels, run: RunState::new(running), transitioned_at: None }),
            generator: tokio::sync::Mutex::new(generator),
            counters,
            records,
            blender: MetricsBlender::new(profile, config.telemetry.clone(), &config.node.name),
            settle: Mutex::new(None),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn profile(&self) -> ResourceProfile {
        self.profile
    }

    pub fn blender(&self) -> &MetricsBlender {
        &self.blender
    }

    /// Applies the startup levels to the generator
    pub async fn start(&self) {
        let mut generator = self.generator.lock().await;
        let target = self.target_of(&self.inner.read());
        self.drive(&mut generator, target).await;
    }

    /// Partial update; keys not in `partial` keep their level.
    pub async fn update(self: &Arc<Self>, partial: &IntensityVector) -> LevelsAck {
        let mut generator = self.generator.lock().await;

        let target = {
            let mut inner = self.inner.write();
            inner.levels.merge(partial);
            self.evaluate(&mut inner, Instant::now());
            self.target_of(&inner)
        };

        self.drive(&mut generator, target).await;
        drop(generator);
        self.ack("updated")
    }

    /// All levels to zero and idle right away, ignoring the window
    pub async fn reset(&self) -> LevelsAck {
        let mut generator = self.generator.lock().await;

        {
            let mut inner = self.inner.write();
            inner.levels = IntensityVector::zeroed(self.profile);
            if inner.flip(false, Instant::now()) {
                info!("Node {} reset: running -> idle", self.node);
            }
            self.cancel_settle();
        }

        self.drive(&mut generator, LoadTarget::idle()).await;
        drop(generator);
        self.ack("reset")
    }

    /// Administrative override of the running flag, bypassing the level sum and the window
    pub async fn set_running(&self, running: bool) -> LevelsAck {
        let mut generator = self.generator.lock().await;

        let target = {
            let mut inner = self.inner.write();
            if inner.flip(running, Instant::now()) {
                info!("Node {} running forced to {}", self.node, running);
            }
            self.cancel_settle();
            self.target_of(&inner)
        };

        self.drive(&mut generator, target).await;
        drop(generator);
        self.ack(if running { "running" } else { "stopped" })
    }

    pub fn state(&self) -> NodeState {
        let inner = self.inner.read();
        let (request_count, error_count) = self.counters.snapshot();
        let (orders_processed, completions_processed) = self.records.snapshot();
        NodeState {
            levels: inner.levels.clone(),
            running: inner.run.running,
            last_transition: inner.transitioned_at,
            request_count,
            error_count,
            orders_processed,
            completions_processed,
            instance_count: self.blender.instance_count(),
        }
    }

    pub fn metrics(&self) -> NodeMetrics {
        let state = self.state();
        NodeMetrics {
            node: self.node.clone(),
            sample: self.blender.sample(&state.levels, state.running),
            levels: state.levels,
            request_count: state.request_count,
            error_count: state.error_count,
            orders_processed: state.orders_processed,
            completions_processed: state.completions_processed,
            last_transition: state.last_transition,
        }
    }

    pub fn health(&self) -> NodeHealth {
        NodeHealth {
            status: HealthStatus::Healthy,
            node: self.node.clone(),
            uptime_seconds: self.started.elapsed().as_secs(),
            running: self.inner.read().run.running,
        }
    }

    pub async fn generator_status(&self) -> GeneratorStatus {
        self.generator.lock().await.status()
    }

    /// Stops the generator and any pending settle task
    pub async fn shutdown(&self) {
        self.cancel_settle();
        if let Err(fault) = self.generator.lock().await.stop().await {
            warn!("Load generator stopped with a fault: {}", fault);
        }
    }

    fn ack(&self, status: &str) -> LevelsAck {
        let inner = self.inner.read();
        LevelsAck {
            status: status.to_string(),
            app_name: self.node.clone(),
            levels: inner.levels.clone(),
            running: inner.run.running,
        }
    }

    fn target_of(&self, inner: &Inner) -> LoadTarget {
        if inner.run.running {
            LoadTarget::from_levels(&inner.levels, self.profile)
        } else {
            LoadTarget::idle()
        }
    }

    async fn drive(&self, generator: &mut LoadGenerator, target: LoadTarget) {
        if let Err(fault) = generator.retarget(target).await {
            warn!("Load generator degraded on node {}: {}", self.node, fault);
        }
    }

    fn evaluate(self: &Arc<Self>, inner: &mut Inner, now: Instant) {
        let desired = !inner.levels.is_idle();

        match inner.run.decide(desired, now, self.window) {
            Decision::Unchanged => self.cancel_settle(),
            Decision::Transition(running) => {
                inner.flip(running, now);
                self.cancel_settle();
                info!(
                    "Node {} {} (level sum {})",
                    self.node,
                    if running { "idle -> running" } else { "running -> idle" },
                    inner.levels.sum()
                );
            }
            Decision::Suppressed { remaining } => {
                info!(
                    "Node {} transition to running={} suppressed, settling in {:?}",
                    self.node, desired, remaining
                );
                self.schedule_settle(remaining);
            }
        }
    }

    fn schedule_settle(self: &Arc<Self>, after: Duration) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // detach our own handle so a later evaluate cannot abort this run
            manager.settle.lock().take();
            manager.settle_now().await;
        });

        if let Some(previous) = self.settle.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn settle_now(self: &Arc<Self>) {
        let mut generator = self.generator.lock().await;
        let target = {
            let mut inner = self.inner.write();
            self.evaluate(&mut inner, Instant::now());
            self.target_of(&inner)
        };
        debug!("Node {} settled", self.node);
        self.drive(&mut generator, target).await;
    }

    fn cancel_settle(&self) {
        if let Some(pending) = self.settle.lock().take() {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadgrid_contracts::{MetricsSource, ResourceKey};

    fn test_config(window_ms: u64) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.node.name = "inventory_system".to_string();
        config.state.hysteresis_ms = window_ms;
        config.load.memory_cap_mb = 4;
        config.load.cpu_burst_ms = 5;
        config.load.max_cpu_workers = 1;
        config
    }

    fn levels(pairs: &[(ResourceKey, u8)]) -> IntensityVector {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_decide_first_transition_allowed() {
        let state = RunState::new(false);
        let now = Instant::now();
        assert_eq!(state.decide(true, now, Duration::from_secs(5)), Decision::Transition(true));
        assert_eq!(state.decide(false, now, Duration::from_secs(5)), Decision::Unchanged);
    }

    #[test]
    fn test_decide_suppresses_inside_window() {
        let start = Instant::now();
        let mut state = RunState::new(false);
        assert!(state.apply(true, start));
        assert!(!state.apply(true, start));

        let window = Duration::from_secs(5);
        let soon = start + Duration::from_secs(2);
        assert_eq!(
            state.decide(false, soon, window),
            Decision::Suppressed { remaining: Duration::from_secs(3) }
        );

        let later = start + Duration::from_secs(5);
        assert_eq!(state.decide(false, later, window), Decision::Transition(false));
    }

    #[tokio::test]
    async fn test_update_merges_and_starts_running() {
        let manager = ResourceManager::new(&test_config(5_000));
        manager.update(&levels(&[(ResourceKey::Storage, 20)])).await;

        let ack = manager.update(&levels(&[(ResourceKey::Processing, 80)])).await;
        assert_eq!(ack.status, "updated");
        assert_eq!(ack.app_name, "inventory_system");
        assert_eq!(ack.levels.get(ResourceKey::Processing), 80);
        assert_eq!(ack.levels.get(ResourceKey::Storage), 20);
        assert_eq!(ack.levels.len(), 5);
        assert!(ack.running);

        let metrics = manager.metrics();
        assert!(metrics.sample.running);
        assert!(metrics.sample.cpu_percent >= 98.8);
        assert_eq!(metrics.sample.source, MetricsSource::Simulation);
        assert!(metrics.last_transition.is_some());

        let status = manager.generator_status().await;
        assert_eq!(status.cpu_level, 80);
        assert_eq!(status.memory_level, 20);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let manager = ResourceManager::new(&test_config(5_000));
        let v = levels(&[(ResourceKey::Processing, 30), (ResourceKey::Orders, 10)]);

        manager.update(&v).await;
        let first = manager.state();
        manager.update(&v).await;
        let second = manager.state();

        assert_eq!(first, second);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_flip_back_is_suppressed_then_settles() {
        let manager = ResourceManager::new(&test_config(300));

        manager.update(&levels(&[(ResourceKey::Processing, 40)])).await;
        assert!(manager.state().running);

        let ack = manager.update(&levels(&[(ResourceKey::Processing, 0)])).await;
        assert!(ack.levels.is_idle());
        assert!(ack.running, "flip inside the window must be suppressed");

        tokio::time::sleep(Duration::from_millis(700)).await;
        let state = manager.state();
        assert!(!state.running);
        assert_eq!(manager.generator_status().await.cpu_level, 0);
    }

    #[tokio::test]
    async fn test_workload_keys_count_towards_running() {
        let manager = ResourceManager::new(&test_config(5_000));
        let ack = manager.update(&levels(&[(ResourceKey::Completions, 5)])).await;
        assert!(ack.running);
        assert_eq!(manager.generator_status().await, crate::load::GeneratorStatus {
            cpu_level: 0,
            cpu_workers: 0,
            memory_level: 0,
            memory_held_mb: 0,
            traffic_level: 0,
            orders_level: 0,
            completions_level: 5,
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = manager.state();
        assert!(state.completions_processed >= 25, "{}", state.completions_processed);
        assert_eq!(state.orders_processed, 0);
        assert_eq!(manager.metrics().completions_processed, state.completions_processed);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_bypasses_hysteresis() {
        let manager = ResourceManager::new(&test_config(60_000));
        manager
            .update(&levels(&[(ResourceKey::Processing, 50), (ResourceKey::Storage, 50)]))
            .await;

        let ack = manager.reset().await;
        assert_eq!(ack.status, "reset");
        assert!(!ack.running);
        assert!(ack.levels.is_idle());
        assert_eq!(ack.levels.len(), 5);
        assert_eq!(manager.generator_status().await.memory_held_mb, 0);
        assert_eq!(manager.metrics().sample.cpu_percent, 0.0);
    }

    #[tokio::test]
    async fn test_set_running_override() {
        let manager = ResourceManager::new(&test_config(60_000));
        manager.update(&levels(&[(ResourceKey::Processing, 20)])).await;

        let ack = manager.set_running(false).await;
        assert!(!ack.running);
        assert_eq!(ack.levels.get(ResourceKey::Processing), 20);
        assert_eq!(manager.generator_status().await.cpu_level, 0);

        let ack = manager.set_running(true).await;
        assert!(ack.running);
        assert_eq!(manager.generator_status().await.cpu_level, 20);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_configured_levels_start_running() {
        let mut config = test_config(5_000);
        config.node.levels = levels(&[(ResourceKey::Storage, 50)]);
        let manager = ResourceManager::new(&config);
        manager.start().await;

        let state = manager.state();
        assert!(state.running);
        assert_eq!(state.last_transition, None);
        assert_eq!(state.instance_count, Some(1));
        assert_eq!(manager.generator_status().await.memory_held_mb, 2);

        let health = manager.health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.running);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_traffic_reaches_gateway_without_targets() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let router = axum::Router::new().fallback(|| async { "ok" });
            axum::serve(listener, router).await.unwrap();
        });

        let mut config = test_config(5_000);
        config.telemetry.gateway_url = Some(gateway);
        config.load.traffic_max_rps = 50.0;
        let manager = ResourceManager::new(&config);

        manager.update(&levels(&[(ResourceKey::Traffic, 100)])).await;
        assert_eq!(manager.generator_status().await.traffic_level, 100);
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.shutdown().await;

        let state = manager.state();
        assert!(state.request_count > 0);
        assert_eq!(state.error_count, 0);
        server.abort();
    }
}
