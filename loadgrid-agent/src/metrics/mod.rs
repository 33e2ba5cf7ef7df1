//! Metrics for a node
//!
//! Provides:
//! - simulated CPU/memory figures derived from intensity levels
//! - host CPU/memory counters (sysinfo) when the node runs inside the deployment platform
//! - external telemetry from the gateway (instance count, CPU/memory)
//! - a pure blend of the above into one `MetricsSample`
//!
//! Host and gateway figures are refreshed by background loops into `TelemetryCache`;
//! `MetricsBlender::sample` only reads the cache and never touches the network.

use crate::config::TelemetryConfig;
use crate::telemetry::{ExternalMetrics, TelemetryClient};
use chrono::{DateTime, Utc};
use loadgrid_contracts::{IntensityVector, MetricsSample, MetricsSource, ResourceProfile, ResourceRole};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Percent of CPU shown per point of CPU level
const CPU_SCALE: f64 = 1.3;
/// Percent of memory shown per point of memory level
const MEMORY_SCALE: f64 = 1.0;
/// MB shown per point of memory level
const MEMORY_MB_SCALE: f64 = 3.52;

/// Host CPU/memory counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: u64,
}

impl HostSample {
    fn collect(sys: &System) -> Self {
        let total_bytes = sys.total_memory();
        let used_bytes = total_bytes.saturating_sub(sys.available_memory());

        let memory_percent = if total_bytes > 0 {
            used_bytes as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };

        HostSample {
            cpu_percent: f64::from(sys.global_cpu_info().cpu_usage()),
            memory_percent,
            memory_used_mb: used_bytes / (1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub at: DateTime<Utc>,
}

impl<T> Stamped<T> {
    pub fn now(value: T) -> Self {
        Self { value, at: Utc::now() }
    }
}

/// Last known values of each refreshed source. A failed refresh leaves its field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryCache {
    pub last_local: Option<Stamped<HostSample>>,
    pub last_external: Option<Stamped<ExternalMetrics>>,
    pub instance_count: Option<u32>,
}

/// Simulated sample for `levels`.
///
/// The jitter factors are cosmetic so that dashboards do not show flat lines; they are
/// not a measurement.
pub fn simulate<R: Rng + ?Sized>(
    levels: &IntensityVector,
    profile: ResourceProfile,
    running: bool,
    rng: &mut R,
) -> MetricsSample {
    if !running {
        return MetricsSample::idle(None);
    }

    let cpu_level = f64::from(levels.level_for(profile, ResourceRole::Cpu));
    let memory_level = f64::from(levels.level_for(profile, ResourceRole::Memory));
    let cpu_jitter = rng.gen_range(0.95..=1.05);
    let memory_jitter = rng.gen_range(0.98..=1.02);

    MetricsSample {
        cpu_percent: (cpu_level * CPU_SCALE * cpu_jitter).min(100.0),
        memory_percent: (memory_level * MEMORY_SCALE * memory_jitter).min(100.0),
        memory_used_mb: (memory_level * MEMORY_MB_SCALE * memory_jitter).round() as u64,
        instance_count: None,
        running: true,
        source: MetricsSource::Simulation,
        external_cpu_percent: None,
        external_memory_percent: None,
        external_updated_at: None,
    }
}

/// Host counters as a running sample
pub fn from_host(host: &HostSample) -> MetricsSample {
    MetricsSample {
        cpu_percent: host.cpu_percent,
        memory_percent: host.memory_percent,
        memory_used_mb: host.memory_used_mb,
        instance_count: None,
        running: true,
        source: MetricsSource::Container,
        external_cpu_percent: None,
        external_memory_percent: None,
        external_updated_at: None,
    }
}

/// Local CPU/memory always win; the external instance count wins when known.
/// An idle sample stays a plain simulation sample.
pub fn blend(
    mut local: MetricsSample,
    external: Option<&Stamped<ExternalMetrics>>,
    instance_count: Option<u32>,
) -> MetricsSample {
    if instance_count.is_some() {
        local.instance_count = instance_count;
    }

    if !local.running {
        return local;
    }

    if let Some(external) = external {
        local.source = MetricsSource::Hybrid;
        local.external_cpu_percent = Some(external.value.cpu_percent);
        local.external_memory_percent = Some(external.value.memory_percent);
        local.external_updated_at = Some(external.at);
    }
    local
}

#[derive(Clone)]
pub struct MetricsBlender {
    profile: ResourceProfile,
    config: TelemetryConfig,
    client: Option<TelemetryClient>,
    cache: Arc<RwLock<TelemetryCache>>,
}

impl MetricsBlender {
    pub fn new(profile: ResourceProfile, config: TelemetryConfig, node: &str) -> Self {
        let client = config.gateway_url.as_deref().and_then(|url| {
            TelemetryClient::new(url, node, config.request_timeout())
                .map_err(|e| warn!("Telemetry gateway disabled, client setup failed: {}", e))
                .ok()
        });

        Self {
            profile,
            config,
            client,
            cache: Arc::new(RwLock::new(TelemetryCache::default())),
        }
    }

    /// Instance count used until (or unless) an external source reports one
    fn default_instances(&self) -> Option<u32> {
        if !self.config.hosted && self.client.is_none() {
            Some(1)
        } else {
            None
        }
    }

    pub fn cache(&self) -> TelemetryCache {
        self.cache.read().clone()
    }

    pub fn instance_count(&self) -> Option<u32> {
        self.cache.read().instance_count.or(self.default_instances())
    }

    pub fn sample(&self, levels: &IntensityVector, running: bool) -> MetricsSample {
        let cache = self.cache();
        let instance_count = cache.instance_count.or(self.default_instances());

        let local = match (&cache.last_local, self.config.hosted && running) {
            (Some(host), true) => from_host(&host.value),
            _ => simulate(levels, self.profile, running, &mut rand::thread_rng()),
        };

        blend(local, cache.last_external.as_ref(), instance_count)
    }

    pub async fn refresh_instances(&self) {
        if let Some(client) = &self.client {
            refresh_instances(client, &self.cache).await;
        }
    }

    pub async fn refresh_external(&self) {
        if let Some(client) = &self.client {
            refresh_external(client, &self.cache).await;
        }
    }

    /// Starts one loop per configured source; they stop when `token` is cancelled
    pub fn spawn_refreshers(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.hosted {
            let cache = self.cache.clone();
            let period = secs(self.config.host_refresh_secs);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                let sys = Arc::new(tokio::sync::Mutex::new(System::new()));
                every(period, token, || {
                    let sys = sys.clone();
                    let cache = cache.clone();
                    async move {
                        let sample = sample_host(&mut *sys.lock().await).await;
                        debug!("Host sample: cpu={:.1}% mem={:.1}%", sample.cpu_percent, sample.memory_percent);
                        cache.write().last_local = Some(Stamped::now(sample));
                    }
                })
                .await;
            }));
        }

        if self.client.is_some() {
            let blender = self.clone();
            let period = secs(self.config.instances_refresh_secs);
            let token2 = token.clone();
            handles.push(tokio::spawn(async move {
                every(period, token2, || blender.refresh_instances()).await;
            }));

            let blender = self.clone();
            let period = secs(self.config.metrics_refresh_secs);
            handles.push(tokio::spawn(async move {
                every(period, token, || blender.refresh_external()).await;
            }));
        }

        info!(
            "Telemetry refreshers started (hosted: {}, gateway: {})",
            self.config.hosted,
            self.config.gateway_url.as_deref().unwrap_or("none")
        );
        handles
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

/// Runs `step` on every tick until cancelled. The first tick fires immediately.
async fn every<F, Fut>(period: Duration, token: CancellationToken, mut step: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => step().await,
        }
    }
}

async fn sample_host(sys: &mut System) -> HostSample {
    sys.refresh_cpu_usage();
    // CPU usage needs two refreshes spaced apart
    tokio::time::sleep(Duration::from_millis(200)).await;
    sys.refresh_cpu_usage();
    sys.refresh_memory();
    HostSample::collect(sys)
}

async fn refresh_instances(client: &TelemetryClient, cache: &RwLock<TelemetryCache>) {
    match client.fetch_instances().await {
        Ok(count) => {
            debug!("Instance count refreshed: {}", count);
            cache.write().instance_count = Some(count);
        }
        Err(e) => warn!("Instance count refresh failed, keeping last value: {}", e),
    }
}

async fn refresh_external(client: &TelemetryClient, cache: &RwLock<TelemetryCache>) {
    match client.fetch_metrics().await {
        Ok(metrics) => {
            debug!("External metrics refreshed: {:?}", metrics);
            cache.write().last_external = Some(Stamped::now(metrics));
        }
        Err(e) => warn!("External metrics refresh failed, keeping last value: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use loadgrid_contracts::ResourceKey;
    use rand::{rngs::StdRng, SeedableRng};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn business(processing: u8, storage: u8) -> IntensityVector {
        IntensityVector::zeroed(ResourceProfile::Business)
            .with(ResourceKey::Processing, processing)
            .with(ResourceKey::Storage, storage)
    }

    #[test]
    fn test_simulated_cpu_scaled_from_level() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let sample = simulate(&business(80, 50), ResourceProfile::Business, true, &mut rng);
            assert!(sample.cpu_percent >= 98.8 && sample.cpu_percent <= 100.0, "{}", sample.cpu_percent);
            assert!(sample.memory_percent >= 49.0 && sample.memory_percent <= 51.0);
            assert!(sample.memory_used_mb >= 172 && sample.memory_used_mb <= 180);
            assert_eq!(sample.source, MetricsSource::Simulation);
            assert!(sample.running);
        }
    }

    #[test]
    fn test_low_level_stays_below_cap() {
        let mut rng = StdRng::seed_from_u64(11);
        let sample = simulate(&business(10, 0), ResourceProfile::Business, true, &mut rng);
        assert!(sample.cpu_percent >= 12.35 && sample.cpu_percent <= 13.65);
        assert_eq!(sample.memory_used_mb, 0);
    }

    #[test]
    fn test_idle_node_reports_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        let sample = simulate(&business(80, 50), ResourceProfile::Business, false, &mut rng);
        assert_eq!(sample, MetricsSample::idle(None));
    }

    #[test]
    fn test_blend_keeps_local_figures() {
        let mut rng = StdRng::seed_from_u64(3);
        let local = simulate(&business(40, 20), ResourceProfile::Business, true, &mut rng);
        let external = Stamped::now(ExternalMetrics { cpu_percent: 90.0, memory_percent: 70.0 });

        let blended = blend(local.clone(), Some(&external), Some(3));

        assert_eq!(blended.source, MetricsSource::Hybrid);
        assert_eq!(blended.cpu_percent, local.cpu_percent);
        assert_eq!(blended.memory_percent, local.memory_percent);
        assert_eq!(blended.instance_count, Some(3));
        assert_eq!(blended.external_cpu_percent, Some(90.0));
        assert_eq!(blended.external_updated_at, Some(external.at));
    }

    #[test]
    fn test_blend_idle_stays_simulation() {
        let external = Stamped::now(ExternalMetrics { cpu_percent: 90.0, memory_percent: 70.0 });
        let blended = blend(MetricsSample::idle(None), Some(&external), Some(2));
        assert_eq!(blended.source, MetricsSource::Simulation);
        assert_eq!(blended.cpu_percent, 0.0);
        assert_eq!(blended.instance_count, Some(2));
    }

    #[test]
    fn test_blend_container_without_external() {
        let host = HostSample { cpu_percent: 33.0, memory_percent: 12.0, memory_used_mb: 900 };
        let blended = blend(from_host(&host), None, None);
        assert_eq!(blended.source, MetricsSource::Container);
        assert_eq!(blended.memory_used_mb, 900);
        assert_eq!(blended.instance_count, None);
    }

    #[test]
    fn test_standalone_node_counts_one_instance() {
        let blender = MetricsBlender::new(ResourceProfile::Business, TelemetryConfig::default(), "user_management");
        let sample = blender.sample(&business(0, 0), false);
        assert_eq!(sample.instance_count, Some(1));
        assert_eq!(sample.source, MetricsSource::Simulation);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new()
            .route(
                "/telemetry/notification_center/instances",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Ok(Json(json!({"instances": 3})))
                        } else {
                            Err(StatusCode::BAD_GATEWAY)
                        }
                    }
                }),
            )
            .route(
                "/telemetry/notification_center/metrics",
                get(|| async { Json(json!({"cpu_percent": 55.0, "memory_percent": 25.0})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let config = TelemetryConfig {
            gateway_url: Some(format!("http://{addr}")),
            ..TelemetryConfig::default()
        };
        let blender = MetricsBlender::new(ResourceProfile::Business, config, "notification_center");

        // before any refresh there is no instance count at all
        assert_eq!(blender.sample(&business(0, 0), false).instance_count, None);

        blender.refresh_instances().await;
        blender.refresh_instances().await;
        blender.refresh_external().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(blender.cache().instance_count, Some(3));

        let sample = blender.sample(&business(50, 10), true);
        assert_eq!(sample.instance_count, Some(3));
        assert_eq!(sample.source, MetricsSource::Hybrid);
        assert_eq!(sample.external_cpu_percent, Some(55.0));
        assert!(sample.cpu_percent >= 61.75 && sample.cpu_percent <= 68.25);
    }

    #[tokio::test]
    async fn test_refreshers_stop_on_cancel() {
        let config = TelemetryConfig {
            gateway_url: Some("http://127.0.0.1:9".to_string()),
            request_timeout_secs: 1,
            ..TelemetryConfig::default()
        };
        let blender = MetricsBlender::new(ResourceProfile::Legacy, config, "cpu_worker");
        let token = CancellationToken::new();
        let handles = blender.spawn_refreshers(token.clone());
        assert_eq!(handles.len(), 2);

        token.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        }
        assert_eq!(blender.cache().instance_count, None);
    }

    #[tokio::test]
    async fn test_host_sampling_leaves_runtime_free() {
        let started = std::time::Instant::now();
        let mut sys = System::new();

        let (sample, side) = tokio::join!(sample_host(&mut sys), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            started.elapsed()
        });

        assert!(side < Duration::from_millis(150), "runtime blocked for {side:?}");
        assert!((0.0..=100.0).contains(&sample.memory_percent));
    }
}
