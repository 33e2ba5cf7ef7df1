use crate::dispatch::PoolStats;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub status: String,
    pub uptime_seconds: u64,
    pub nodes_tracked: u32,
    pub memory_usage_mb: f32,
    pub propagations_dispatched: u64,
    pub propagations_succeeded: u64,
    pub propagations_failed: u64,
    pub propagations_in_flight: u64,
    pub propagations_superseded: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, nodes_tracked: usize, pool: PoolStats) -> KernelHealth {
        KernelHealth {
            status: "healthy".into(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            nodes_tracked: nodes_tracked as u32,
            memory_usage_mb: get_memory_usage_mb(),
            propagations_dispatched: pool.dispatched,
            propagations_succeeded: pool.succeeded,
            propagations_failed: pool.failed,
            propagations_in_flight: pool.in_flight,
            propagations_superseded: pool.superseded,
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// RSS du processus lu dans /proc (0 hors Linux)
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    0.0
}
