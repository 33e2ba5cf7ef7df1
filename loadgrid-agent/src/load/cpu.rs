//! CPU duty-cycle workers
//!
//! Each worker alternates a burst of floating-point work with a sleep sized so that
//! `work / (work + sleep) ≈ level / 100`. Workers run on the blocking pool and poll a
//! cancellation token, so `stop()` returns within one check interval.

use super::GeneratorFault;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Inner iterations between two token checks
const CHECK_EVERY: u64 = 20_000;
/// Longest uninterrupted sleep
const SLEEP_SLICE: Duration = Duration::from_millis(25);
/// Level from which every configured worker is used
const PARALLEL_FROM: u8 = 75;

pub struct CpuLoad {
    level: u8,
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl CpuLoad {
    pub fn start(level: u8, burst: Duration, max_workers: usize) -> Self {
        let token = CancellationToken::new();
        let count = worker_count(level, max_workers);

        let workers = (0..count)
            .map(|_| {
                let token = token.clone();
                tokio::task::spawn_blocking(move || duty_cycle(level, burst, token))
            })
            .collect();

        debug!("CPU load started at level {} with {} worker(s)", level, count);
        Self { level, token, workers }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Cancels and waits for every worker. A panicked worker is reported, the others are still joined.
    pub async fn stop(mut self) -> Result<(), GeneratorFault> {
        self.token.cancel();

        let mut fault = None;
        for handle in std::mem::take(&mut self.workers) {
            if let Err(e) = handle.await {
                warn!("CPU worker ended abnormally: {}", e);
                fault.get_or_insert(GeneratorFault::WorkerPanicked(e.to_string()));
            }
        }

        debug!("CPU load stopped (level {})", self.level);
        fault.map_or(Ok(()), Err)
    }
}

impl Drop for CpuLoad {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub fn worker_count(level: u8, max_workers: usize) -> usize {
    if level >= PARALLEL_FROM {
        max_workers.max(1)
    } else {
        1
    }
}

/// Sleep that follows one burst of `work` at `level`
pub fn idle_for(level: u8, work: Duration) -> Duration {
    match level {
        0 => work,
        l if l >= 100 => Duration::from_millis(1),
        l => work.mul_f64(f64::from(100 - l) / f64::from(l)),
    }
}

fn duty_cycle(level: u8, burst: Duration, token: CancellationToken) {
    let idle = idle_for(level, burst);
    let mut acc = 1.000_001_f64;

    while !token.is_cancelled() {
        let started = Instant::now();
        while started.elapsed() < burst {
            for i in 0..CHECK_EVERY {
                acc = (acc * 1.000_000_3 + (i as f64).sqrt()) % 1.0e9;
            }
            if token.is_cancelled() {
                return;
            }
        }
        std::hint::black_box(acc);

        if sliced_sleep(idle, &token) {
            return;
        }
    }
}

/// Returns true when cancelled mid-sleep
fn sliced_sleep(total: Duration, token: &CancellationToken) -> bool {
    let mut left = total;
    while !left.is_zero() {
        if token.is_cancelled() {
            return true;
        }
        let slice = left.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        left -= slice;
    }
    token.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_matches_duty_cycle() {
        let work = Duration::from_millis(50);
        assert_eq!(idle_for(50, work), Duration::from_millis(50));
        assert_eq!(idle_for(25, work), Duration::from_millis(150));
        assert_eq!(idle_for(100, work), Duration::from_millis(1));

        let idle = idle_for(80, work).as_secs_f64();
        let ratio = work.as_secs_f64() / (work.as_secs_f64() + idle);
        assert!((ratio - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_worker_count_scales_at_high_levels() {
        assert_eq!(worker_count(10, 8), 1);
        assert_eq!(worker_count(74, 8), 1);
        assert_eq!(worker_count(75, 8), 8);
        assert_eq!(worker_count(100, 0), 1);
    }

    #[tokio::test]
    async fn test_stop_is_prompt() {
        let load = CpuLoad::start(100, Duration::from_millis(50), 2);
        assert_eq!(load.level(), 100);
        assert_eq!(load.worker_count(), 2);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = Instant::now();
        load.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_stop_interrupts_long_sleep() {
        // level 1 sleeps ~99 bursts between bursts
        let load = CpuLoad::start(1, Duration::from_millis(20), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let started = Instant::now();
        load.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
