//! Synthetic outbound traffic
//!
//! At level L the node issues `L/100 × max_rps` GET requests per second against its
//! configured targets. Every attempt is counted; transport failures and HTTP >= 400
//! also count as errors. In-flight requests belong to the pump and are aborted with it.

use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const ENDPOINTS: [&str; 3] = ["/", "/health", "/metrics"];

#[derive(Debug, Default)]
pub struct TrafficCounters {
    requests: AtomicU64,
    errors: AtomicU64,
}

impl TrafficCounters {
    pub fn record(&self, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `(request_count, error_count)`
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

pub fn rate_for(level: u8, max_rps: f64) -> f64 {
    f64::from(level.min(100)) / 100.0 * max_rps
}

const MIN_PERIOD: Duration = Duration::from_millis(1);
const MAX_PERIOD: Duration = Duration::from_secs(3600);

/// Tick period for `rate` requests per second, clamped to `[1 ms, 1 h]`
pub fn period_for(rate: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / rate)
        .unwrap_or(MAX_PERIOD)
        .clamp(MIN_PERIOD, MAX_PERIOD)
}

pub struct TrafficLoad {
    level: u8,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl TrafficLoad {
    /// `None` when there is nothing to send (no targets or a zero rate)
    pub fn start(
        level: u8,
        max_rps: f64,
        targets: Vec<String>,
        client: reqwest::Client,
        counters: Arc<TrafficCounters>,
    ) -> Option<Self> {
        if targets.is_empty() {
            warn!("Traffic level {} requested but no traffic targets configured", level);
            return None;
        }
        let rate = rate_for(level, max_rps);
        if !rate.is_finite() || rate <= 0.0 {
            return None;
        }

        let token = CancellationToken::new();
        let period = period_for(rate);
        let task = tokio::spawn(pump(period, targets, client, counters, token.clone()));

        debug!("Traffic started at level {} ({:.2} req/s)", level, rate);
        Some(Self { level, token, task })
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Traffic task ended abnormally: {}", e);
        }
    }
}

async fn pump(
    period: Duration,
    targets: Vec<String>,
    client: reqwest::Client,
    counters: Arc<TrafficCounters>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                while let Some(done) = in_flight.try_join_next() {
                    if let Err(e) = done {
                        warn!("Traffic request task failed: {}", e);
                    }
                }
                let Some(url) = pick_url(&targets) else { break };
                let client = client.clone();
                let counters = counters.clone();
                in_flight.spawn(async move {
                    let ok = send(&client, &url).await;
                    counters.record(ok);
                });
            }
        }
    }

    // unanswered requests are dropped uncounted
    in_flight.shutdown().await;
}

fn pick_url(targets: &[String]) -> Option<String> {
    let mut rng = rand::thread_rng();
    let base = targets.choose(&mut rng)?;
    let endpoint = ENDPOINTS.choose(&mut rng)?;
    Some(format!("{}{}", base.trim_end_matches('/'), endpoint))
}

async fn send(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) => resp.status().as_u16() < 400,
        Err(e) => {
            debug!("Traffic request to {} failed: {}", url, e);
            false
        }
    }
}
