//! Synthetic business records
//!
//! The `orders` and `completions` levels drive a batch workload. Every period the node
//! builds `level × 10` order records and `level × 5` completion records, validates them,
//! counts them and drops them. Nothing survives a batch, so memory stays bounded by one
//! batch whatever the level.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const ORDERS_PER_LEVEL: u64 = 10;
pub const COMPLETIONS_PER_LEVEL: u64 = 5;
/// Records built between two cancellation checks
const CHECK_EVERY: u64 = 50;

#[derive(Debug, Default)]
pub struct RecordCounters {
    orders: AtomicU64,
    completions: AtomicU64,
}

impl RecordCounters {
    /// `(orders_processed, completions_processed)`
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.orders.load(Ordering::Relaxed),
            self.completions.load(Ordering::Relaxed),
        )
    }
}

pub fn batch_size(level: u8, per_level: u64) -> u64 {
    u64::from(level.min(100)) * per_level
}

struct Order {
    items: u32,
    total: f64,
}

impl Order {
    fn random(rng: &mut StdRng) -> Self {
        Self { items: rng.gen_range(1..=10), total: rng.gen_range(10.0..1000.0) }
    }

    fn is_valid(&self) -> bool {
        self.items > 0 && self.total > 0.0
    }
}

struct Completion {
    duration_secs: f64,
}

impl Completion {
    fn random(rng: &mut StdRng) -> Self {
        Self { duration_secs: rng.gen_range(0.1..5.0) }
    }

    fn is_valid(&self) -> bool {
        self.duration_secs > 0.0
    }
}

pub struct RecordLoad {
    orders: u8,
    completions: u8,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RecordLoad {
    /// `None` when both levels are zero
    pub fn start(orders: u8, completions: u8, period: Duration, counters: Arc<RecordCounters>) -> Option<Self> {
        if orders == 0 && completions == 0 {
            return None;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run(orders, completions, period, counters, token.clone()));
        debug!("Record workload started (orders {}, completions {})", orders, completions);
        Some(Self { orders, completions, token, task })
    }

    /// `(orders, completions)`
    pub fn levels(&self) -> (u8, u8) {
        (self.orders, self.completions)
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        if let Err(e) = (&mut self.task).await {
            warn!("Record workload ended abnormally: {}", e);
        }
    }
}

impl Drop for RecordLoad {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(
    orders: u8,
    completions: u8,
    period: Duration,
    counters: Arc<RecordCounters>,
    token: CancellationToken,
) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let order_batch = batch_size(orders, ORDERS_PER_LEVEL);
                let done = process(order_batch, &counters.orders, &token, || {
                    Order::random(&mut rng).is_valid()
                })
                .await;
                if !done {
                    break;
                }

                let completion_batch = batch_size(completions, COMPLETIONS_PER_LEVEL);
                let done = process(completion_batch, &counters.completions, &token, || {
                    Completion::random(&mut rng).is_valid()
                })
                .await;
                if !done {
                    break;
                }
            }
        }
    }
}

/// Builds `count` records; false when cancelled midway
async fn process<F>(count: u64, counter: &AtomicU64, token: &CancellationToken, mut build: F) -> bool
where
    F: FnMut() -> bool,
{
    for i in 1..=count {
        if build() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if i % CHECK_EVERY == 0 {
            if token.is_cancelled() {
                return false;
            }
            tokio::task::yield_now().await;
        }
    }
    true
}
