//! LoadGrid contracts - types exchanged between the kernel and its nodes
//!
//! Both sides of the wire depend on this crate so that a level vector validated by the
//! kernel is read back by the node with the same key set and the same bounds:
//! - `resources` : resource keys, profiles, `IntensityVector` and its validation
//! - `metrics`   : `MetricsSample` and the node metrics/health bodies
//! - `wire`      : small request/response bodies shared by both HTTP surfaces

pub mod metrics;
pub mod resources;
pub mod wire;

pub use metrics::{HealthStatus, MetricsSample, MetricsSource, NodeHealth, NodeMetrics};
pub use resources::{
    IntensityVector, ResourceKey, ResourceProfile, ResourceRole, ValidationError, MAX_LEVEL,
};
pub use wire::{ErrorBody, LevelsAck, RunningToggle};
