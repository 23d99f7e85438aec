//! Static analyses over the lifted IR: metrics and status-flag liveness.

pub mod liveness;
pub mod metrics;

pub use liveness::FlagsLiveness;
pub use metrics::{Metrics, MetricsDelta, collect_metrics, compare};
