//! Operational surface: health probes, status counts, metrics.

mod health;
mod metrics;

pub use health::{observability_router, HealthState, ObservabilityState};
pub use metrics::{HubMetrics, MetricsSnapshot};
