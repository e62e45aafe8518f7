//! PGC Telemetry
//!
//! Decision counters kept in-process for the stats endpoint, and the
//! descriptions of every metric the workspace emits through the `metrics`
//! facade.

pub mod metrics;

pub use crate::metrics::{describe_metrics, DecisionMetrics, MetricsSnapshot};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::metrics::{DecisionMetrics, MetricsSnapshot};
}
