//! Metrics module for Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use trialforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_trial("succeeded", "harbor", 120.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    FLEET_SIZE, QUEUE_DEPTH, QUEUE_LOAD, REDELIVERIES_TOTAL, REGISTRY, TRIALS_IN_FLIGHT,
    TRIALS_TOTAL, TRIAL_DURATION, WORKER_DRAINING,
};
