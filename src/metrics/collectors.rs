//! Recording helpers over the raw Prometheus statics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! and tests can record freely.

use super::prometheus::{
    FLEET_SIZE, QUEUE_DEPTH, QUEUE_LOAD, REDELIVERIES_TOTAL, TRIALS_IN_FLIGHT, TRIALS_TOTAL,
    TRIAL_DURATION, WORKER_DRAINING,
};

/// Metrics collector for trialforge operations.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finalized trial.
    pub fn record_trial(&self, status: &str, harness: &str, duration_secs: f64) {
        if let Some(trials_total) = TRIALS_TOTAL.get() {
            trials_total.with_label_values(&[status, harness]).inc();
        }

        if let Some(duration) = TRIAL_DURATION.get() {
            duration.observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            harness = harness,
            duration_secs = duration_secs,
            "Recorded trial metric"
        );
    }

    /// Record a delivery left for redelivery.
    pub fn record_redelivery(&self) {
        if let Some(counter) = REDELIVERIES_TOTAL.get() {
            counter.inc();
        }
    }

    /// Set the number of trials executing on this worker.
    pub fn set_in_flight(&self, count: usize) {
        if let Some(gauge) = TRIALS_IN_FLIGHT.get() {
            gauge.set(count as f64);
        }
    }

    /// Set the visible depth of a queue.
    pub fn set_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.with_label_values(&[queue_name]).set(depth as f64);
        }
    }

    /// Set the per-worker load.
    pub fn set_queue_load(&self, load: f64) {
        if let Some(gauge) = QUEUE_LOAD.get() {
            gauge.set(load);
        }
    }

    /// Set the fleet size.
    pub fn set_fleet_size(&self, size: u32) {
        if let Some(gauge) = FLEET_SIZE.get() {
            gauge.set(f64::from(size));
        }
    }

    /// Flag whether this worker is draining.
    pub fn set_draining(&self, draining: bool) {
        if let Some(gauge) = WORKER_DRAINING.get() {
            gauge.set(if draining { 1.0 } else { 0.0 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prometheus::{export_metrics, init_metrics};

    #[test]
    fn test_collector_records_after_init() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_trial("succeeded", "harbor", 42.0);
        collector.record_redelivery();
        collector.set_queue_load(1.5);
        collector.set_draining(true);

        let metrics = export_metrics();
        assert!(metrics.contains("trialforge_trials_total"));
        assert!(metrics.contains("trialforge_worker_draining"));
    }
}
