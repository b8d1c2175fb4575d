//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by trialforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all trialforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finalized trials, labeled by status and harness.
pub static TRIALS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Trial attempt duration in seconds.
pub static TRIAL_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Trials currently executing on this worker.
pub static TRIALS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Deliveries left unacknowledged for redelivery.
pub static REDELIVERIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Visible messages in the work queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Queue depth divided by worker count.
pub static QUEUE_LOAD: OnceLock<Gauge> = OnceLock::new();

/// Fleet size as reported by the fleet manager.
pub static FLEET_SIZE: OnceLock<Gauge> = OnceLock::new();

/// 1 while this worker is draining.
pub static WORKER_DRAINING: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling it again is harmless: the first set of
/// metrics stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let trials_total = CounterVec::new(
        Opts::new("trialforge_trials_total", "Total number of finalized trials"),
        &["status", "harness"],
    )?;

    let trial_duration = Histogram::with_opts(
        HistogramOpts::new(
            "trialforge_trial_duration_seconds",
            "Trial attempt duration in seconds",
        )
        .buckets(vec![30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0]),
    )?;

    let trials_in_flight = Gauge::new(
        "trialforge_trials_in_flight",
        "Number of trials currently executing",
    )?;

    let redeliveries_total = Counter::new(
        "trialforge_redeliveries_total",
        "Deliveries left unacknowledged for redelivery",
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("trialforge_queue_depth", "Number of messages waiting in the queue"),
        &["queue_name"],
    )?;

    let queue_load = Gauge::new(
        "trialforge_queue_load_per_worker",
        "Queue depth divided by worker count",
    )?;

    let fleet_size = Gauge::new("trialforge_fleet_size", "Number of workers in the fleet")?;

    let worker_draining = Gauge::new(
        "trialforge_worker_draining",
        "Whether this worker is draining (1) or not (0)",
    )?;

    registry.register(Box::new(trials_total.clone()))?;
    registry.register(Box::new(trial_duration.clone()))?;
    registry.register(Box::new(trials_in_flight.clone()))?;
    registry.register(Box::new(redeliveries_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(queue_load.clone()))?;
    registry.register(Box::new(fleet_size.clone()))?;
    registry.register(Box::new(worker_draining.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = TRIALS_TOTAL.set(trials_total);
    let _ = TRIAL_DURATION.set(trial_duration);
    let _ = TRIALS_IN_FLIGHT.set(trials_in_flight);
    let _ = REDELIVERIES_TOTAL.set(redeliveries_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = QUEUE_LOAD.set(queue_load);
    let _ = FLEET_SIZE.set(fleet_size);
    let _ = WORKER_DRAINING.set(worker_draining);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.with_label_values(&["trials"]).set(12.0);
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("trialforge_queue_depth"));
    }
}
