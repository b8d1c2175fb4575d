//! Queue-depth-driven fleet sizing.
//!
//! Each cycle samples the visible queue depth and the fleet size, computes
//! `load = depth / max(workers, 1)` and compares it with the per-worker
//! target. A resize is only requested after enough consecutive samples agree.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::fleet::{FleetError, FleetManager};
use crate::config::ScalerConfig;
use crate::metrics::MetricsCollector;
use crate::scheduler::queue::{QueueError, WorkQueue};

/// Errors raised during a capacity cycle.
#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),
}

/// Which way the fleet should move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScaleDirective {
    ScaleOut { desired: u32 },
    ScaleIn { desired: u32 },
    Hold,
}

/// Queued trials per worker.
pub fn load_per_worker(depth: usize, workers: u32) -> f64 {
    depth as f64 / f64::from(workers.max(1))
}

/// Compares the load against `target` trials per worker.
///
/// The desired size is `ceil(depth / target)`, unclamped.
pub fn compute_directive(depth: usize, workers: u32, target: usize) -> ScaleDirective {
    let target = target.max(1);
    let load = load_per_worker(depth, workers);
    let desired = u32::try_from(depth.div_ceil(target)).unwrap_or(u32::MAX);

    if load > target as f64 {
        ScaleDirective::ScaleOut { desired }
    } else if load < target as f64 {
        ScaleDirective::ScaleIn { desired }
    } else {
        ScaleDirective::Hold
    }
}

/// Result of one capacity cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacitySample {
    pub depth: usize,
    pub workers: u32,
    pub load: f64,
    /// What this sample alone points to, after clamping.
    pub directive: ScaleDirective,
    /// What was actually requested from the fleet, if anything.
    pub issued: Option<ScaleDirective>,
}

/// Wraps [`compute_directive`] with fleet bounds and hysteresis.
pub struct CapacityController {
    queue: Arc<dyn WorkQueue>,
    fleet: Arc<dyn FleetManager>,
    config: ScalerConfig,
    out_streak: u32,
    in_streak: u32,
    metrics: MetricsCollector,
}

impl CapacityController {
    /// Creates a controller.
    pub fn new(queue: Arc<dyn WorkQueue>, fleet: Arc<dyn FleetManager>, config: ScalerConfig) -> Self {
        Self {
            queue,
            fleet,
            config,
            out_streak: 0,
            in_streak: 0,
            metrics: MetricsCollector::new(),
        }
    }

    /// Clamps a raw directive to the fleet bounds. A directive that would not
    /// change the fleet becomes `Hold`.
    fn clamp(&self, raw: ScaleDirective, workers: u32) -> ScaleDirective {
        let desired = match raw {
            ScaleDirective::ScaleOut { desired } | ScaleDirective::ScaleIn { desired } => desired,
            ScaleDirective::Hold => return ScaleDirective::Hold,
        };
        let desired = desired.clamp(self.config.min_workers, self.config.max_workers);

        match (raw, desired.cmp(&workers)) {
            (ScaleDirective::ScaleOut { .. }, std::cmp::Ordering::Greater) => {
                ScaleDirective::ScaleOut { desired }
            }
            (ScaleDirective::ScaleIn { .. }, std::cmp::Ordering::Less) => {
                ScaleDirective::ScaleIn { desired }
            }
            _ => ScaleDirective::Hold,
        }
    }

    /// Feeds one directive through the streak counters. Returns it once the
    /// streak is long enough.
    fn observe(&mut self, directive: ScaleDirective) -> Option<ScaleDirective> {
        match directive {
            ScaleDirective::ScaleOut { .. } => {
                self.in_streak = 0;
                self.out_streak += 1;
                if self.out_streak >= self.config.scale_out_samples.max(1) {
                    self.out_streak = 0;
                    return Some(directive);
                }
            }
            ScaleDirective::ScaleIn { .. } => {
                self.out_streak = 0;
                self.in_streak += 1;
                if self.in_streak >= self.config.scale_in_samples.max(1) {
                    self.in_streak = 0;
                    return Some(directive);
                }
            }
            ScaleDirective::Hold => {
                self.out_streak = 0;
                self.in_streak = 0;
            }
        }
        None
    }

    /// Runs one sample and applies its directive if the streak allows.
    pub async fn tick(&mut self) -> Result<CapacitySample, CapacityError> {
        let stats = self.queue.stats().await?;
        let workers = self.fleet.current_size().await?;
        let load = load_per_worker(stats.visible, workers);

        self.metrics.set_queue_depth(&stats.queue_name, stats.visible);
        self.metrics.set_queue_load(load);
        self.metrics.set_fleet_size(workers);

        let raw = compute_directive(stats.visible, workers, self.config.target_per_worker);
        let directive = self.clamp(raw, workers);
        let issued = self.observe(directive);

        match issued {
            Some(ScaleDirective::ScaleOut { desired }) | Some(ScaleDirective::ScaleIn { desired }) => {
                info!(
                    depth = stats.visible,
                    workers,
                    load,
                    desired,
                    "Requesting fleet resize"
                );
                self.fleet.request_size(desired).await?;
            }
            _ => debug!(depth = stats.visible, workers, load, ?directive, "Capacity sample"),
        }

        Ok(CapacitySample {
            depth: stats.visible,
            workers,
            load,
            directive,
            issued,
        })
    }

    /// Samples every configured interval until `shutdown` turns true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Capacity cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Capacity controller stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capacity::InMemoryFleet;
    use crate::scheduler::job::TrialRef;
    use crate::scheduler::memory_queue::MemoryWorkQueue;

    #[test]
    fn test_compute_directive_hold_at_target() {
        assert_eq!(compute_directive(600, 10, 60), ScaleDirective::Hold);
    }

    #[test]
    fn test_compute_directive_scale_out() {
        assert_eq!(
            compute_directive(1200, 10, 60),
            ScaleDirective::ScaleOut { desired: 20 }
        );
    }

    #[test]
    fn test_compute_directive_scale_in() {
        assert_eq!(
            compute_directive(100, 10, 60),
            ScaleDirective::ScaleIn { desired: 2 }
        );
    }

    #[test]
    fn test_compute_directive_empty_fleet() {
        assert_eq!(
            compute_directive(61, 0, 60),
            ScaleDirective::ScaleOut { desired: 2 }
        );
        assert_eq!(load_per_worker(30, 0), 30.0);
    }

    fn controller(fleet: Arc<InMemoryFleet>, queue: Arc<MemoryWorkQueue>) -> CapacityController {
        let config = ScalerConfig {
            min_workers: 1,
            max_workers: 10,
            ..Default::default()
        };
        CapacityController::new(queue, fleet, config)
    }

    async fn fill(queue: &MemoryWorkQueue, n: u32) {
        let job_id = uuid::Uuid::new_v4();
        let refs: Vec<TrialRef> = (1..=n).map(|i| TrialRef::new(job_id, i)).collect();
        queue.enqueue_batch(&refs).await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_out_is_clamped_to_max() {
        let queue = Arc::new(MemoryWorkQueue::new("trials", Duration::from_secs(60)));
        let fleet = Arc::new(InMemoryFleet::new(2));
        fill(&queue, 1200).await;

        let mut controller = controller(fleet.clone(), queue);
        let sample = controller.tick().await.unwrap();

        assert_eq!(sample.issued, Some(ScaleDirective::ScaleOut { desired: 10 }));
        assert_eq!(fleet.requested_sizes(), vec![10]);
    }

    #[tokio::test]
    async fn test_scale_in_needs_three_samples() {
        let queue = Arc::new(MemoryWorkQueue::new("trials", Duration::from_secs(60)));
        let fleet = Arc::new(InMemoryFleet::new(5));
        fill(&queue, 60).await;

        let mut controller = controller(fleet.clone(), queue);
        assert_eq!(controller.tick().await.unwrap().issued, None);
        assert_eq!(controller.tick().await.unwrap().issued, None);
        assert_eq!(
            controller.tick().await.unwrap().issued,
            Some(ScaleDirective::ScaleIn { desired: 1 })
        );
        assert_eq!(fleet.requested_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_floor_turns_scale_in_into_hold() {
        let queue = Arc::new(MemoryWorkQueue::new("trials", Duration::from_secs(60)));
        let fleet = Arc::new(InMemoryFleet::new(1));

        let mut controller = controller(fleet.clone(), queue);
        for _ in 0..4 {
            let sample = controller.tick().await.unwrap();
            assert_eq!(sample.directive, ScaleDirective::Hold);
        }
        assert!(fleet.requested_sizes().is_empty());
    }
}
