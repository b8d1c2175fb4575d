//! Drain controller: stop intake, let in-flight trials finish, then stop.
//!
//! ```text
//! Active ──notice / request_drain──▶ Draining ──idle or deadline──▶ Stopped
//! ```
//!
//! The state is published on a watch channel. The worker pool's fetch loop
//! watches it and stops fetching as soon as it leaves `Active`. Trials still
//! running at the deadline are abandoned: their messages stay unacknowledged
//! and the queue redelivers them after the visibility timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::notice::{TerminationNotice, TerminationSource};
use crate::capacity::FleetManager;
use crate::metrics::MetricsCollector;

/// Default bound on how long a drain waits for in-flight trials.
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(40 * 60);

/// Default interval between termination-source polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainState {
    Active,
    Draining,
    Stopped,
}

impl DrainState {
    /// Returns whether the worker should keep fetching.
    pub fn is_active(&self) -> bool {
        matches!(self, DrainState::Active)
    }
}

/// What a drain waits on.
#[async_trait]
pub trait DrainTarget: Send + Sync {
    /// Number of executions still running.
    fn in_flight(&self) -> usize;

    /// Resolves once intake has stopped and nothing is running.
    async fn wait_idle(&self);
}

/// Outcome of a completed drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Why the drain started.
    pub reason: String,
    /// Executions still running when the deadline elapsed.
    pub abandoned: usize,
    /// Time spent draining.
    pub elapsed: Duration,
    /// Whether the fleet manager was told this worker may go.
    pub acknowledged: bool,
}

/// Drives one worker through `Active → Draining → Stopped`.
pub struct DrainController {
    worker_id: String,
    target: Arc<dyn DrainTarget>,
    sources: Vec<Arc<dyn TerminationSource>>,
    fleet: Option<Arc<dyn FleetManager>>,
    deadline: Duration,
    poll_interval: Duration,
    state_tx: watch::Sender<DrainState>,
    request_tx: watch::Sender<Option<TerminationNotice>>,
    metrics: MetricsCollector,
}

impl DrainController {
    /// Creates a controller for the given worker.
    pub fn new(worker_id: impl Into<String>, target: Arc<dyn DrainTarget>) -> Self {
        let (state_tx, _) = watch::channel(DrainState::Active);
        let (request_tx, _) = watch::channel(None);
        Self {
            worker_id: worker_id.into(),
            target,
            sources: Vec::new(),
            fleet: None,
            deadline: DEFAULT_DRAIN_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state_tx,
            request_tx,
            metrics: MetricsCollector::new(),
        }
    }

    /// Adds a termination source to poll.
    pub fn with_source(mut self, source: Arc<dyn TerminationSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Sets the fleet manager acknowledged on fleet-managed drains.
    pub fn with_fleet(mut self, fleet: Arc<dyn FleetManager>) -> Self {
        self.fleet = Some(fleet);
        self
    }

    /// Sets the drain deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sets the source poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> DrainState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.state_tx.subscribe()
    }

    /// Asks the worker to drain. Only the first request is kept.
    pub fn request_drain(&self, notice: TerminationNotice) {
        self.request_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(notice);
            true
        });
    }

    /// Waits for a drain trigger, drains, and returns the report.
    pub async fn run(&self) -> DrainReport {
        let notice = self.wait_for_notice().await;
        self.drain(notice).await
    }

    async fn wait_for_notice(&self) -> TerminationNotice {
        let mut requests = self.request_tx.subscribe();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if let Some(notice) = requests.borrow_and_update().clone() {
                return notice;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(notice) = self.poll_sources().await {
                        return notice;
                    }
                }
                // The sender lives in `self`, so this only errors if self is gone.
                _ = requests.changed() => {}
            }
        }
    }

    async fn poll_sources(&self) -> Option<TerminationNotice> {
        for source in &self.sources {
            match source.poll().await {
                Ok(Some(notice)) => {
                    info!(
                        worker_id = %self.worker_id,
                        source = source.name(),
                        reason = %notice.reason,
                        "Termination notice received"
                    );
                    return Some(notice);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(worker_id = %self.worker_id, source = source.name(), error = %e, "Notice poll failed");
                }
            }
        }
        None
    }

    async fn drain(&self, notice: TerminationNotice) -> DrainReport {
        let started = Instant::now();
        self.state_tx.send_replace(DrainState::Draining);
        self.metrics.set_draining(true);
        info!(
            worker_id = %self.worker_id,
            reason = %notice.reason,
            in_flight = self.target.in_flight(),
            deadline_secs = self.deadline.as_secs(),
            "Draining worker"
        );

        let abandoned = match tokio::time::timeout(self.deadline, self.target.wait_idle()).await {
            Ok(()) => 0,
            Err(_) => {
                let abandoned = self.target.in_flight();
                warn!(
                    worker_id = %self.worker_id,
                    abandoned,
                    "Drain deadline elapsed, abandoning trials to redelivery"
                );
                abandoned
            }
        };

        self.state_tx.send_replace(DrainState::Stopped);

        let acknowledged = match (&self.fleet, notice.fleet_managed) {
            (Some(fleet), true) => match fleet.acknowledge_termination(&self.worker_id).await {
                Ok(()) => true,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Failed to acknowledge termination");
                    false
                }
            },
            _ => false,
        };

        let report = DrainReport {
            reason: notice.reason,
            abandoned,
            elapsed: started.elapsed(),
            acknowledged,
        };
        info!(
            worker_id = %self.worker_id,
            abandoned = report.abandoned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            acknowledged = report.acknowledged,
            "Worker stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::InMemoryFleet;
    use crate::lifecycle::notice::ManualNotice;

    struct CountingTarget {
        count: watch::Sender<usize>,
    }

    impl CountingTarget {
        fn new(count: usize) -> Arc<Self> {
            let (count, _) = watch::channel(count);
            Arc::new(Self { count })
        }
    }

    #[async_trait]
    impl DrainTarget for CountingTarget {
        fn in_flight(&self) -> usize {
            *self.count.borrow()
        }

        async fn wait_idle(&self) {
            let mut rx = self.count.subscribe();
            let _ = rx.wait_for(|n| *n == 0).await;
        }
    }

    #[tokio::test]
    async fn test_request_drain_waits_for_idle() {
        let target = CountingTarget::new(2);
        let fleet = Arc::new(InMemoryFleet::new(3));
        let controller = Arc::new(
            DrainController::new("w-1", target.clone())
                .with_fleet(fleet.clone())
                .with_poll_interval(Duration::from_millis(10)),
        );
        let mut state = controller.subscribe();

        let runner = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run().await })
        };
        controller.request_drain(TerminationNotice::fleet("scale in"));

        state.wait_for(|s| *s == DrainState::Draining).await.unwrap();
        target.count.send_replace(0);

        let report = runner.await.unwrap();
        assert_eq!(report.reason, "scale in");
        assert_eq!(report.abandoned, 0);
        assert!(report.acknowledged);
        assert_eq!(controller.state(), DrainState::Stopped);
        assert_eq!(fleet.acknowledged(), vec!["w-1".to_string()]);
    }

    #[tokio::test]
    async fn test_deadline_abandons_in_flight() {
        let target = CountingTarget::new(3);
        let controller = DrainController::new("w-2", target)
            .with_deadline(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(10));
        controller.request_drain(TerminationNotice::local("SIGTERM"));

        let report = controller.run().await;
        assert_eq!(report.abandoned, 3);
        assert!(!report.acknowledged);
        assert!(report.elapsed >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_polled_source_triggers_drain() {
        let source = Arc::new(ManualNotice::new());
        let controller = Arc::new(
            DrainController::new("w-3", CountingTarget::new(0))
                .with_source(source.clone())
                .with_poll_interval(Duration::from_millis(10)),
        );

        let runner = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(controller.state(), DrainState::Active);

        source.trigger(TerminationNotice::fleet("spot reclaim"));
        let report = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("drain should finish")
            .unwrap();
        assert_eq!(report.reason, "spot reclaim");
        // Fleet-managed, but no fleet configured.
        assert!(!report.acknowledged);
    }

    #[test]
    fn test_drain_state_is_active() {
        assert!(DrainState::Active.is_active());
        assert!(!DrainState::Draining.is_active());
        assert!(!DrainState::Stopped.is_active());
    }
}
