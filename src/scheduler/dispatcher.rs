//! Dispatcher: turns a submitted job into N queued trial messages.
//!
//! Submission writes the job and all trial rows first, in one transaction,
//! then publishes one message per trial and marks them enqueued. The
//! reconciliation sweep repairs whatever a crash between those steps left
//! behind.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aggregate::JobObserver;
use super::job::{Job, JobId, JobSpec, JobStatus, Trial, TrialRef};
use super::queue::{QueueError, WorkQueue};
use crate::error::ValidationError;
use crate::storage::{StoreError, TrialStore};

/// Default age after which reconciliation touches a job.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(120);

/// Errors that can occur while dispatching.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The job spec was rejected.
    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Trials published that had never been marked enqueued.
    pub trials_reenqueued: usize,
    /// Pending jobs moved to Running.
    pub jobs_started: usize,
    /// Running jobs finalized.
    pub jobs_finalized: usize,
}

impl ReconcileReport {
    /// Whether the pass changed anything.
    pub fn is_empty(&self) -> bool {
        self.trials_reenqueued == 0 && self.jobs_started == 0 && self.jobs_finalized == 0
    }
}

/// Publishes trials for submitted jobs.
pub struct Dispatcher {
    store: Arc<dyn TrialStore>,
    queue: Arc<dyn WorkQueue>,
    observer: JobObserver,
    grace_period: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(store: Arc<dyn TrialStore>, queue: Arc<dyn WorkQueue>, observer: JobObserver) -> Self {
        Self {
            store,
            queue,
            observer,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Sets how old a job must be before reconciliation touches it.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Submits a job under a fresh id.
    pub async fn submit(&self, spec: &JobSpec) -> Result<JobId, DispatchError> {
        self.submit_with_id(Uuid::new_v4(), spec).await
    }

    /// Submits a job under a caller-chosen id.
    ///
    /// Nothing is written if the spec is invalid.
    pub async fn submit_with_id(&self, job_id: JobId, spec: &JobSpec) -> Result<JobId, DispatchError> {
        spec.validate()?;

        let job = Job::from_spec(job_id, spec);
        let refs = job.trial_refs();
        let trials: Vec<Trial> = refs
            .iter()
            .map(|r| Trial::queued(r.job_id, r.trial_number))
            .collect();

        self.store.create_job(&job, &trials).await?;
        info!(
            job_id = %job_id,
            task = %job.task_name,
            harness = %job.harness,
            trials = job.requested_trials,
            "Job created"
        );

        self.publish(job_id, &refs).await?;
        self.start_job(job_id).await?;

        Ok(job_id)
    }

    /// Enqueues `refs` in order and marks them enqueued.
    async fn publish(&self, job_id: JobId, refs: &[TrialRef]) -> Result<(), DispatchError> {
        self.queue.enqueue_batch(refs).await?;
        let numbers: Vec<u32> = refs.iter().map(|r| r.trial_number).collect();
        self.store.mark_enqueued(job_id, &numbers).await?;
        debug!(job_id = %job_id, count = refs.len(), "Trials enqueued");
        Ok(())
    }

    /// Moves a job to Running, then finalizes it if its trials already finished.
    async fn start_job(&self, job_id: JobId) -> Result<bool, DispatchError> {
        let started = self
            .store
            .transition_job(job_id, JobStatus::Pending, JobStatus::Running)
            .await?;
        if started {
            // Fast trials may have finished before the job was Running.
            self.observer.refresh(job_id).await?;
        }
        Ok(started)
    }

    /// Runs one reconciliation pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport, DispatchError> {
        let mut report = ReconcileReport::default();
        let grace = chrono::Duration::from_std(self.grace_period)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - grace;

        // 1. Trials that were written but never published.
        let orphans = self.store.unenqueued_trials(cutoff).await?;
        let mut by_job: BTreeMap<JobId, Vec<TrialRef>> = BTreeMap::new();
        for trial_ref in orphans {
            by_job.entry(trial_ref.job_id).or_default().push(trial_ref);
        }
        for (job_id, refs) in by_job {
            warn!(job_id = %job_id, count = refs.len(), "Re-enqueueing unpublished trials");
            self.publish(job_id, &refs).await?;
            report.trials_reenqueued += refs.len();
        }

        // 2. Pending jobs whose trials are all published.
        for job in self.store.jobs_with_status(JobStatus::Pending).await? {
            if job.created_at >= cutoff {
                continue;
            }
            let trials = self.store.get_trials(job.id).await?;
            if trials.iter().all(|t| t.enqueued_at.is_some()) && self.start_job(job.id).await? {
                info!(job_id = %job.id, "Recovered pending job");
                report.jobs_started += 1;
            }
        }

        // 3. Running jobs whose aggregate update was lost.
        for job in self.store.jobs_with_status(JobStatus::Running).await? {
            if self.observer.refresh(job.id).await?.is_some() {
                report.jobs_finalized += 1;
            }
        }

        if !report.is_empty() {
            info!(?report, "Reconciliation pass changed state");
        }
        Ok(report)
    }

    /// Runs `reconcile` every `interval` until `shutdown` turns true.
    pub async fn run_reconciler(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::aggregate::FailureThresholdPolicy;
    use crate::scheduler::job::{Harness, TrialOutcome, TrialStatus};
    use crate::scheduler::memory_queue::MemoryWorkQueue;
    use crate::storage::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryWorkQueue>, Dispatcher) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryWorkQueue::new("trials", Duration::from_secs(60)));
        let observer = JobObserver::new(store.clone(), Arc::new(FailureThresholdPolicy::default()));
        let dispatcher =
            Dispatcher::new(store.clone(), queue.clone(), observer).with_grace_period(Duration::ZERO);
        (store, queue, dispatcher)
    }

    fn spec(trials: u32) -> JobSpec {
        JobSpec::new("hello", "jobs/x/task", Harness::Harbor, "model").with_trials(trials)
    }

    #[tokio::test]
    async fn test_submit_creates_and_enqueues_in_order() {
        let (store, queue, dispatcher) = setup();
        let job_id = dispatcher.submit(&spec(5)).await.unwrap();

        let trials = store.get_trials(job_id).await.unwrap();
        let numbers: Vec<u32> = trials.iter().map(|t| t.trial_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert!(trials.iter().all(|t| t.status == TrialStatus::Queued));
        assert!(trials.iter().all(|t| t.enqueued_at.is_some()));
        assert!(trials.iter().all(|t| t.attempt_count == 0));

        let queued: Vec<u32> = queue
            .visible_refs()
            .await
            .iter()
            .map(|r| r.trial_number)
            .collect();
        assert_eq!(queued, vec![1, 2, 3, 4, 5]);

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_invalid_submission_leaves_no_state() {
        let (store, queue, dispatcher) = setup();

        let err = dispatcher.submit(&spec(0)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert!(dispatcher.submit(&spec(101)).await.is_err());

        assert_eq!(store.job_count().await, 0);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_republishes_unmarked_trials() {
        let (store, queue, dispatcher) = setup();

        // Simulate a crash after the rows were written but before enqueue.
        let job = Job::from_spec(Uuid::new_v4(), &spec(3));
        let trials: Vec<Trial> = job
            .trial_refs()
            .iter()
            .map(|r| Trial::queued(r.job_id, r.trial_number))
            .collect();
        store.create_job(&job, &trials).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = dispatcher.reconcile().await.unwrap();
        assert_eq!(report.trials_reenqueued, 3);
        assert_eq!(report.jobs_started, 1);
        assert_eq!(queue.depth().await.unwrap(), 3);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);

        // Nothing left to do.
        assert!(dispatcher.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_finalizes_finished_jobs() {
        let (store, _queue, dispatcher) = setup();
        let job_id = dispatcher.submit(&spec(2)).await.unwrap();

        // Trial writes landed but the aggregate update was lost.
        for n in 1..=2 {
            store
                .finalize_trial(TrialRef::new(job_id, n), &TrialOutcome::failed("boom"))
                .await
                .unwrap();
        }

        let report = dispatcher.reconcile().await.unwrap();
        assert_eq!(report.jobs_finalized, 1);
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_reconciler_stops_on_shutdown() {
        let (_store, _queue, dispatcher) = setup();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            dispatcher
                .run_reconciler(Duration::from_millis(10), rx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reconciler should stop")
            .unwrap();
    }
}
