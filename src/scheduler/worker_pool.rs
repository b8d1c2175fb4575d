//! Worker pool executor.
//!
//! Each worker process runs one pool. The pool owns a semaphore of
//! `capacity` execution slots; the fetch loop takes a slot before it fetches,
//! so a worker never holds more leases than it can run. Each fetched message
//! is executed on its own task, which carries the slot permit and releases it
//! when the task ends, panics included.
//!
//! # Per-delivery flow
//!
//! 1. Load the trial. Terminal already: acknowledge the duplicate.
//! 2. Attempts exhausted: finalize Failed, acknowledge.
//! 3. Compare-and-set `attempt_count` n → n+1. Lost: acknowledge the duplicate.
//! 4. Run the sandbox runner under a hard timeout.
//! 5. Persist the outcome, then acknowledge. Retryable failures are left
//!    unacknowledged so the queue redelivers them after the visibility timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use super::aggregate::JobObserver;
use super::job::{Harness, TrialOutcome, TrialRef};
use super::queue::{Delivery, QueueError, WorkQueue};
use crate::lifecycle::drain::{DrainState, DrainTarget};
use crate::metrics::MetricsCollector;
use crate::runner::{FailureClass, RunRequest, RunnerError, SandboxRunner};
use crate::storage::{ArtifactError, ArtifactStore, StoreError, TrialStore};

/// Default number of concurrent trials per worker.
pub const DEFAULT_CAPACITY: usize = 60;

/// Default number of attempts before a trial is failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Errors that can occur while executing a delivery.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Preparing the attempt's artifact directory failed.
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Identifier recorded on every attempt this worker starts.
    pub worker_id: String,
    /// Number of concurrent execution slots.
    pub capacity: usize,
    /// Attempts allowed per trial.
    pub max_attempts: u32,
    /// How long one fetch waits for a message.
    pub fetch_wait: Duration,
    /// Base execution limit for Harbor trials.
    pub harbor_timeout: Duration,
    /// Base execution limit for Terminus trials.
    pub terminus_timeout: Duration,
    /// Multiplier applied to the base limits.
    pub timeout_multiplier: f64,
    /// Consecutive queue errors tolerated before the worker turns unhealthy.
    pub queue_error_budget: u32,
    /// Pause after a queue error.
    pub queue_error_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            capacity: DEFAULT_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            fetch_wait: Duration::from_secs(5),
            harbor_timeout: Duration::from_secs(60 * 60),
            terminus_timeout: Duration::from_secs(60 * 60),
            timeout_multiplier: 1.0,
            queue_error_budget: 10,
            queue_error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration for the given worker id.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Sets the number of execution slots.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the attempts allowed per trial.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets how long one fetch waits.
    pub fn with_fetch_wait(mut self, wait: Duration) -> Self {
        self.fetch_wait = wait;
        self
    }

    /// Sets the same base limit for every harness.
    pub fn with_trial_timeout(mut self, timeout: Duration) -> Self {
        self.harbor_timeout = timeout;
        self.terminus_timeout = timeout;
        self
    }

    /// Sets the timeout multiplier.
    pub fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    /// Sets the queue error budget and backoff.
    pub fn with_queue_error_budget(mut self, budget: u32, backoff: Duration) -> Self {
        self.queue_error_budget = budget;
        self.queue_error_backoff = backoff;
        self
    }

    /// Hard execution limit for a harness.
    pub fn trial_timeout(&self, harness: Harness) -> Duration {
        let base = match harness {
            Harness::Harbor => self.harbor_timeout,
            Harness::Terminus => self.terminus_timeout,
        };
        base.mul_f64(self.timeout_multiplier.max(0.0))
    }

    /// Longest hard execution limit across harnesses.
    pub fn max_trial_timeout(&self) -> Duration {
        self.trial_timeout(Harness::Harbor)
            .max(self.trial_timeout(Harness::Terminus))
    }
}

/// Health of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerHealth {
    Healthy,
    Unhealthy(String),
}

impl WorkerHealth {
    /// Returns whether the worker is healthy.
    pub fn is_healthy(&self) -> bool {
        matches!(self, WorkerHealth::Healthy)
    }
}

/// Why the fetch loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolExit {
    /// Intake stopped because the worker is draining.
    Drained,
    /// Intake stopped because the worker is unhealthy.
    Unhealthy(String),
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Number of execution slots.
    pub capacity: usize,
    /// Trials currently executing.
    pub in_flight: usize,
    /// Trials this worker finalized as Succeeded.
    pub trials_succeeded: u64,
    /// Trials this worker finalized as Failed.
    pub trials_failed: u64,
    /// Attempts left for redelivery.
    pub retried: u64,
    /// Deliveries acknowledged without running.
    pub duplicates: u64,
    /// Average attempt duration.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of trials finalized.
    pub fn total_finalized(&self) -> u64 {
        self.trials_succeeded + self.trials_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_finalized();
        if total == 0 {
            return 0.0;
        }
        (self.trials_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    trials_succeeded: AtomicU64,
    trials_failed: AtomicU64,
    retried: AtomicU64,
    duplicates: AtomicU64,
    attempts_timed: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            trials_succeeded: AtomicU64::new(0),
            trials_failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            attempts_timed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }
    }

    fn record_attempt(&self, duration: Duration) {
        self.attempts_timed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, capacity: usize, in_flight: usize) -> PoolStats {
        let timed = self.attempts_timed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let average_duration = if timed > 0 {
            Duration::from_millis(total_duration_ms / timed)
        } else {
            Duration::ZERO
        };

        PoolStats {
            capacity,
            in_flight,
            trials_succeeded: self.trials_succeeded.load(Ordering::SeqCst),
            trials_failed: self.trials_failed.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::SeqCst),
            average_duration,
        }
    }
}

/// What to do with a delivery once it has been handled.
#[derive(Debug)]
enum Disposition {
    Ack,
    Retry,
    Unavailable(String),
}

/// Trials currently executing, with a count per trial in case the queue
/// hands the same trial over twice.
#[derive(Default)]
struct InFlight {
    trials: HashMap<TrialRef, usize>,
    total: usize,
}

/// Worker pool that executes trials fetched from a work queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn TrialStore>,
    runner: Arc<dyn SandboxRunner>,
    artifacts: ArtifactStore,
    observer: JobObserver,
    slots: Arc<Semaphore>,
    in_flight: Mutex<InFlight>,
    in_flight_tx: watch::Sender<usize>,
    fetching_tx: watch::Sender<bool>,
    health_tx: watch::Sender<WorkerHealth>,
    queue_errors: AtomicU32,
    stats: SharedPoolStats,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates a pool. Nothing runs until [`WorkerPool::run`] is called.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn TrialStore>,
        runner: Arc<dyn SandboxRunner>,
        artifacts: ArtifactStore,
        observer: JobObserver,
    ) -> Self {
        let (in_flight_tx, _) = watch::channel(0);
        let (fetching_tx, _) = watch::channel(false);
        let (health_tx, _) = watch::channel(WorkerHealth::Healthy);

        Self {
            slots: Arc::new(Semaphore::new(config.capacity)),
            config,
            queue,
            store,
            runner,
            artifacts,
            observer,
            in_flight: Mutex::new(InFlight::default()),
            in_flight_tx,
            fetching_tx,
            health_tx,
            queue_errors: AtomicU32::new(0),
            stats: SharedPoolStats::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the worker id.
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats
            .to_pool_stats(self.config.capacity, self.in_flight_count())
    }

    /// Returns the current health.
    pub fn health(&self) -> WorkerHealth {
        self.health_tx.borrow().clone()
    }

    /// Subscribes to health changes.
    pub fn subscribe_health(&self) -> watch::Receiver<WorkerHealth> {
        self.health_tx.subscribe()
    }

    /// Trials currently executing on this worker.
    pub fn in_flight_trials(&self) -> Vec<TrialRef> {
        let mut trials: Vec<TrialRef> = self.lock_in_flight().trials.keys().copied().collect();
        trials.sort();
        trials
    }

    /// Number of executions currently running.
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().total
    }

    /// Free execution slots.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, InFlight> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mark_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(worker_id = %self.config.worker_id, reason = %reason, "Worker marked unhealthy");
        self.health_tx.send_replace(WorkerHealth::Unhealthy(reason));
    }

    /// Runs the fetch loop until the worker drains or turns unhealthy.
    ///
    /// Trials already started keep running after this returns; use
    /// [`DrainTarget::wait_idle`] to wait for them.
    pub async fn run(self: Arc<Self>, mut drain: watch::Receiver<DrainState>) -> PoolExit {
        let _fetching = FetchLoopGuard::enter(&self.fetching_tx);
        info!(
            worker_id = %self.config.worker_id,
            capacity = self.config.capacity,
            "Worker pool started"
        );

        loop {
            if !drain.borrow().is_active() {
                return self.exit_drained();
            }
            if let WorkerHealth::Unhealthy(reason) = self.health() {
                return PoolExit::Unhealthy(reason);
            }

            let permit = tokio::select! {
                biased;
                _ = drain_requested(&mut drain) => return self.exit_drained(),
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return PoolExit::Unhealthy("execution slots closed".to_string()),
                },
            };
            // A trial may have failed the worker while this loop waited for a slot.
            if let WorkerHealth::Unhealthy(reason) = self.health() {
                return PoolExit::Unhealthy(reason);
            }

            let fetched = tokio::select! {
                biased;
                _ = drain_requested(&mut drain) => return self.exit_drained(),
                fetched = self.queue.fetch(self.config.fetch_wait) => fetched,
            };

            match fetched {
                Ok(Some(delivery)) => {
                    self.queue_errors.store(0, Ordering::SeqCst);
                    self.spawn_delivery(delivery, permit);
                }
                Ok(None) => {
                    self.queue_errors.store(0, Ordering::SeqCst);
                    debug!(worker_id = %self.config.worker_id, "No messages available");
                }
                Err(e) => {
                    drop(permit);
                    let errors = self.queue_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        consecutive = errors,
                        "Failed to fetch from queue"
                    );
                    if errors >= self.config.queue_error_budget {
                        self.mark_unhealthy(format!(
                            "{} consecutive queue errors, last: {}",
                            errors, e
                        ));
                        continue;
                    }
                    tokio::time::sleep(self.config.queue_error_backoff).await;
                }
            }
        }
    }

    fn exit_drained(&self) -> PoolExit {
        info!(
            worker_id = %self.config.worker_id,
            in_flight = self.in_flight_count(),
            "Intake stopped for drain"
        );
        PoolExit::Drained
    }

    fn spawn_delivery(self: &Arc<Self>, delivery: Delivery, permit: OwnedSemaphorePermit) {
        let guard = InFlightGuard::enter(Arc::clone(self), delivery.message.trial_ref, permit);
        tokio::spawn(async move {
            let pool = Arc::clone(&guard.pool);
            pool.handle_delivery(delivery).await;
            drop(guard);
        });
    }

    /// Executes one delivery and settles it with the queue.
    async fn handle_delivery(&self, delivery: Delivery) {
        let trial_ref = delivery.message.trial_ref;

        match self.execute(&delivery).await {
            Ok(Disposition::Ack) => self.ack(&delivery).await,
            Ok(Disposition::Retry) => {
                self.stats.retried.fetch_add(1, Ordering::SeqCst);
                self.metrics.record_redelivery();
            }
            Ok(Disposition::Unavailable(reason)) => self.mark_unhealthy(reason),
            Err(e) => {
                // Unacknowledged: the queue redelivers after the visibility timeout.
                error!(
                    worker_id = %self.config.worker_id,
                    trial = %trial_ref,
                    error = %e,
                    "Failed to process delivery"
                );
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        match self.queue.ack(&delivery.lease).await {
            Ok(true) => {}
            Ok(false) => warn!(
                worker_id = %self.config.worker_id,
                trial = %delivery.message.trial_ref,
                "Lease expired before acknowledgement"
            ),
            Err(e) => error!(
                worker_id = %self.config.worker_id,
                trial = %delivery.message.trial_ref,
                error = %e,
                "Failed to acknowledge delivery"
            ),
        }
    }

    async fn execute(&self, delivery: &Delivery) -> Result<Disposition, PoolError> {
        let trial_ref = delivery.message.trial_ref;

        let Some(trial) = self.store.get_trial(trial_ref).await? else {
            warn!(trial = %trial_ref, "Delivery for unknown trial");
            return Ok(Disposition::Ack);
        };

        if trial.is_terminal() {
            debug!(trial = %trial_ref, "Trial already finalized, dropping duplicate");
            self.stats.duplicates.fetch_add(1, Ordering::SeqCst);
            return Ok(Disposition::Ack);
        }

        if trial.attempt_count >= self.config.max_attempts {
            let outcome = TrialOutcome::failed(format!(
                "attempts exhausted ({} of {})",
                trial.attempt_count, self.config.max_attempts
            ));
            self.finalize(trial_ref, None, &outcome).await?;
            return Ok(Disposition::Ack);
        }

        let Some(trial) = self
            .store
            .begin_attempt(trial_ref, trial.attempt_count, &self.config.worker_id)
            .await?
        else {
            debug!(trial = %trial_ref, "Attempt claimed elsewhere, dropping duplicate");
            self.stats.duplicates.fetch_add(1, Ordering::SeqCst);
            return Ok(Disposition::Ack);
        };
        let attempt = trial.attempt_count;

        let Some(job) = self.store.get_job(trial_ref.job_id).await? else {
            let outcome = TrialOutcome::failed("job record missing");
            self.finalize(trial_ref, None, &outcome).await?;
            return Ok(Disposition::Ack);
        };

        let timeout = self.config.trial_timeout(job.harness);
        let artifact_ref = ArtifactStore::attempt_ref(trial_ref, attempt);
        let request = RunRequest {
            trial_ref,
            attempt,
            task_dir: self.artifacts.resolve(&job.task_ref)?,
            output_dir: self.artifacts.prepare_attempt_dir(trial_ref, attempt).await?,
            artifact_ref: artifact_ref.clone(),
            harness: job.harness,
            model: job.model.clone(),
            timeout,
        };

        info!(
            worker_id = %self.config.worker_id,
            job_id = %trial_ref.job_id,
            trial = trial_ref.trial_number,
            attempt,
            redelivery = delivery.message.is_redelivery(),
            runner = self.runner.name(),
            "Trial attempt started"
        );

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.runner.run(&request)).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Timeout(timeout)),
        };
        let elapsed = started.elapsed();
        self.stats.record_attempt(elapsed);

        let outcome = match result {
            Ok(run) if run.is_success() => TrialOutcome::Succeeded {
                tests_passed: run.passed,
                tests_total: run.total,
                artifact_ref: run.artifact_ref.or(Some(artifact_ref)),
            },
            Ok(run) => {
                let error = if run.total == 0 {
                    "verifier reported no tests".to_string()
                } else {
                    format!("{} of {} tests passed", run.passed, run.total)
                };
                TrialOutcome::Failed {
                    error,
                    tests_passed: Some(run.passed),
                    tests_total: Some(run.total),
                    artifact_ref: run.artifact_ref.or(Some(artifact_ref)),
                }
            }
            Err(e) => match e.class() {
                FailureClass::Terminal => TrialOutcome::Failed {
                    error: e.to_string(),
                    tests_passed: None,
                    tests_total: None,
                    artifact_ref: Some(artifact_ref),
                },
                FailureClass::Retryable if attempt < self.config.max_attempts => {
                    warn!(
                        worker_id = %self.config.worker_id,
                        job_id = %trial_ref.job_id,
                        trial = trial_ref.trial_number,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "Trial attempt failed, leaving for redelivery"
                    );
                    return Ok(Disposition::Retry);
                }
                FailureClass::Retryable => TrialOutcome::Failed {
                    error: format!(
                        "{} (attempt {} of {})",
                        e, attempt, self.config.max_attempts
                    ),
                    tests_passed: None,
                    tests_total: None,
                    artifact_ref: Some(artifact_ref),
                },
                FailureClass::Unavailable => return Ok(Disposition::Unavailable(e.to_string())),
            },
        };

        self.finalize(trial_ref, Some((job.harness, elapsed)), &outcome)
            .await?;
        Ok(Disposition::Ack)
    }

    /// Persists a terminal outcome and refreshes the job aggregate.
    async fn finalize(
        &self,
        trial_ref: TrialRef,
        timing: Option<(Harness, Duration)>,
        outcome: &TrialOutcome,
    ) -> Result<(), PoolError> {
        if !self.store.finalize_trial(trial_ref, outcome).await? {
            debug!(trial = %trial_ref, "Trial finalized elsewhere");
            self.stats.duplicates.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let status = outcome.status();
        match outcome {
            TrialOutcome::Succeeded { .. } => {
                self.stats.trials_succeeded.fetch_add(1, Ordering::SeqCst);
                info!(
                    worker_id = %self.config.worker_id,
                    job_id = %trial_ref.job_id,
                    trial = trial_ref.trial_number,
                    "Trial succeeded"
                );
            }
            TrialOutcome::Failed { error, .. } => {
                self.stats.trials_failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    worker_id = %self.config.worker_id,
                    job_id = %trial_ref.job_id,
                    trial = trial_ref.trial_number,
                    error = %error,
                    "Trial failed"
                );
            }
        }
        if let Some((harness, elapsed)) = timing {
            self.metrics
                .record_trial(status.as_str(), harness.as_str(), elapsed.as_secs_f64());
        }

        if let Err(e) = self.observer.refresh(trial_ref.job_id).await {
            // The reconciler finalizes the job later.
            error!(job_id = %trial_ref.job_id, error = %e, "Failed to refresh job aggregate");
        }
        Ok(())
    }
}

#[async_trait]
impl DrainTarget for WorkerPool {
    fn in_flight(&self) -> usize {
        self.in_flight_count()
    }

    async fn wait_idle(&self) {
        // A delivery fetched just before the drain is only counted once the
        // loop spawns it, so wait for the loop to exit first.
        let mut fetching = self.fetching_tx.subscribe();
        let _ = fetching.wait_for(|running| !*running).await;

        let mut rx = self.in_flight_tx.subscribe();
        // The sender lives as long as the pool, which outlives this borrow.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Marks the fetch loop as running until dropped.
struct FetchLoopGuard<'a> {
    tx: &'a watch::Sender<bool>,
}

impl<'a> FetchLoopGuard<'a> {
    fn enter(tx: &'a watch::Sender<bool>) -> Self {
        tx.send_replace(true);
        Self { tx }
    }
}

impl Drop for FetchLoopGuard<'_> {
    fn drop(&mut self) {
        self.tx.send_replace(false);
    }
}

/// Tracks one running execution. Dropping it, panics included, releases the
/// slot and removes the trial from the in-flight set.
struct InFlightGuard {
    pool: Arc<WorkerPool>,
    trial_ref: TrialRef,
    _permit: OwnedSemaphorePermit,
}

impl InFlightGuard {
    fn enter(pool: Arc<WorkerPool>, trial_ref: TrialRef, permit: OwnedSemaphorePermit) -> Self {
        let total = {
            let mut in_flight = pool.lock_in_flight();
            *in_flight.trials.entry(trial_ref).or_insert(0) += 1;
            in_flight.total += 1;
            in_flight.total
        };
        pool.in_flight_tx.send_replace(total);
        pool.metrics.set_in_flight(total);

        Self {
            pool,
            trial_ref,
            _permit: permit,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let total = {
            let mut in_flight = self.pool.lock_in_flight();
            if let Some(count) = in_flight.trials.get_mut(&self.trial_ref) {
                *count -= 1;
                if *count == 0 {
                    in_flight.trials.remove(&self.trial_ref);
                }
            }
            in_flight.total = in_flight.total.saturating_sub(1);
            in_flight.total
        };
        self.pool.in_flight_tx.send_replace(total);
        self.pool.metrics.set_in_flight(total);
    }
}

/// Resolves once a drain has been requested. Never resolves if the drain
/// controller is gone.
async fn drain_requested(drain: &mut watch::Receiver<DrainState>) {
    if drain.wait_for(|state| !state.is_active()).await.is_err() {
        std::future::pending::<()>().await;
    }
}
