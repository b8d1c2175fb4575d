//! Shared fixtures for the integration tests: an in-process fleet and stub
//! sandbox runners.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use trialforge::lifecycle::DrainState;
use trialforge::runner::{RunRequest, RunResult, RunnerError, SandboxRunner};
use trialforge::scheduler::{
    Delivery, Dispatcher, FailureThresholdPolicy, Harness, Job, JobId, JobObserver, JobSpec,
    JobStatus, Lease, MemoryWorkQueue, PoolExit, QueueError, QueueMessage, QueueStats,
    WorkQueue, WorkerPool, WorkerPoolConfig,
};
use trialforge::storage::{ArtifactStore, MemoryStore, TrialStore};
use trialforge::TrialRef;

/// Store, queue and dispatcher shared by every worker in a test.
pub struct TestFleet {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryWorkQueue>,
    pub dispatcher: Dispatcher,
    pub observer: JobObserver,
    pub artifacts: ArtifactStore,
    _root: TempDir,
}

impl TestFleet {
    pub fn new(visibility_timeout: Duration) -> Self {
        let root = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryWorkQueue::new("trials", visibility_timeout));
        let observer = JobObserver::new(store.clone(), Arc::new(FailureThresholdPolicy::default()));
        let dispatcher = Dispatcher::new(store.clone(), queue.clone(), observer.clone());

        Self {
            store,
            queue,
            dispatcher,
            observer,
            artifacts: ArtifactStore::new(root.path()),
            _root: root,
        }
    }

    pub fn pool(&self, config: WorkerPoolConfig, runner: Arc<dyn SandboxRunner>) -> Arc<WorkerPool> {
        self.pool_with_queue(config, self.queue.clone(), runner)
    }

    /// Builds a pool that fetches from `queue` instead of the shared queue.
    pub fn pool_with_queue(
        &self,
        config: WorkerPoolConfig,
        queue: Arc<dyn WorkQueue>,
        runner: Arc<dyn SandboxRunner>,
    ) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            config,
            queue,
            self.store.clone(),
            runner,
            self.artifacts.clone(),
            self.observer.clone(),
        ))
    }

    pub async fn submit(&self, trials: u32) -> JobId {
        let spec = JobSpec::new("hello-world", "staged/task", Harness::Harbor, "stub-model")
            .with_trials(trials);
        self.dispatcher.submit(&spec).await.unwrap()
    }

    /// Polls until the job reaches `status`.
    pub async fn wait_for_job(&self, job_id: JobId, status: JobStatus) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.store.get_job(job_id).await.unwrap().unwrap();
            if job.status == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} stuck in {:?}",
                job_id,
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn pool_config(worker_id: &str) -> WorkerPoolConfig {
    WorkerPoolConfig::new(worker_id)
        .with_capacity(4)
        .with_fetch_wait(Duration::from_millis(20))
        .with_trial_timeout(Duration::from_secs(5))
        .with_queue_error_budget(3, Duration::from_millis(10))
}

/// Starts the fetch loop. Dropping or flipping the sender drains it.
pub fn start(pool: &Arc<WorkerPool>) -> (watch::Sender<DrainState>, JoinHandle<PoolExit>) {
    let (tx, rx) = watch::channel(DrainState::Active);
    let handle = tokio::spawn(pool.clone().run(rx));
    (tx, handle)
}

/// Passes every test.
pub struct SucceedingRunner {
    pub calls: AtomicU32,
}

impl SucceedingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl SandboxRunner for SucceedingRunner {
    fn name(&self) -> &str {
        "succeeding"
    }

    async fn run(&self, request: &RunRequest) -> Result<RunResult, RunnerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RunResult::new(3, 3).with_artifact_ref(request.artifact_ref.clone()))
    }
}

/// Hangs for the first `hangs` calls, then passes.
pub struct HangingRunner {
    pub hangs: u32,
    pub calls: AtomicU32,
}

impl HangingRunner {
    pub fn new(hangs: u32) -> Arc<Self> {
        Arc::new(Self {
            hangs,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl SandboxRunner for HangingRunner {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn run(&self, _request: &RunRequest) -> Result<RunResult, RunnerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.hangs {
            std::future::pending::<()>().await;
        }
        Ok(RunResult::new(1, 1))
    }
}

/// Returns the same error on every call.
pub struct FailingRunner {
    pub make_error: fn() -> RunnerError,
    pub calls: AtomicU32,
}

impl FailingRunner {
    pub fn new(make_error: fn() -> RunnerError) -> Arc<Self> {
        Arc::new(Self {
            make_error,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl SandboxRunner for FailingRunner {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, _request: &RunRequest) -> Result<RunResult, RunnerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.make_error)())
    }
}

/// Blocks every run until the gate is opened.
pub struct GatedRunner {
    gate: Semaphore,
}

impl GatedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
        })
    }

    pub fn open(&self) {
        self.gate.add_permits(1_000);
    }
}

#[async_trait]
impl SandboxRunner for GatedRunner {
    fn name(&self) -> &str {
        "gated"
    }

    async fn run(&self, _request: &RunRequest) -> Result<RunResult, RunnerError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| RunnerError::Infrastructure(e.to_string()))?;
        Ok(RunResult::new(2, 2))
    }
}

/// Records every (trial, attempt) it starts and fails the test on a repeat.
pub struct RecordingRunner {
    pub seen: Mutex<HashSet<(TrialRef, u32)>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl SandboxRunner for RecordingRunner {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(&self, request: &RunRequest) -> Result<RunResult, RunnerError> {
        let fresh = self
            .seen
            .lock()
            .unwrap()
            .insert((request.trial_ref, request.attempt));
        assert!(fresh, "{} attempt {} ran twice", request.trial_ref, request.attempt);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(RunResult::new(1, 1))
    }
}

/// Queue whose broker is unreachable: every call fails.
pub struct UnreachableQueue {
    pub fetches: AtomicU32,
}

impl UnreachableQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicU32::new(0),
        })
    }

    fn down() -> QueueError {
        QueueError::ConnectionFailed("connection refused".to_string())
    }
}

#[async_trait]
impl WorkQueue for UnreachableQueue {
    async fn enqueue(&self, _trial_ref: TrialRef) -> Result<QueueMessage, QueueError> {
        Err(Self::down())
    }

    async fn fetch(&self, _max_wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Err(Self::down())
    }

    async fn ack(&self, _lease: &Lease) -> Result<bool, QueueError> {
        Err(Self::down())
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Err(Self::down())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Err(Self::down())
    }

    fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}
