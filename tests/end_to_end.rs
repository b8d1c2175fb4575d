//! End-to-end runs through dispatcher, queue, worker pool and store.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use trialforge::runner::RunnerError;
use trialforge::scheduler::{JobStatus, PoolExit, TrialStatus, WorkQueue, WorkerHealth};
use trialforge::storage::TrialStore;
use trialforge::TrialRef;

use common::{
    pool_config, start, FailingRunner, HangingRunner, RecordingRunner, SucceedingRunner,
    TestFleet, UnreachableQueue,
};

#[tokio::test]
async fn test_ten_trials_all_succeed() {
    let fleet = TestFleet::new(Duration::from_secs(60));
    let runner = SucceedingRunner::new();
    let pool = fleet.pool(pool_config("w-1"), runner.clone());
    let (_drain, _handle) = start(&pool);

    let job_id = fleet.submit(10).await;
    let job = fleet.wait_for_job(job_id, JobStatus::Completed).await;
    assert!(job.completed_at.is_some());

    let trials = fleet.store.get_trials(job_id).await.unwrap();
    let numbers: Vec<u32> = trials.iter().map(|t| t.trial_number).collect();
    assert_eq!(numbers, (1..=10).collect::<Vec<_>>());
    for trial in &trials {
        assert_eq!(trial.status, TrialStatus::Succeeded);
        assert_eq!(trial.attempt_count, 1);
        assert_eq!(trial.tests_passed, Some(3));
        assert_eq!(trial.tests_total, Some(3));
        assert_eq!(trial.worker_id.as_deref(), Some("w-1"));
        assert!(trial.artifact_ref.as_deref().unwrap().ends_with("attempt_1"));
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        while pool.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.trials_succeeded, 10);
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 10);

    let queue_stats = fleet.queue.stats().await.unwrap();
    assert_eq!(queue_stats.total(), 0);
}

#[tokio::test]
async fn test_timeouts_redeliver_until_success() {
    let fleet = TestFleet::new(Duration::from_millis(150));
    let runner = HangingRunner::new(2);
    let config = pool_config("w-1")
        .with_max_attempts(3)
        .with_trial_timeout(Duration::from_millis(50));
    let pool = fleet.pool(config, runner.clone());
    let (_drain, _handle) = start(&pool);

    let job_id = fleet.submit(1).await;
    fleet.wait_for_job(job_id, JobStatus::Completed).await;

    let trial = fleet
        .store
        .get_trial(TrialRef::new(job_id, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trial.status, TrialStatus::Succeeded);
    assert_eq!(trial.attempt_count, 3);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    assert_eq!(pool.stats().retried, 2);
}

#[tokio::test]
async fn test_retryable_failures_fail_once_after_max_attempts() {
    let fleet = TestFleet::new(Duration::from_millis(100));
    let runner = FailingRunner::new(|| RunnerError::Infrastructure("docker daemon gone".into()));
    let pool = fleet.pool(pool_config("w-1").with_max_attempts(2), runner.clone());
    let (_drain, _handle) = start(&pool);

    let job_id = fleet.submit(1).await;
    fleet.wait_for_job(job_id, JobStatus::Completed).await;

    let trial = fleet
        .store
        .get_trial(TrialRef::new(job_id, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trial.status, TrialStatus::Failed);
    assert_eq!(trial.attempt_count, 2);
    let error = trial.error.unwrap();
    assert!(error.contains("docker daemon gone"));
    assert!(error.contains("attempt 2 of 2"));

    // Nothing left to redeliver, and the trial was finalized exactly once.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().trials_failed, 1);
    assert_eq!(fleet.queue.stats().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_verification_failure_is_terminal() {
    let fleet = TestFleet::new(Duration::from_secs(60));
    let runner = FailingRunner::new(|| RunnerError::Verification("tests/test.sh exited 1".into()));
    let pool = fleet.pool(pool_config("w-1"), runner.clone());
    let (_drain, _handle) = start(&pool);

    let job_id = fleet.submit(2).await;
    fleet.wait_for_job(job_id, JobStatus::Completed).await;

    let trials = fleet.store.get_trials(job_id).await.unwrap();
    for trial in &trials {
        assert_eq!(trial.status, TrialStatus::Failed);
        assert_eq!(trial.attempt_count, 1);
        assert!(trial.error.as_deref().unwrap().contains("exited 1"));
    }
    assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_two_workers_never_run_the_same_attempt() {
    let fleet = TestFleet::new(Duration::from_secs(60));
    let runner = RecordingRunner::new();
    let pool_a = fleet.pool(pool_config("w-a"), runner.clone());
    let pool_b = fleet.pool(pool_config("w-b"), runner.clone());
    let (_drain_a, _handle_a) = start(&pool_a);
    let (_drain_b, _handle_b) = start(&pool_b);

    let job_id = fleet.submit(20).await;
    fleet.wait_for_job(job_id, JobStatus::Completed).await;

    let trials = fleet.store.get_trials(job_id).await.unwrap();
    assert_eq!(trials.len(), 20);
    assert!(trials.iter().all(|t| t.status == TrialStatus::Succeeded));
    assert!(trials.iter().all(|t| t.attempt_count == 1));
    assert_eq!(runner.seen.lock().unwrap().len(), 20);
    assert_eq!(
        pool_a.stats().trials_succeeded + pool_b.stats().trials_succeeded,
        20
    );
}

#[tokio::test]
async fn test_unavailable_runner_marks_worker_unhealthy() {
    let fleet = TestFleet::new(Duration::from_secs(60));
    let runner = FailingRunner::new(|| RunnerError::Unavailable("harbor: not found".into()));
    let pool = fleet.pool(pool_config("w-1").with_capacity(1), runner.clone());
    let mut health = pool.subscribe_health();
    let (_drain, handle) = start(&pool);

    let job_id = fleet.submit(3).await;
    tokio::time::timeout(
        Duration::from_secs(2),
        health.wait_for(|h| matches!(h, WorkerHealth::Unhealthy(_))),
    )
    .await
    .expect("worker should report unhealthy")
    .unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("fetch loop should stop")
        .unwrap();

    assert!(matches!(exit, PoolExit::Unhealthy(ref r) if r.contains("not found")));
    assert!(matches!(pool.health(), WorkerHealth::Unhealthy(_)));

    // The trial is left for another worker; nothing was finalized.
    let counts = fleet.store.trial_counts(job_id).await.unwrap();
    assert_eq!(counts.succeeded + counts.failed, 0);
    let stats = fleet.queue.stats().await.unwrap();
    assert_eq!(stats.total(), 3);
}

#[tokio::test]
async fn test_redelivery_after_terminal_write_is_dropped() {
    let fleet = TestFleet::new(Duration::from_secs(60));
    let job_id = fleet.submit(1).await;
    let trial_ref = TrialRef::new(job_id, 1);

    // Another holder already finished the trial; its ack was lost.
    fleet
        .store
        .begin_attempt(trial_ref, 0, "w-old")
        .await
        .unwrap()
        .unwrap();
    fleet
        .store
        .finalize_trial(
            trial_ref,
            &trialforge::scheduler::TrialOutcome::Succeeded {
                tests_passed: 1,
                tests_total: 1,
                artifact_ref: None,
            },
        )
        .await
        .unwrap();

    let runner = SucceedingRunner::new();
    let pool = fleet.pool(pool_config("w-new"), runner.clone());
    let (_drain, _handle) = start(&pool);

    tokio::time::timeout(Duration::from_secs(2), async {
        while pool.stats().duplicates == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    let trial = fleet.store.get_trial(trial_ref).await.unwrap().unwrap();
    assert_eq!(trial.worker_id.as_deref(), Some("w-old"));
    assert_eq!(trial.attempt_count, 1);
}

#[tokio::test]
async fn test_delivery_with_exhausted_attempts_fails_without_running() {
    let fleet = TestFleet::new(Duration::from_secs(60));
    let job_id = fleet.submit(1).await;
    let trial_ref = TrialRef::new(job_id, 1);

    // Earlier holders crashed mid-trial and used up every attempt.
    for attempt in 0..3 {
        fleet
            .store
            .begin_attempt(trial_ref, attempt, "w-crashed")
            .await
            .unwrap()
            .unwrap();
    }

    let runner = SucceedingRunner::new();
    let pool = fleet.pool(pool_config("w-1").with_max_attempts(3), runner.clone());
    let (_drain, _handle) = start(&pool);
    fleet.wait_for_job(job_id, JobStatus::Completed).await;

    let trial = fleet.store.get_trial(trial_ref).await.unwrap().unwrap();
    assert_eq!(trial.status, TrialStatus::Failed);
    assert_eq!(trial.attempt_count, 3);
    assert!(trial
        .error
        .as_deref()
        .unwrap()
        .contains("attempts exhausted (3 of 3)"));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

    tokio::time::timeout(Duration::from_secs(2), async {
        while fleet.queue.stats().await.unwrap().total() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("exhausted delivery should be acknowledged");
    assert_eq!(pool.stats().trials_failed, 1);
}

#[tokio::test]
async fn test_consecutive_queue_errors_mark_worker_unhealthy() {
    let fleet = TestFleet::new(Duration::from_secs(60));
    let queue = UnreachableQueue::new();
    let runner = SucceedingRunner::new();
    let pool = fleet.pool_with_queue(pool_config("w-1"), queue.clone(), runner.clone());
    let (_drain, handle) = start(&pool);

    let exit = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("fetch loop should stop")
        .unwrap();

    assert!(
        matches!(exit, PoolExit::Unhealthy(ref r) if r.contains("3 consecutive queue errors")),
        "unexpected exit: {:?}",
        exit
    );
    assert_eq!(queue.fetches.load(Ordering::SeqCst), 3);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    assert!(matches!(pool.health(), WorkerHealth::Unhealthy(_)));
}
