//! Job aggregate: deciding a job's final status from its trials.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::job::{JobId, JobStatus, TrialCounts};
use crate::storage::{StoreError, TrialStore};

/// Decides the final status of a job whose trials are all terminal.
pub trait JobFailurePolicy: Send + Sync {
    /// Returns `Completed` or `Failed`.
    fn final_status(&self, counts: &TrialCounts) -> JobStatus;
}

/// Fails a job when the share of failed trials exceeds a threshold.
///
/// With no threshold a job always completes, whatever its trials did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureThresholdPolicy {
    /// Fraction of failed trials, in `[0, 1]`, above which the job fails.
    pub max_failed_fraction: Option<f64>,
}

impl FailureThresholdPolicy {
    /// A policy that never fails a job.
    pub fn never_fail() -> Self {
        Self {
            max_failed_fraction: None,
        }
    }

    /// A policy that fails a job once more than `fraction` of its trials failed.
    pub fn with_max_failed_fraction(fraction: f64) -> Self {
        Self {
            max_failed_fraction: Some(fraction.clamp(0.0, 1.0)),
        }
    }
}

impl JobFailurePolicy for FailureThresholdPolicy {
    fn final_status(&self, counts: &TrialCounts) -> JobStatus {
        let Some(threshold) = self.max_failed_fraction else {
            return JobStatus::Completed;
        };
        let total = counts.total();
        if total == 0 {
            return JobStatus::Completed;
        }
        let failed_fraction = f64::from(counts.failed) / f64::from(total);
        if failed_fraction > threshold {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }
}

/// Recomputes a job's aggregate after one of its trials turns terminal.
#[derive(Clone)]
pub struct JobObserver {
    store: Arc<dyn TrialStore>,
    policy: Arc<dyn JobFailurePolicy>,
}

impl JobObserver {
    /// Creates an observer.
    pub fn new(store: Arc<dyn TrialStore>, policy: Arc<dyn JobFailurePolicy>) -> Self {
        Self { store, policy }
    }

    /// Finalizes the job if every trial is terminal and the job is Running.
    ///
    /// Returns the status written, or `None` if nothing changed. Safe to call
    /// any number of times: the Running → terminal write is conditional.
    pub async fn refresh(&self, job_id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let counts = self.store.trial_counts(job_id).await?;
        if counts.total() == 0 || counts.terminal() < counts.total() {
            return Ok(None);
        }

        let status = self.policy.final_status(&counts);
        if self
            .store
            .transition_job(job_id, JobStatus::Running, status)
            .await?
        {
            info!(
                job_id = %job_id,
                status = %status,
                succeeded = counts.succeeded,
                failed = counts.failed,
                "Job finished"
            );
            Ok(Some(status))
        } else {
            Ok(None)
        }
    }
}
