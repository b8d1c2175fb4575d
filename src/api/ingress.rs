//! Ingress API: submit tasks and read results.
//!
//! Submission validates the task directory and the job parameters, stages the
//! task into the artifact store under a fresh job id, and hands the job to the
//! dispatcher under that same id.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::task::{load_task, TaskValidationError};
use crate::error::ValidationError;
use crate::scheduler::dispatcher::{DispatchError, Dispatcher};
use crate::scheduler::job::{Harness, JobDetail, JobId, JobSpec, JobSummary, TrialRef};
use crate::storage::{ArtifactError, ArtifactStore, StoreError, TrialStore};

/// Errors returned by the ingress API.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Invalid task: {0}")]
    Task(#[from] TaskValidationError),

    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Front door for clients.
pub struct IngressApi {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn TrialStore>,
    artifacts: ArtifactStore,
}

impl IngressApi {
    pub fn new(dispatcher: Arc<Dispatcher>, store: Arc<dyn TrialStore>, artifacts: ArtifactStore) -> Self {
        Self {
            dispatcher,
            store,
            artifacts,
        }
    }

    /// Validates, stages and dispatches a task directory.
    ///
    /// Invalid input is rejected before anything is staged or written.
    pub async fn submit(
        &self,
        task_dir: &Path,
        harness: Harness,
        model: &str,
        trials: u32,
    ) -> Result<JobId, IngressError> {
        let task = load_task(task_dir, harness)?;
        let job_id = Uuid::new_v4();

        let spec = JobSpec::new(&task.name, ArtifactStore::task_ref(job_id), harness, model)
            .with_trials(trials);
        spec.validate()?;

        let staged = self.artifacts.stage_task(job_id, &task.root).await?;
        info!(
            job_id = %job_id,
            task = %task.name,
            files = staged.file_count,
            digest = %staged.digest,
            "Task staged"
        );

        let spec = spec.with_digest(staged.digest);
        match self.dispatcher.submit_with_id(job_id, &spec).await {
            Ok(job_id) => Ok(job_id),
            Err(e) => {
                self.discard_staged(job_id).await;
                Err(e.into())
            }
        }
    }

    /// Removes the staged inputs of a submission that never produced a job.
    ///
    /// A job row that did get written keeps its inputs, since reconciliation
    /// may still publish its trials.
    async fn discard_staged(&self, job_id: JobId) {
        match self.store.get_job(job_id).await {
            Ok(None) => {
                if let Err(e) = self.artifacts.remove_job(job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to remove staged task");
                }
            }
            Ok(Some(_)) => {}
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Keeping staged task, job state unknown");
            }
        }
    }

    /// Returns a job and all of its trials.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobDetail>, IngressError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(None);
        };
        let trials = self.store.get_trials(job_id).await?;
        Ok(Some(JobDetail { job, trials }))
    }

    /// Lists jobs, newest first, with per-status trial counts.
    pub async fn list_jobs(&self, limit: u32, offset: u32) -> Result<Vec<JobSummary>, IngressError> {
        Ok(self.store.list_jobs(limit, offset).await?)
    }

    /// Reads the log of a trial's latest attempt.
    pub async fn trial_log(
        &self,
        job_id: JobId,
        trial_number: u32,
    ) -> Result<Option<String>, IngressError> {
        let trial_ref = TrialRef::new(job_id, trial_number);
        if self.store.get_trial(trial_ref).await?.is_none() {
            return Err(IngressError::NotFound(format!("trial {}", trial_ref)));
        }
        Ok(self.artifacts.read_trial_log(trial_ref).await?)
    }
}
