//! In-process implementation of [`TrialStore`].
//!
//! Holds everything behind a single lock, so every trait method is atomic in
//! the same way the PostgreSQL conditional updates are.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::scheduler::job::{
    Job, JobId, JobStatus, JobSummary, Trial, TrialCounts, TrialOutcome, TrialRef, TrialStatus,
};

use super::database::{StoreError, TrialStore};

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, Job>,
    trials: HashMap<JobId, BTreeMap<u32, Trial>>,
}

impl StoreState {
    fn trial_mut(&mut self, trial_ref: TrialRef) -> Option<&mut Trial> {
        self.trials
            .get_mut(&trial_ref.job_id)
            .and_then(|trials| trials.get_mut(&trial_ref.trial_number))
    }

    fn counts(&self, job_id: JobId) -> TrialCounts {
        let mut counts = TrialCounts::default();
        if let Some(trials) = self.trials.get(&job_id) {
            for trial in trials.values() {
                counts.add(trial.status);
            }
        }
        counts
    }
}

/// In-memory job and trial store.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs held.
    pub async fn job_count(&self) -> usize {
        self.state.read().await.jobs.len()
    }
}

#[async_trait]
impl TrialStore for MemoryStore {
    async fn create_job(&self, job: &Job, trials: &[Trial]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }

        let rows: BTreeMap<u32, Trial> = trials
            .iter()
            .map(|trial| (trial.trial_number, trial.clone()))
            .collect();
        state.jobs.insert(job.id, job.clone());
        state.trials.insert(job.id, rows);
        Ok(())
    }

    async fn mark_enqueued(&self, job_id: JobId, trial_numbers: &[u32]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        if let Some(trials) = state.trials.get_mut(&job_id) {
            for number in trial_numbers {
                if let Some(trial) = trials.get_mut(number) {
                    trial.enqueued_at.get_or_insert(now);
                }
            }
        }
        Ok(())
    }

    async fn transition_job(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == from => {
                job.status = to;
                if to.is_terminal() {
                    job.completed_at = Some(Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.state.read().await.jobs.get(&job_id).cloned())
    }

    async fn get_trials(&self, job_id: JobId) -> Result<Vec<Trial>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .trials
            .get(&job_id)
            .map(|trials| trials.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_trial(&self, trial_ref: TrialRef) -> Result<Option<Trial>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .trials
            .get(&trial_ref.job_id)
            .and_then(|trials| trials.get(&trial_ref.trial_number))
            .cloned())
    }

    async fn list_jobs(&self, limit: u32, offset: u32) -> Result<Vec<JobSummary>, StoreError> {
        let state = self.state.read().await;
        let mut jobs: Vec<&Job> = state.jobs.values().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        Ok(jobs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|job| JobSummary::new(job, state.counts(job.id)))
            .collect())
    }

    async fn trial_counts(&self, job_id: JobId) -> Result<TrialCounts, StoreError> {
        Ok(self.state.read().await.counts(job_id))
    }

    async fn begin_attempt(
        &self,
        trial_ref: TrialRef,
        expected_attempt: u32,
        worker_id: &str,
    ) -> Result<Option<Trial>, StoreError> {
        let mut state = self.state.write().await;
        let Some(trial) = state.trial_mut(trial_ref) else {
            return Ok(None);
        };
        if trial.is_terminal() || trial.attempt_count != expected_attempt {
            return Ok(None);
        }

        trial.attempt_count += 1;
        trial.status = TrialStatus::Running;
        trial.started_at = Some(Utc::now());
        trial.worker_id = Some(worker_id.to_string());
        Ok(Some(trial.clone()))
    }

    async fn finalize_trial(
        &self,
        trial_ref: TrialRef,
        outcome: &TrialOutcome,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.trial_mut(trial_ref) {
            Some(trial) if !trial.is_terminal() => {
                trial.apply_outcome(outcome);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unenqueued_trials(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<TrialRef>, StoreError> {
        let state = self.state.read().await;
        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.created_at < created_before)
            .collect();
        jobs.sort_by_key(|job| job.created_at);

        let mut refs = Vec::new();
        for job in jobs {
            if let Some(trials) = state.trials.get(&job.id) {
                refs.extend(
                    trials
                        .values()
                        .filter(|t| t.status == TrialStatus::Queued && t.enqueued_at.is_none())
                        .map(Trial::trial_ref),
                );
            }
        }
        Ok(refs)
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}
