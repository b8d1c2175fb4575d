//! Job and trial definitions for the scheduler.
//!
//! This module defines the records shared by the dispatcher, the worker pool
//! and the stores:
//!
//! - `Job`: one uploaded task definition that is run N times
//! - `Trial`: one of those N runs, with its attempt history and result
//! - `TrialRef`: the `(job_id, trial_number)` address carried by queue messages
//! - `TrialOutcome`: the terminal write applied when a trial finishes

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Identifier of a job.
pub type JobId = Uuid;

/// Minimum number of trials a job may request.
pub const MIN_TRIALS: u32 = 1;

/// Maximum number of trials a job may request.
pub const MAX_TRIALS: u32 = 100;

/// Default number of trials when the caller does not specify one.
pub const DEFAULT_TRIALS: u32 = 10;

/// Longest task name or model identifier the store accepts.
pub const MAX_NAME_LEN: usize = 255;

/// Longest staged task location the store accepts.
pub const MAX_REF_LEN: usize = 1024;

/// Execution harness a job is run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Harness {
    /// Harbor harness (Terminal-Bench 2 task layout).
    Harbor,
    /// Terminus harness.
    Terminus,
}

impl Harness {
    /// Returns the lowercase tag stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Harness::Harbor => "harbor",
            Harness::Terminus => "terminus",
        }
    }
}

impl fmt::Display for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Harness {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "harbor" => Ok(Harness::Harbor),
            "terminus" => Ok(Harness::Terminus),
            other => Err(ValidationError::UnknownHarness(other.to_string())),
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Rows written, trials not yet all enqueued.
    Pending,
    /// Every trial has been enqueued.
    Running,
    /// Every trial reached a terminal state.
    Completed,
    /// The failure policy rejected the job.
    Failed,
}

impl JobStatus {
    /// Returns the lowercase tag stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Returns whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// Status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    /// Waiting in the work queue.
    Queued,
    /// Leased by a worker and executing.
    Running,
    /// Verifier reported every test passing.
    Succeeded,
    /// Verification failed, or attempts were exhausted.
    Failed,
}

impl TrialStatus {
    /// Returns the lowercase tag stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Queued => "queued",
            TrialStatus::Running => "running",
            TrialStatus::Succeeded => "succeeded",
            TrialStatus::Failed => "failed",
        }
    }

    /// Returns whether the trial has been finalized.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrialStatus::Succeeded | TrialStatus::Failed)
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TrialStatus::Queued),
            "running" => Ok(TrialStatus::Running),
            "succeeded" => Ok(TrialStatus::Succeeded),
            "failed" => Ok(TrialStatus::Failed),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// Address of a single trial: the owning job plus its 1-based number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialRef {
    /// Owning job.
    pub job_id: JobId,
    /// 1-based trial number, unique within the job.
    pub trial_number: u32,
}

impl TrialRef {
    /// Creates a new trial reference.
    pub fn new(job_id: JobId, trial_number: u32) -> Self {
        Self {
            job_id,
            trial_number,
        }
    }
}

impl fmt::Display for TrialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job_id, self.trial_number)
    }
}

/// A validated request to run a staged task N times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable task name.
    pub task_name: String,
    /// Location of the staged task inputs, relative to the artifact root.
    pub task_ref: String,
    /// SHA-256 over the staged task files.
    pub task_digest: String,
    /// Harness to run under.
    pub harness: Harness,
    /// Model identifier passed through to the sandbox runner.
    pub model: String,
    /// Number of trials to run.
    pub requested_trials: u32,
}

impl JobSpec {
    /// Creates a spec with the default trial count.
    pub fn new(
        task_name: impl Into<String>,
        task_ref: impl Into<String>,
        harness: Harness,
        model: impl Into<String>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            task_ref: task_ref.into(),
            task_digest: String::new(),
            harness,
            model: model.into(),
            requested_trials: DEFAULT_TRIALS,
        }
    }

    /// Sets the number of trials.
    pub fn with_trials(mut self, trials: u32) -> Self {
        self.requested_trials = trials;
        self
    }

    /// Sets the task digest.
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.task_digest = digest.into();
        self
    }

    /// Checks the spec before anything is written.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(MIN_TRIALS..=MAX_TRIALS).contains(&self.requested_trials) {
            return Err(ValidationError::TrialCountOutOfRange {
                requested: self.requested_trials,
                min: MIN_TRIALS,
                max: MAX_TRIALS,
            });
        }
        if self.task_name.trim().is_empty() {
            return Err(ValidationError::MissingField("task_name"));
        }
        if self.task_ref.trim().is_empty() {
            return Err(ValidationError::MissingField("task_ref"));
        }
        if self.model.trim().is_empty() {
            return Err(ValidationError::MissingField("model"));
        }
        check_len("task_name", &self.task_name, MAX_NAME_LEN)?;
        check_len("model", &self.model, MAX_NAME_LEN)?;
        check_len("task_ref", &self.task_ref, MAX_REF_LEN)?;
        Ok(())
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len > max {
        return Err(ValidationError::FieldTooLong { field, len, max });
    }
    Ok(())
}

/// A job: one task definition run `requested_trials` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,
    /// Human-readable task name.
    pub task_name: String,
    /// Location of the staged task inputs, relative to the artifact root.
    pub task_ref: String,
    /// SHA-256 over the staged task files.
    pub task_digest: String,
    /// Harness to run under.
    pub harness: Harness,
    /// Model identifier passed through to the sandbox runner.
    pub model: String,
    /// Number of trials requested.
    pub requested_trials: u32,
    /// Current status.
    pub status: JobStatus,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending job from a spec.
    pub fn from_spec(id: JobId, spec: &JobSpec) -> Self {
        Self {
            id,
            task_name: spec.task_name.clone(),
            task_ref: spec.task_ref.clone(),
            task_digest: spec.task_digest.clone(),
            harness: spec.harness,
            model: spec.model.clone(),
            requested_trials: spec.requested_trials,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Returns the references of every trial of this job, in trial-number order.
    pub fn trial_refs(&self) -> Vec<TrialRef> {
        (1..=self.requested_trials)
            .map(|n| TrialRef::new(self.id, n))
            .collect()
    }
}

/// One trial of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    /// Owning job.
    pub job_id: JobId,
    /// 1-based number within the job.
    pub trial_number: u32,
    /// Current status.
    pub status: TrialStatus,
    /// Tests the verifier reported as passing.
    pub tests_passed: Option<u32>,
    /// Tests the verifier ran.
    pub tests_total: Option<u32>,
    /// Output location in the artifact store.
    pub artifact_ref: Option<String>,
    /// Error recorded on failure.
    pub error: Option<String>,
    /// When the latest attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the trial was finalized.
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of deliveries that began an attempt.
    pub attempt_count: u32,
    /// Worker that began the latest attempt.
    pub worker_id: Option<String>,
    /// Set once the trial's queue message has been published.
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl Trial {
    /// Creates a queued trial with no attempts.
    pub fn queued(job_id: JobId, trial_number: u32) -> Self {
        Self {
            job_id,
            trial_number,
            status: TrialStatus::Queued,
            tests_passed: None,
            tests_total: None,
            artifact_ref: None,
            error: None,
            started_at: None,
            completed_at: None,
            attempt_count: 0,
            worker_id: None,
            enqueued_at: None,
        }
    }

    /// Returns this trial's address.
    pub fn trial_ref(&self) -> TrialRef {
        TrialRef::new(self.job_id, self.trial_number)
    }

    /// Returns whether the trial has been finalized.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a terminal outcome. Callers check `is_terminal` first.
    pub(crate) fn apply_outcome(&mut self, outcome: &TrialOutcome) {
        self.status = outcome.status();
        self.completed_at = Some(Utc::now());
        match outcome {
            TrialOutcome::Succeeded {
                tests_passed,
                tests_total,
                artifact_ref,
            } => {
                self.tests_passed = Some(*tests_passed);
                self.tests_total = Some(*tests_total);
                self.artifact_ref = artifact_ref.clone();
                self.error = None;
            }
            TrialOutcome::Failed {
                error,
                tests_passed,
                tests_total,
                artifact_ref,
            } => {
                self.tests_passed = *tests_passed;
                self.tests_total = *tests_total;
                self.artifact_ref = artifact_ref.clone();
                self.error = Some(error.clone());
            }
        }
    }
}

/// Terminal write applied to a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TrialOutcome {
    /// Every test passed.
    Succeeded {
        tests_passed: u32,
        tests_total: u32,
        artifact_ref: Option<String>,
    },
    /// Verification failed or attempts were exhausted.
    Failed {
        error: String,
        tests_passed: Option<u32>,
        tests_total: Option<u32>,
        artifact_ref: Option<String>,
    },
}

impl TrialOutcome {
    /// Creates a failure with no verifier results.
    pub fn failed(error: impl Into<String>) -> Self {
        TrialOutcome::Failed {
            error: error.into(),
            tests_passed: None,
            tests_total: None,
            artifact_ref: None,
        }
    }

    /// Returns the status this outcome writes.
    pub fn status(&self) -> TrialStatus {
        match self {
            TrialOutcome::Succeeded { .. } => TrialStatus::Succeeded,
            TrialOutcome::Failed { .. } => TrialStatus::Failed,
        }
    }
}

/// Per-status trial counts for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialCounts {
    pub queued: u32,
    pub running: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl TrialCounts {
    /// Tallies a slice of trials.
    pub fn from_trials(trials: &[Trial]) -> Self {
        let mut counts = Self::default();
        for trial in trials {
            counts.add(trial.status);
        }
        counts
    }

    /// Adds one trial with the given status.
    pub fn add(&mut self, status: TrialStatus) {
        match status {
            TrialStatus::Queued => self.queued += 1,
            TrialStatus::Running => self.running += 1,
            TrialStatus::Succeeded => self.succeeded += 1,
            TrialStatus::Failed => self.failed += 1,
        }
    }

    /// Total number of trials counted.
    pub fn total(&self) -> u32 {
        self.queued + self.running + self.succeeded + self.failed
    }

    /// Number of finalized trials.
    pub fn terminal(&self) -> u32 {
        self.succeeded + self.failed
    }
}

/// A job header with trial counts, as returned by `list_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub task_name: String,
    pub harness: Harness,
    pub model: String,
    pub status: JobStatus,
    pub requested_trials: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: TrialCounts,
}

impl JobSummary {
    /// Builds a summary from a job and its trials.
    pub fn new(job: &Job, counts: TrialCounts) -> Self {
        Self {
            id: job.id,
            task_name: job.task_name.clone(),
            harness: job.harness,
            model: job.model.clone(),
            status: job.status,
            requested_trials: job.requested_trials,
            created_at: job.created_at,
            completed_at: job.completed_at,
            counts,
        }
    }
}

/// A job together with all of its trials, ordered by trial number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub job: Job,
    pub trials: Vec<Trial>,
}
