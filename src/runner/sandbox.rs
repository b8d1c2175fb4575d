//! Sandbox runner contract.
//!
//! A sandbox runner executes one attempt of one trial and reports what the
//! verifier found. The worker pool owns timeouts and retries; a runner only
//! has to say what happened and how bad it was.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scheduler::job::{Harness, TrialRef};

/// Everything a runner needs to execute one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Trial being executed.
    pub trial_ref: TrialRef,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Staged task inputs (read-only for the runner).
    pub task_dir: PathBuf,
    /// Directory this attempt may write to.
    pub output_dir: PathBuf,
    /// Artifact store reference of `output_dir`.
    pub artifact_ref: String,
    /// Harness to run under.
    pub harness: Harness,
    /// Model identifier, passed through opaquely.
    pub model: String,
    /// Hard execution limit enforced by the caller.
    pub timeout: Duration,
}

/// Verifier verdict for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Tests that passed.
    pub passed: u32,
    /// Tests that ran.
    pub total: u32,
    /// Where the attempt's outputs live in the artifact store.
    pub artifact_ref: Option<String>,
}

impl RunResult {
    /// Creates a result.
    pub fn new(passed: u32, total: u32) -> Self {
        Self {
            passed,
            total,
            artifact_ref: None,
        }
    }

    /// Sets the artifact reference.
    pub fn with_artifact_ref(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }

    /// A trial succeeds only if tests ran and every one passed.
    pub fn is_success(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }
}

/// How the worker pool treats a runner error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Leave the message unacknowledged; it is redelivered after the
    /// visibility timeout.
    Retryable,
    /// Finalize the trial as Failed and acknowledge.
    Terminal,
    /// The runner cannot execute anything on this worker.
    Unavailable,
}

/// Errors raised by a sandbox runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Runner unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Classifies the error for retry handling.
    pub fn class(&self) -> FailureClass {
        match self {
            RunnerError::Timeout(_) | RunnerError::Infrastructure(_) | RunnerError::Io(_) => {
                FailureClass::Retryable
            }
            RunnerError::Verification(_) => FailureClass::Terminal,
            RunnerError::Unavailable(_) => FailureClass::Unavailable,
        }
    }
}

/// Executes trial attempts.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Runs one attempt. Dropping the returned future must stop the work.
    async fn run(&self, request: &RunRequest) -> Result<RunResult, RunnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_result_success_rules() {
        assert!(RunResult::new(3, 3).is_success());
        assert!(!RunResult::new(2, 3).is_success());
        assert!(!RunResult::new(0, 0).is_success());
    }

    #[test]
    fn test_runner_error_classes() {
        assert_eq!(
            RunnerError::Timeout(Duration::from_secs(1)).class(),
            FailureClass::Retryable
        );
        assert_eq!(
            RunnerError::Infrastructure("disk full".into()).class(),
            FailureClass::Retryable
        );
        assert_eq!(
            RunnerError::Verification("bad task".into()).class(),
            FailureClass::Terminal
        );
        assert_eq!(
            RunnerError::Unavailable("harbor not installed".into()).class(),
            FailureClass::Unavailable
        );
    }

    #[test]
    fn test_runner_error_display() {
        let err = RunnerError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"));
    }
}
