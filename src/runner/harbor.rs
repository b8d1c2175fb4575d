//! Process-based sandbox runner.
//!
//! Runs an external harness command once per attempt. The command line is a
//! template; these placeholders are substituted per attempt:
//!
//! | placeholder            | value                                  |
//! |------------------------|----------------------------------------|
//! | `{task_dir}`           | staged task inputs                     |
//! | `{output_dir}`         | attempt output directory               |
//! | `{harness}`            | `harbor` or `terminus`                 |
//! | `{model}`              | model identifier                       |
//! | `{trial}`              | trial number                           |
//! | `{attempt}`            | attempt number                         |
//! | `{timeout_secs}`       | hard limit in whole seconds            |
//! | `{timeout_multiplier}` | harness timeout multiplier             |
//!
//! The child is spawned with `kill_on_drop`, so dropping the run future on
//! timeout kills it.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::results::read_test_summary;
use super::sandbox::{RunRequest, RunResult, RunnerError, SandboxRunner};
use crate::storage::artifacts::locate_result_dir;

/// File the runner writes the child's stdout and stderr to.
pub const RUNNER_LOG: &str = "runner.log";

/// Command template for the harness process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessCommand {
    /// Program to execute.
    pub program: String,
    /// Argument templates.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env_vars: Vec<(String, String)>,
    /// Multiplier handed to the harness for its internal timeouts.
    pub timeout_multiplier: f64,
}

impl HarnessCommand {
    /// Creates a command with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            timeout_multiplier: 1.0,
        }
    }

    /// Appends an argument template.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Sets the harness timeout multiplier.
    pub fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    /// Expands the argument templates for one attempt.
    pub fn render_args(&self, request: &RunRequest) -> Vec<String> {
        let task_dir = request.task_dir.display().to_string();
        let output_dir = request.output_dir.display().to_string();
        let trial = request.trial_ref.trial_number.to_string();
        let attempt = request.attempt.to_string();
        let timeout_secs = request.timeout.as_secs().to_string();
        let multiplier = self.timeout_multiplier.to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{task_dir}", &task_dir)
                    .replace("{output_dir}", &output_dir)
                    .replace("{harness}", request.harness.as_str())
                    .replace("{model}", &request.model)
                    .replace("{trial}", &trial)
                    .replace("{attempt}", &attempt)
                    .replace("{timeout_secs}", &timeout_secs)
                    .replace("{timeout_multiplier}", &multiplier)
            })
            .collect()
    }
}

impl Default for HarnessCommand {
    fn default() -> Self {
        Self::new("harbor")
            .with_arg("run")
            .with_arg("--path")
            .with_arg("{task_dir}")
            .with_arg("--agent")
            .with_arg("{harness}")
            .with_arg("--model")
            .with_arg("{model}")
            .with_arg("--jobs-dir")
            .with_arg("{output_dir}")
            .with_arg("--n-attempts")
            .with_arg("1")
            .with_arg("--timeout-multiplier")
            .with_arg("{timeout_multiplier}")
    }
}

/// Runs each attempt as a child process.
pub struct ProcessRunner {
    command: HarnessCommand,
}

impl ProcessRunner {
    /// Creates a runner for the given command template.
    pub fn new(command: HarnessCommand) -> Self {
        Self { command }
    }

    /// Returns the command template.
    pub fn command(&self) -> &HarnessCommand {
        &self.command
    }
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    fn name(&self) -> &str {
        &self.command.program
    }

    async fn run(&self, request: &RunRequest) -> Result<RunResult, RunnerError> {
        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| RunnerError::Infrastructure(format!("output dir: {}", e)))?;

        let args = self.command.render_args(request);
        debug!(
            trial = %request.trial_ref,
            attempt = request.attempt,
            program = %self.command.program,
            ?args,
            "Spawning harness"
        );

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&args)
            .current_dir(&request.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.command.env_vars {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => RunnerError::Unavailable(format!(
                "cannot start {}: {}",
                self.command.program, e
            )),
            _ => RunnerError::Infrastructure(format!("spawn failed: {}", e)),
        })?;

        let output = child.wait_with_output().await?;
        write_runner_log(&request.output_dir, &output.stdout, &output.stderr).await;

        let result_dir = locate_result_dir(&request.output_dir);
        let summary = result_dir.as_deref().and_then(read_test_summary);

        match summary {
            Some(summary) => {
                info!(
                    trial = %request.trial_ref,
                    attempt = request.attempt,
                    passed = summary.passed,
                    total = summary.total,
                    "Harness finished"
                );
                Ok(RunResult::new(summary.passed, summary.total)
                    .with_artifact_ref(request.artifact_ref.clone()))
            }
            None if output.status.success() => {
                Ok(RunResult::new(0, 0).with_artifact_ref(request.artifact_ref.clone()))
            }
            None => {
                let code = output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                Err(RunnerError::Infrastructure(format!(
                    "harness exited with {} and produced no verifier output",
                    code
                )))
            }
        }
    }
}

async fn write_runner_log(output_dir: &Path, stdout: &[u8], stderr: &[u8]) {
    let mut log = Vec::with_capacity(stdout.len() + stderr.len() + 32);
    log.extend_from_slice(b"=== stdout ===\n");
    log.extend_from_slice(stdout);
    log.extend_from_slice(b"\n=== stderr ===\n");
    log.extend_from_slice(stderr);

    if let Err(e) = tokio::fs::write(output_dir.join(RUNNER_LOG), log).await {
        warn!(dir = %output_dir.display(), error = %e, "Failed to write runner log");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::scheduler::job::{Harness, TrialRef};

    fn request(output_dir: PathBuf) -> RunRequest {
        RunRequest {
            trial_ref: TrialRef::new(Uuid::nil(), 2),
            attempt: 1,
            task_dir: PathBuf::from("/data/job/task"),
            output_dir,
            artifact_ref: "job/trial_2/attempt_1".to_string(),
            harness: Harness::Terminus,
            model: "openai/gpt-4o".to_string(),
            timeout: Duration::from_secs(90),
        }
    }

    #[test]
    fn test_render_args() {
        let command = HarnessCommand::default().with_timeout_multiplier(2.5);
        let args = command.render_args(&request(PathBuf::from("/out")));

        assert!(args.contains(&"/data/job/task".to_string()));
        assert!(args.contains(&"/out".to_string()));
        assert!(args.contains(&"terminus".to_string()));
        assert!(args.contains(&"openai/gpt-4o".to_string()));
        assert!(args.contains(&"2.5".to_string()));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(HarnessCommand::new("trialforge-no-such-harness"));

        let err = runner.run(&request(dir.path().join("out"))).await.unwrap_err();
        assert!(matches!(err, RunnerError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reads_verifier_output() {
        let dir = tempfile::tempdir().unwrap();
        let command = HarnessCommand::new("sh")
            .with_arg("-c")
            .with_arg(
                "mkdir -p {output_dir}/verifier && echo 1 > {output_dir}/verifier/reward.txt && echo $TRIAL_MARKER > {output_dir}/trial.log",
            )
            .with_env("TRIAL_MARKER", "done");
        let runner = ProcessRunner::new(command);

        let result = runner.run(&request(dir.path().join("out"))).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.artifact_ref.as_deref(), Some("job/trial_2/attempt_1"));
        assert!(dir.path().join("out").join(RUNNER_LOG).exists());
        let log = std::fs::read_to_string(dir.path().join("out/trial.log")).unwrap();
        assert_eq!(log.trim(), "done");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_exit_without_results_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let command = HarnessCommand::new("sh").with_arg("-c").with_arg("exit 3");
        let runner = ProcessRunner::new(command);

        let err = runner.run(&request(dir.path().join("out"))).await.unwrap_err();
        assert!(matches!(err, RunnerError::Infrastructure(ref m) if m.contains("3")));
    }
}
