//! Shared artifact store for task inputs and trial outputs.
//!
//! The store is a directory tree on a filesystem every worker can reach:
//!
//! ```text
//! {root}/{job_id}/task/                          staged task inputs
//! {root}/{job_id}/trial_{n}/attempt_{k}/         outputs of one attempt
//! ```
//!
//! Output directories are keyed by attempt, so a redelivered trial never
//! writes over the files of an abandoned attempt.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use walkdir::WalkDir;

use crate::scheduler::job::{JobId, TrialRef};

/// Log files read for a trial, in preference order.
pub const LOG_CANDIDATES: &[&str] = &[
    "trial.log",
    "agent/oracle.txt",
    "exception.txt",
    "runner.log",
];

/// Errors that can occur during artifact store operations.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Walking a directory tree failed.
    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    /// The referenced location does not exist.
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// A reference escaped the store root.
    #[error("Invalid artifact reference: {0}")]
    InvalidRef(String),

    /// A blocking copy task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Result of staging a task directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTask {
    /// Location relative to the store root.
    pub task_ref: String,
    /// SHA-256 over relative paths and contents, in path order.
    pub digest: String,
    /// Number of files copied.
    pub file_count: usize,
}

/// Filesystem-backed artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative location of a job's staged task inputs.
    pub fn task_ref(job_id: JobId) -> String {
        format!("{}/task", job_id)
    }

    /// Relative location of one attempt's outputs.
    pub fn attempt_ref(trial_ref: TrialRef, attempt: u32) -> String {
        format!(
            "{}/trial_{}/attempt_{}",
            trial_ref.job_id, trial_ref.trial_number, attempt
        )
    }

    /// Resolves a relative reference to an absolute path under the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ArtifactError> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.is_empty() {
            return Err(ArtifactError::InvalidRef(relative.to_string()));
        }
        Ok(self.root.join(path))
    }

    /// Copies a task directory into the store and digests it.
    pub async fn stage_task(
        &self,
        job_id: JobId,
        source: &Path,
    ) -> Result<StagedTask, ArtifactError> {
        let task_ref = Self::task_ref(job_id);
        let dest = self.resolve(&task_ref)?;
        let source = source.to_path_buf();

        let (digest, file_count) = tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;

        Ok(StagedTask {
            task_ref,
            digest,
            file_count,
        })
    }

    /// Deletes everything stored for a job. Missing directories are ignored.
    pub async fn remove_job(&self, job_id: JobId) -> Result<(), ArtifactError> {
        let dir = self.resolve(&job_id.to_string())?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates and returns the output directory for an attempt.
    pub async fn prepare_attempt_dir(
        &self,
        trial_ref: TrialRef,
        attempt: u32,
    ) -> Result<PathBuf, ArtifactError> {
        let dir = self.resolve(&Self::attempt_ref(trial_ref, attempt))?;
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Highest attempt number with an output directory, if any.
    pub async fn latest_attempt(&self, trial_ref: TrialRef) -> Result<Option<u32>, ArtifactError> {
        let trial_dir = self.root.join(format!(
            "{}/trial_{}",
            trial_ref.job_id, trial_ref.trial_number
        ));
        if !fs::try_exists(&trial_dir).await? {
            return Ok(None);
        }

        let mut latest = None;
        let mut entries = fs::read_dir(&trial_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let attempt = name
                .to_str()
                .and_then(|n| n.strip_prefix("attempt_"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(attempt) = attempt {
                latest = latest.max(Some(attempt));
            }
        }
        Ok(latest)
    }

    /// Reads the log of a trial's latest attempt.
    pub async fn read_trial_log(&self, trial_ref: TrialRef) -> Result<Option<String>, ArtifactError> {
        let Some(attempt) = self.latest_attempt(trial_ref).await? else {
            return Ok(None);
        };
        let dir = self.resolve(&Self::attempt_ref(trial_ref, attempt))?;
        if let Some(result_dir) = locate_result_dir(&dir) {
            if let Some(log) = read_log(&result_dir).await? {
                return Ok(Some(log));
            }
        }
        read_log(&dir).await
    }
}

/// Reads the first log file present under `dir`.
pub async fn read_log(dir: &Path) -> Result<Option<String>, ArtifactError> {
    for candidate in LOG_CANDIDATES {
        let path = dir.join(candidate);
        if fs::try_exists(&path).await? {
            let bytes = fs::read(&path).await?;
            return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
        }
    }
    Ok(None)
}

/// Finds the directory a harness wrote its trial results into.
///
/// Harnesses either write straight into the output directory or create one
/// nested directory per trial; the newest directory holding `trial.log` or
/// `verifier/` wins.
pub fn locate_result_dir(output_dir: &Path) -> Option<PathBuf> {
    let is_result_dir = |dir: &Path| dir.join("trial.log").exists() || dir.join("verifier").is_dir();

    if is_result_dir(output_dir) {
        return Some(output_dir.to_path_buf());
    }

    WalkDir::new(output_dir)
        .min_depth(1)
        .max_depth(3)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir() && is_result_dir(entry.path()))
        .max_by_key(|entry| entry.metadata().ok().and_then(|m| m.modified().ok()))
        .map(|entry| entry.into_path())
}

/// Computes the SHA-256 checksum of data.
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(String, usize), ArtifactError> {
    if !source.is_dir() {
        return Err(ArtifactError::NotFound(source.display().to_string()));
    }
    std::fs::create_dir_all(dest)?;

    let mut hasher = Sha256::new();
    let mut file_count = 0;

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| ArtifactError::InvalidRef(entry.path().display().to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            let data = std::fs::read(entry.path())?;
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(&data);
            std::fs::write(&target, &data)?;
            file_count += 1;
        }
    }

    Ok((hex::encode(hasher.finalize()), file_count))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_compute_checksum() {
        let checksum = compute_checksum(b"Hello, World!");
        assert_eq!(checksum.len(), 64);
        assert_eq!(checksum, compute_checksum(b"Hello, World!"));
        assert_ne!(checksum, compute_checksum(b"Different data"));
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let store = ArtifactStore::new("/data");
        assert!(store.resolve("abc/task").is_ok());
        assert!(matches!(
            store.resolve("../etc/passwd"),
            Err(ArtifactError::InvalidRef(_))
        ));
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("").is_err());
    }

    #[test]
    fn test_attempt_ref_layout() {
        let trial = TrialRef::new(Uuid::nil(), 3);
        assert_eq!(
            ArtifactStore::attempt_ref(trial, 2),
            format!("{}/trial_3/attempt_2", Uuid::nil())
        );
    }

    #[tokio::test]
    async fn test_stage_task_copies_and_digests() {
        let source = tempfile::tempdir().unwrap();
        write(&source.path().join("task.toml"), "name = \"hello\"\n");
        write(&source.path().join("tests/test.sh"), "exit 0\n");

        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let job_id = Uuid::new_v4();

        let staged = store.stage_task(job_id, source.path()).await.unwrap();
        assert_eq!(staged.file_count, 2);
        assert_eq!(staged.digest.len(), 64);
        assert!(root
            .path()
            .join(&staged.task_ref)
            .join("tests/test.sh")
            .exists());

        // Same content, same digest.
        let again = store.stage_task(Uuid::new_v4(), source.path()).await.unwrap();
        assert_eq!(again.digest, staged.digest);
    }

    #[tokio::test]
    async fn test_remove_job_deletes_staged_tree() {
        let source = tempfile::tempdir().unwrap();
        write(&source.path().join("task.toml"), "name = \"hello\"\n");

        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let job_id = Uuid::new_v4();
        store.stage_task(job_id, source.path()).await.unwrap();

        store.remove_job(job_id).await.unwrap();
        assert!(!root.path().join(job_id.to_string()).exists());

        // Removing twice is fine.
        store.remove_job(job_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_task_missing_source() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let err = store
            .stage_task(Uuid::new_v4(), &root.path().join("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_read_trial_log_uses_latest_attempt() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let trial = TrialRef::new(Uuid::new_v4(), 1);

        assert!(store.read_trial_log(trial).await.unwrap().is_none());

        let first = store.prepare_attempt_dir(trial, 1).await.unwrap();
        write(&first.join("trial.log"), "first");
        let second = store.prepare_attempt_dir(trial, 2).await.unwrap();
        write(&second.join("run_1__ab12/agent/oracle.txt"), "second");
        std::fs::create_dir_all(second.join("run_1__ab12/verifier")).unwrap();

        assert_eq!(store.latest_attempt(trial).await.unwrap(), Some(2));
        let log = store.read_trial_log(trial).await.unwrap();
        assert_eq!(log.as_deref(), Some("second"));
    }

    #[test]
    fn test_locate_result_dir_prefers_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(locate_result_dir(dir.path()).is_none());

        write(&dir.path().join("trial.log"), "x");
        assert_eq!(locate_result_dir(dir.path()).unwrap(), dir.path());
    }
}
