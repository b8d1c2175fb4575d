//! Task directory validation.
//!
//! A task is a directory holding a `task.toml` manifest, either at its root or
//! in exactly one level of nesting (an unpacked archive usually wraps the task
//! in a folder).

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::scheduler::job::Harness;

/// Manifest file that marks a task directory.
pub const TASK_MANIFEST: &str = "task.toml";

/// Errors raised while validating a task directory.
#[derive(Debug, Error)]
pub enum TaskValidationError {
    #[error("Task directory not found: {0}")]
    NotADirectory(PathBuf),

    #[error("Invalid task structure: task.toml not found under {0}")]
    ManifestNotFound(PathBuf),

    #[error("Invalid task.toml at {path}: {source}")]
    InvalidManifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated task directory.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    /// Directory containing `task.toml`.
    pub root: PathBuf,
    /// Display name of the task.
    pub name: String,
    /// Parsed manifest.
    pub manifest: toml::Table,
}

/// Finds the directory holding `task.toml`: `dir` itself, or the first
/// subdirectory (by name) that has one.
pub fn locate_task_root(dir: &Path) -> Result<PathBuf, TaskValidationError> {
    if !dir.is_dir() {
        return Err(TaskValidationError::NotADirectory(dir.to_path_buf()));
    }
    if dir.join(TASK_MANIFEST).is_file() {
        return Ok(dir.to_path_buf());
    }

    let mut subdirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    subdirs.sort();

    subdirs
        .into_iter()
        .find(|path| path.join(TASK_MANIFEST).is_file())
        .ok_or_else(|| TaskValidationError::ManifestNotFound(dir.to_path_buf()))
}

/// Validates a task directory for the given harness.
pub fn load_task(dir: &Path, harness: Harness) -> Result<TaskDefinition, TaskValidationError> {
    let root = locate_task_root(dir)?;
    let manifest_path = root.join(TASK_MANIFEST);
    let content = std::fs::read_to_string(&manifest_path)?;
    let manifest: toml::Table =
        toml::from_str(&content).map_err(|source| TaskValidationError::InvalidManifest {
            path: manifest_path.clone(),
            source,
        })?;

    // Both harnesses read the same manifest layout.
    tracing::debug!(harness = %harness, path = %manifest_path.display(), "Task manifest parsed");

    let name = task_name(&manifest, &root);
    Ok(TaskDefinition {
        root,
        name,
        manifest,
    })
}

/// `name`, then `[task].name`, then the directory name.
fn task_name(manifest: &toml::Table, root: &Path) -> String {
    let from_manifest = manifest
        .get("name")
        .and_then(|v| v.as_str())
        .or_else(|| {
            manifest
                .get("task")
                .and_then(|t| t.as_table())
                .and_then(|t| t.get("name"))
                .and_then(|v| v.as_str())
        });

    match from_manifest {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "task".to_string()),
    }
}
