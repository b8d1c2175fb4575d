//! Client-facing surface: task validation and the ingress API.

pub mod ingress;
pub mod task;

pub use ingress::{IngressApi, IngressError};
pub use task::{load_task, locate_task_root, TaskDefinition, TaskValidationError, TASK_MANIFEST};
