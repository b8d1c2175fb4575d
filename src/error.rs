//! Error types shared across trialforge subsystems.
//!
//! Subsystem-specific errors live next to the code that raises them
//! (`QueueError` in `scheduler::queue`, `StoreError` in `storage`,
//! `RunnerError` in `runner`, ...). This module holds the errors that more
//! than one subsystem produces.

use thiserror::Error;

/// Errors raised while validating a job submission or parsing stored tags.
///
/// These are always reported synchronously and never leave partial state.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("requested trials must be between {min} and {max}, got {requested}")]
    TrialCountOutOfRange { requested: u32, min: u32, max: u32 },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{field} is {len} characters, at most {max} allowed")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("unknown harness '{0}'")]
    UnknownHarness(String),

    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::TrialCountOutOfRange {
            requested: 0,
            min: 1,
            max: 100,
        };
        assert!(err.to_string().contains("got 0"));

        let err = ValidationError::UnknownHarness("docker".to_string());
        assert!(err.to_string().contains("docker"));

        let err = ValidationError::MissingField("model");
        assert!(err.to_string().contains("model"));
    }
}
