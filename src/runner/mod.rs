//! Sandbox runners: how a single trial attempt is executed.
//!
//! # Architecture
//!
//! ```text
//! RunRequest → SandboxRunner → harness process → output dir → verifier results
//! ```
//!
//! The worker pool hands each attempt to a [`SandboxRunner`]. The bundled
//! [`ProcessRunner`] spawns an external harness command and reads the
//! verifier output it leaves behind.

pub mod harbor;
pub mod results;
pub mod sandbox;

pub use harbor::{HarnessCommand, ProcessRunner};
pub use results::{read_test_summary, ResultFormat, TestSummary};
pub use sandbox::{FailureClass, RunRequest, RunResult, RunnerError, SandboxRunner};
