//! trialforge: distributed trial dispatcher and worker pool.
//!
//! A submitted task is run N times ("trials") across a horizontally scaled
//! fleet of workers. Trials travel through a work queue with visibility
//! timeouts, every state change is recorded in a durable store before the
//! queue is acknowledged, workers drain gracefully before they are removed,
//! and a capacity controller sizes the fleet from the queue depth.

pub mod api;
pub mod capacity;
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod runner;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, FleetConfig};
pub use error::ValidationError;
pub use scheduler::{JobId, JobStatus, TrialRef, TrialStatus};
