//! Trial scheduling: jobs, the work queue, the dispatcher and the worker pool.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Dispatcher  │  submit(job) → N trial messages
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │  WorkQueue   │  visibility timeout + ack
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│   WorkerPool each
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                      ┌──────▼───────┐
//!                      │  TrialStore  │  attempt CAS, conditional finalize
//!                      └──────────────┘
//! ```
//!
//! # Reliability
//!
//! - **At-least-once delivery**: a fetched message stays invisible for the
//!   visibility timeout and reappears unless acknowledged.
//! - **Single holder**: beginning an attempt compare-and-sets `attempt_count`,
//!   so a duplicate delivery cannot start a second run of the same attempt.
//! - **Idempotent finalize**: a terminal write only lands on a non-terminal
//!   trial, and is persisted before the message is acknowledged.
//! - **Crash recovery**: the dispatcher's reconciliation pass republishes
//!   trials that were written but never enqueued and finalizes jobs whose
//!   aggregate update was lost.

pub mod aggregate;
pub mod dispatcher;
pub mod job;
pub mod memory_queue;
pub mod queue;
pub mod worker_pool;

pub use aggregate::{FailureThresholdPolicy, JobFailurePolicy, JobObserver};
pub use dispatcher::{DispatchError, Dispatcher, ReconcileReport};
pub use job::{
    Harness, Job, JobDetail, JobId, JobSpec, JobStatus, JobSummary, Trial, TrialCounts,
    TrialOutcome, TrialRef, TrialStatus,
};
pub use memory_queue::MemoryWorkQueue;
pub use queue::{Delivery, Lease, QueueError, QueueMessage, QueueStats, RedisWorkQueue, WorkQueue};
pub use worker_pool::{PoolError, PoolExit, PoolStats, WorkerHealth, WorkerPool, WorkerPoolConfig};
