//! Database schema constants.
//!
//! Statuses and harness tags are stored as their lowercase string forms.

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    task_name VARCHAR(255) NOT NULL,
    task_ref VARCHAR(1024) NOT NULL,
    task_digest VARCHAR(64) NOT NULL DEFAULT '',
    harness VARCHAR(32) NOT NULL,
    model VARCHAR(255) NOT NULL,
    requested_trials INTEGER NOT NULL CHECK (requested_trials BETWEEN 1 AND 100),
    status VARCHAR(16) NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ
)
"#;

/// SQL schema for creating the trials table.
pub const CREATE_TRIALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS trials (
    job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    trial_number INTEGER NOT NULL CHECK (trial_number >= 1),
    status VARCHAR(16) NOT NULL DEFAULT 'queued',
    tests_passed INTEGER,
    tests_total INTEGER,
    artifact_ref VARCHAR(1024),
    error TEXT,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    worker_id VARCHAR(255),
    enqueued_at TIMESTAMPTZ,
    PRIMARY KEY (job_id, trial_number)
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_trials_status ON trials(status);
CREATE INDEX IF NOT EXISTS idx_trials_unenqueued ON trials(job_id) WHERE enqueued_at IS NULL
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_JOBS_TABLE, CREATE_TRIALS_TABLE, CREATE_INDEXES]
}

/// Table names in the schema.
pub mod tables {
    /// Jobs table name.
    pub const JOBS: &str = "jobs";
    /// Trials table name.
    pub const TRIALS: &str = "trials";
}
