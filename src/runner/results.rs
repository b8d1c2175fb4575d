//! Verifier output parsing.
//!
//! Harnesses leave their verdict under `verifier/` in the trial result
//! directory. Two layouts are understood, in order:
//!
//! 1. `verifier/ctrf.json`: Common Test Report Format, read from
//!    `results.summary.{tests,passed,failed}`
//! 2. `verifier/reward.txt`: a single number; a reward of 1 or more counts as
//!    one passing test out of one

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where a test summary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    Ctrf,
    Reward,
}

/// Test counts reported by a verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub passed: u32,
    pub total: u32,
    pub failed: u32,
    pub format: ResultFormat,
}

impl TestSummary {
    /// Whether every reported test passed and at least one test ran.
    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }
}

#[derive(Debug, Deserialize)]
struct CtrfReport {
    results: CtrfResults,
}

#[derive(Debug, Deserialize)]
struct CtrfResults {
    summary: CtrfSummary,
}

#[derive(Debug, Deserialize)]
struct CtrfSummary {
    #[serde(default)]
    tests: u32,
    #[serde(default)]
    passed: u32,
    #[serde(default)]
    failed: u32,
}

/// Parses a CTRF report.
pub fn parse_ctrf(raw: &str) -> Result<TestSummary, serde_json::Error> {
    let report: CtrfReport = serde_json::from_str(raw)?;
    let summary = report.results.summary;
    Ok(TestSummary {
        passed: summary.passed,
        total: summary.tests,
        failed: summary.failed,
        format: ResultFormat::Ctrf,
    })
}

/// Parses a reward file. Returns `None` if the contents are not a number.
pub fn parse_reward(raw: &str) -> Option<TestSummary> {
    let reward: f64 = raw.trim().parse().ok()?;
    if !reward.is_finite() {
        return None;
    }
    let passed = u32::from(reward >= 1.0);
    Some(TestSummary {
        passed,
        total: 1,
        failed: 1 - passed,
        format: ResultFormat::Reward,
    })
}

/// Reads the verifier output under `result_dir`, if any can be understood.
pub fn read_test_summary(result_dir: &Path) -> Option<TestSummary> {
    let verifier = result_dir.join("verifier");

    let ctrf_path = verifier.join("ctrf.json");
    if let Ok(raw) = std::fs::read_to_string(&ctrf_path) {
        match parse_ctrf(&raw) {
            Ok(summary) => return Some(summary),
            Err(e) => warn!(path = %ctrf_path.display(), error = %e, "Unreadable CTRF report"),
        }
    }

    let reward_path = verifier.join("reward.txt");
    if let Ok(raw) = std::fs::read_to_string(&reward_path) {
        match parse_reward(&raw) {
            Some(summary) => return Some(summary),
            None => warn!(path = %reward_path.display(), "Unreadable reward file"),
        }
    }

    None
}
