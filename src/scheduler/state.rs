//! Framework-wide counters and the bounded in-process run history.
//!
//! Owned by the framework behind a single mutex; callers only see the
//! operations below, never the raw collections.

use serde::{Deserialize, Serialize};

use super::RunResult;
use crate::analysis::stats::running_mean;
use crate::stages::ExecutionStatus;

pub const HISTORY_CAP: usize = 1000;
pub const HISTORY_TRIM_TO: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameworkStats {
    pub total_runs: u64,
    pub total_passed: u64,
    pub total_failed: u64,
    pub avg_duration_secs: f64,
}

#[derive(Debug, Default)]
pub struct FrameworkState {
    stats: FrameworkStats,
    /// Oldest first.
    history: Vec<RunResult>,
}

impl FrameworkState {
    /// Count a finished run and append it to the history.
    pub fn record(&mut self, run: RunResult) {
        self.stats.total_runs += 1;
        if run.status.is_success() {
            self.stats.total_passed += 1;
        } else if run.status.is_failure() {
            self.stats.total_failed += 1;
        }
        self.stats.avg_duration_secs =
            running_mean(self.stats.avg_duration_secs, run.duration_secs, self.stats.total_runs);

        self.history.push(run);
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_TRIM_TO;
            self.history.drain(..excess);
        }
    }

    pub fn stats(&self) -> FrameworkStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Most recent first, optionally filtered by overall status.
    pub fn recent(&self, limit: usize, status: Option<ExecutionStatus>) -> Vec<RunResult> {
        self.history
            .iter()
            .rev()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn find(&self, run_id: &str) -> Option<&RunResult> {
        self.history.iter().rev().find(|r| r.run_id == run_id)
    }
}
