//! Run configuration and the run-level result.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::analysis::aggregator::{aggregate, CheckCounts, RunMetrics};
use crate::report::ReportDestination;
use crate::stages::{ExecutionStatus, StageKind, StageResult};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("timeout_minutes must be a positive number, got {0}")]
    InvalidTimeout(f64),
}

/// Immutable input to one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    /// Enabled stages. Order and duplicates are irrelevant; execution is
    /// always in rank order.
    pub stages: Vec<StageKind>,
    /// Wall-clock budget per stage.
    pub timeout_minutes: f64,
    pub parallel_execution: bool,
    /// Surfaced in results and reports only; stages are not re-run.
    pub max_retries: u32,
    pub reports: Vec<ReportDestination>,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            stages: StageKind::ALL.to_vec(),
            timeout_minutes: 30.0,
            parallel_execution: true,
            max_retries: 0,
            reports: Vec::new(),
        }
    }
}

impl RunConfiguration {
    pub fn with_stages(mut self, stages: impl IntoIterator<Item = StageKind>) -> Self {
        self.stages = stages.into_iter().collect();
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel_execution = false;
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: f64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn with_report(mut self, destination: ReportDestination) -> Self {
        self.reports.push(destination);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.timeout_minutes.is_finite() || self.timeout_minutes <= 0.0 {
            return Err(ConfigError::InvalidTimeout(self.timeout_minutes));
        }
        Ok(())
    }

    /// Enabled stages, deduplicated, in rank order.
    pub fn enabled_stages(&self) -> Vec<StageKind> {
        let mut stages = self.stages.clone();
        stages.sort_by_key(|k| k.rank());
        stages.dedup();
        stages
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_minutes * 60.0).unwrap_or(Duration::MAX)
    }

    pub fn kind(&self) -> RunKind {
        if self.enabled_stages() == StageKind::ALL {
            RunKind::Comprehensive
        } else {
            RunKind::Custom
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Comprehensive,
    Custom,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Comprehensive => "comprehensive",
            RunKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated outcome of one run.
///
/// Created `Running` by [`RunResult::begin`] and finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub kind: RunKind,
    pub project_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    /// Completion order, which for the parallel group is not rank order.
    pub stages: Vec<StageResult>,
    pub counts: CheckCounts,
    pub metrics: RunMetrics,
    pub combined_error: Option<String>,
    pub configuration: RunConfiguration,
}

impl RunResult {
    pub fn begin(
        run_id: impl Into<String>,
        kind: RunKind,
        project_id: Option<String>,
        configuration: RunConfiguration,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
            project_id,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: 0.0,
            stages: Vec::new(),
            counts: CheckCounts::default(),
            metrics: RunMetrics::default(),
            combined_error: None,
            configuration,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Aggregate `stages` into this result and stamp the end time.
    pub fn finalize(&mut self, stages: Vec<StageResult>) {
        if self.is_finalized() {
            warn!(run_id = %self.run_id, "run already finalized, ignoring");
            return;
        }
        self.stages = stages;
        let agg = aggregate(&self.stages);
        self.status = agg.status;
        self.counts = agg.counts;
        self.metrics = agg.metrics;
        self.combined_error = agg.combined_error;
        self.stamp_end();
    }

    /// Finalize after a fault escaped the scheduling routine. Partial stage
    /// results are kept; the run is Failed with one error describing the fault.
    pub fn finalize_with_fault(&mut self, stages: Vec<StageResult>, fault: impl std::fmt::Display) {
        if self.is_finalized() {
            warn!(run_id = %self.run_id, "run already finalized, ignoring");
            return;
        }
        self.stages = stages;
        let agg = aggregate(&self.stages);
        self.status = ExecutionStatus::Failed;
        self.counts = agg.counts;
        self.metrics = agg.metrics;
        self.combined_error = Some(format!("framework error: {}", fault));
        self.stamp_end();
    }

    fn stamp_end(&mut self) {
        let ended_at = Utc::now().max(self.started_at);
        self.ended_at = Some(ended_at);
        self.duration_secs = (ended_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == kind)
    }
}

/// Point-in-time view of a live or finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusSnapshot {
    pub run_id: String,
    pub status: ExecutionStatus,
    pub current_stage: Option<StageKind>,
    pub completed_stages: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

impl RunStatusSnapshot {
    pub fn finished(run: &RunResult) -> Self {
        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            current_stage: None,
            completed_stages: run.stages.len(),
            started_at: run.started_at,
            ended_at: run.ended_at,
            cancelled: false,
        }
    }
}
