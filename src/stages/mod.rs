//! Validation stages run against a built project.
//!
//! Each stage runs a fixed, ordered checklist of independent checks and folds
//! the outcomes into a single [`StageResult`]. A failing check never aborts the
//! remaining checks of the same stage.

pub mod cli;
pub mod functional;
pub mod installation;
pub mod performance;
pub mod recovery;
pub mod registry;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{ExecutionContext, ProjectRef};
use crate::process::{CommandOutput, Invocation, ProcessError};

pub use self::registry::{RegistryError, StageRegistry};

/// The five fixed validation phases, in scheduling rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Installation,
    Cli,
    Functional,
    Performance,
    Recovery,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Installation,
        StageKind::Cli,
        StageKind::Functional,
        StageKind::Performance,
        StageKind::Recovery,
    ];

    /// Scheduling rank (Installation = 1 .. Recovery = 5).
    pub fn rank(self) -> u8 {
        match self {
            StageKind::Installation => 1,
            StageKind::Cli => 2,
            StageKind::Functional => 3,
            StageKind::Performance => 4,
            StageKind::Recovery => 5,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.rank() == rank)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Installation => "installation",
            StageKind::Cli => "cli",
            StageKind::Functional => "functional",
            StageKind::Performance => "performance",
            StageKind::Recovery => "recovery",
        }
    }

    /// Stages that always run sequentially ahead of the concurrent group.
    pub fn is_prefix(self) -> bool {
        matches!(self, StageKind::Installation | StageKind::Cli)
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown stage '{0}' (expected installation, cli, functional, performance or recovery)")]
pub struct ParseStageError(String);

impl std::str::FromStr for StageKind {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "installation" | "install" => Ok(StageKind::Installation),
            "cli" => Ok(StageKind::Cli),
            "functional" => Ok(StageKind::Functional),
            "performance" | "perf" => Ok(StageKind::Performance),
            "recovery" => Ok(StageKind::Recovery),
            other => Err(ParseStageError(other.to_string())),
        }
    }
}

/// Lifecycle status shared by stages and runs.
///
/// `Pending -> Running -> {Passed, Failed, Skipped, Error, Timeout}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Only `Passed` counts as success for a stage or a run.
    pub fn is_success(self) -> bool {
        self == ExecutionStatus::Passed
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failed | ExecutionStatus::Error | ExecutionStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Passed => "passed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown status '{0}'")]
pub struct ParseStatusError(String);

impl std::str::FromStr for ExecutionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "passed" | "pass" => Ok(ExecutionStatus::Passed),
            "failed" | "fail" => Ok(ExecutionStatus::Failed),
            "skipped" | "skip" => Ok(ExecutionStatus::Skipped),
            "error" => Ok(ExecutionStatus::Error),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Open extension value for stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{:.2}", n),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

/// Outcome of one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricValue>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

impl StageResult {
    /// A fresh, running result for `stage` starting now.
    pub fn begin(stage: StageKind) -> Self {
        Self::begin_at(stage, Utc::now())
    }

    pub fn begin_at(stage: StageKind, started_at: DateTime<Utc>) -> Self {
        Self {
            stage,
            status: ExecutionStatus::Running,
            started_at,
            ended_at: None,
            duration_secs: 0.0,
            passed: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            metrics: BTreeMap::new(),
            artifacts: Vec::new(),
        }
    }

    /// Stamp the end time and, if still running, derive the status from the counts.
    pub fn finish(mut self) -> Self {
        self.finish_at(Utc::now());
        self
    }

    pub(crate) fn finish_at(&mut self, ended_at: DateTime<Utc>) {
        let ended_at = ended_at.max(self.started_at);
        self.ended_at = Some(ended_at);
        self.duration_secs = (ended_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        if !self.status.is_terminal() {
            self.status = self.derived_status();
        }
    }

    /// Status implied by the check counts.
    pub fn derived_status(&self) -> ExecutionStatus {
        if self.failed > 0 {
            ExecutionStatus::Failed
        } else if self.passed > 0 {
            ExecutionStatus::Passed
        } else if !self.errors.is_empty() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Skipped
        }
    }

    /// Synthesized result for a stage the scheduler decided not to run.
    pub fn skipped(stage: StageKind, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut result = Self::begin_at(stage, now);
        result.status = ExecutionStatus::Skipped;
        result.warnings.push(reason.into());
        result.finish_at(now);
        result
    }

    /// Synthesized result for a stage that exceeded its wall-clock budget.
    pub fn timed_out(stage: StageKind, started_at: DateTime<Utc>, timeout_minutes: f64) -> Self {
        let mut result = Self::begin_at(stage, started_at);
        result.status = ExecutionStatus::Timeout;
        result
            .errors
            .push(format!("Stage timeout after {} minutes", timeout_minutes));
        result
            .metrics
            .insert("timeout_minutes".to_string(), timeout_minutes.into());
        result.finish_at(Utc::now());
        result
    }

    /// Synthesized result for a stage that faulted instead of returning.
    pub fn errored(stage: StageKind, started_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        let mut result = Self::begin_at(stage, started_at);
        result.status = ExecutionStatus::Error;
        result.errors.push(message.into());
        result.finish_at(Utc::now());
        result
    }

    pub fn total_checks(&self) -> u32 {
        self.passed + self.failed + self.skipped
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(MetricValue::as_f64)
    }
}

/// Unexpected fault escaping a stage. Expected failures are recorded as checks.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{0}")]
    Internal(String),
}

/// A validation stage.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Run the stage checklist. Only unexpected faults are returned as `Err`.
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageResult, StageError>;
}

/// Result of a single checklist item.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Passed,
    Failed(String),
    Skipped(String),
}

impl CheckOutcome {
    pub fn cancelled() -> Self {
        CheckOutcome::Skipped("run cancelled".to_string())
    }
}

/// Stage-local accumulator for check outcomes.
#[derive(Debug)]
pub struct Checklist {
    result: StageResult,
}

impl Checklist {
    pub fn new(stage: StageKind) -> Self {
        Self {
            result: StageResult::begin(stage),
        }
    }

    pub fn stage(&self) -> StageKind {
        self.result.stage
    }

    pub fn record(&mut self, check: &str, outcome: CheckOutcome) {
        match outcome {
            CheckOutcome::Passed => {
                tracing::debug!(stage = %self.result.stage, check, "check passed");
                self.result.passed += 1;
            }
            CheckOutcome::Failed(error) => {
                tracing::info!(stage = %self.result.stage, check, %error, "check failed");
                self.result.failed += 1;
                self.result.errors.push(format!("{}: {}", check, error));
            }
            CheckOutcome::Skipped(reason) => {
                tracing::debug!(stage = %self.result.stage, check, %reason, "check skipped");
                self.result.skipped += 1;
                self.result.warnings.push(format!("{}: {}", check, reason));
            }
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.result.warnings.push(message.into());
    }

    pub fn metric(&mut self, key: &str, value: impl Into<MetricValue>) {
        self.result.metrics.insert(key.to_string(), value.into());
    }

    pub fn artifact(&mut self, path: Option<PathBuf>) {
        if let Some(path) = path {
            self.result.artifacts.push(path);
        }
    }

    pub fn finish(self) -> StageResult {
        self.result.finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the stage implementations
// ---------------------------------------------------------------------------

/// Build an invocation of the project's CLI with extra arguments.
pub(crate) fn project_command(
    project: &ProjectRef,
    args: &[&str],
    timeout: std::time::Duration,
) -> Option<Invocation> {
    let (program, prefix) = project.entrypoint.split_first()?;
    Some(
        Invocation::new(program.clone(), timeout)
            .args(prefix.iter().cloned())
            .args(args.iter().map(|a| a.to_string()))
            .cwd(&project.root),
    )
}

/// Find the first crash marker present in the output, if any.
pub(crate) fn crash_marker<'a>(output: &CommandOutput, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .find(|m| output.stderr.contains(m.as_str()) || output.stdout.contains(m.as_str()))
        .map(String::as_str)
}

/// Last `max_lines` non-empty lines of a stream, for error messages.
pub(crate) fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join(" | ")
}

/// Describe a non-successful command run in one line.
pub(crate) fn describe_failure(output: &CommandOutput) -> String {
    if output.timed_out {
        return format!("timed out after {:.1}s", output.elapsed.as_secs_f64());
    }
    let code = output
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let detail = tail(&output.stderr, 3);
    if detail.is_empty() {
        format!("exit code {}", code)
    } else {
        format!("exit code {}: {}", code, detail)
    }
}

/// Persist a check's command output under the run's artifact directory.
pub(crate) fn write_artifact(
    ctx: &ExecutionContext,
    stage: StageKind,
    check: &str,
    invocation: &Invocation,
    output: &CommandOutput,
) -> Option<PathBuf> {
    let dir = ctx.artifact_dir(stage)?;
    let path = dir.join(format!("{}.log", check));
    let body = format!(
        "$ {}\nexit: {:?}\ntimed_out: {}\nelapsed_ms: {}\n\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        invocation.command_line(),
        output.exit_code,
        output.timed_out,
        output.elapsed.as_millis(),
        output.stdout,
        output.stderr,
    );
    let written = std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(&path, body));
    match written {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to write check artifact");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_order_is_fixed() {
        let ranks: Vec<u8> = StageKind::ALL.iter().map(|k| k.rank()).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
        assert_eq!(StageKind::from_rank(4), Some(StageKind::Performance));
        assert_eq!(StageKind::from_rank(0), None);
    }

    #[test]
    fn test_parse_stage_kind() {
        assert_eq!("CLI".parse::<StageKind>().unwrap(), StageKind::Cli);
        assert_eq!("install".parse::<StageKind>().unwrap(), StageKind::Installation);
        assert!("deploy".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(ExecutionStatus::Passed.is_success());
        assert!(!ExecutionStatus::Skipped.is_success());
        assert!(ExecutionStatus::Timeout.is_failure());
        assert!(ExecutionStatus::Error.is_failure());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_checklist_derives_status() {
        let mut checks = Checklist::new(StageKind::Cli);
        checks.record("help_flag", CheckOutcome::Passed);
        checks.record("version_flag", CheckOutcome::Skipped("unsupported".into()));
        let result = checks.finish();
        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!((result.passed, result.failed, result.skipped), (1, 0, 1));
        assert!(result.ended_at.is_some());
        assert!(result.duration_secs >= 0.0);

        let mut checks = Checklist::new(StageKind::Cli);
        checks.record("help_flag", CheckOutcome::Passed);
        checks.record("invalid_argument", CheckOutcome::Failed("accepted".into()));
        let result = checks.finish();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.errors, vec!["invalid_argument: accepted".to_string()]);
    }

    #[test]
    fn test_all_skipped_checks_yield_skipped_stage() {
        let mut checks = Checklist::new(StageKind::Functional);
        checks.record("scenarios", CheckOutcome::cancelled());
        assert_eq!(checks.finish().status, ExecutionStatus::Skipped);
    }

    #[test]
    fn test_synthesized_results() {
        let skipped = StageResult::skipped(StageKind::Functional, "cli critical");
        assert_eq!(skipped.status, ExecutionStatus::Skipped);
        assert_eq!(skipped.duration_secs, 0.0);
        assert_eq!((skipped.passed, skipped.failed), (0, 0));

        let timed_out = StageResult::timed_out(StageKind::Performance, Utc::now(), 0.5);
        assert_eq!(timed_out.status, ExecutionStatus::Timeout);
        assert_eq!(timed_out.errors, vec!["Stage timeout after 0.5 minutes".to_string()]);

        let errored = StageResult::errored(StageKind::Recovery, Utc::now(), "boom");
        assert_eq!(errored.status, ExecutionStatus::Error);
        assert_eq!(errored.errors.len(), 1);
    }

    #[test]
    fn test_finish_never_goes_negative() {
        let mut result = StageResult::begin(StageKind::Cli);
        let earlier = result.started_at - chrono::Duration::seconds(5);
        result.finish_at(earlier);
        assert_eq!(result.duration_secs, 0.0);
        assert_eq!(result.ended_at, Some(result.started_at));
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        assert_eq!(tail("a\n\nb\nc\nd", 2), "c | d");
        assert_eq!(tail("", 3), "");
    }
}
