//! Folds per-stage results into one run-level outcome.
//!
//! Pure: no I/O, no context, and the answer never depends on the order of the
//! input list (parallel stages arrive in completion order).

use serde::{Deserialize, Serialize};

use crate::stages::{ExecutionStatus, StageResult};

/// At most this many stage errors make it into the combined message.
pub const MAX_COMBINED_ERRORS: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCounts {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl CheckCounts {
    pub fn total(&self) -> u64 {
        self.passed + self.failed + self.skipped
    }
}

/// Well-known run metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// passed / (passed + failed + skipped), 0 with no checks.
    pub success_rate: f64,
    /// min(100, checks per second * 10 * success_rate), 0 with no duration.
    pub performance_score: f64,
    /// Percentage of stages that ran (not Skipped) and Passed.
    pub coverage_percentage: f64,
    /// Sum of stage durations.
    pub total_duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub status: ExecutionStatus,
    pub counts: CheckCounts,
    pub metrics: RunMetrics,
    pub combined_error: Option<String>,
}

/// Overall status: Failed if any stage failed (Failed, Error or Timeout),
/// else Skipped if every stage was skipped, else Passed if any check passed,
/// else Failed.
pub fn overall_status(results: &[StageResult], counts: &CheckCounts) -> ExecutionStatus {
    if results.iter().any(|r| r.status.is_failure()) {
        ExecutionStatus::Failed
    } else if !results.is_empty() && results.iter().all(|r| r.status == ExecutionStatus::Skipped) {
        ExecutionStatus::Skipped
    } else if counts.passed > 0 {
        ExecutionStatus::Passed
    } else {
        ExecutionStatus::Failed
    }
}

pub fn aggregate(results: &[StageResult]) -> Aggregate {
    let counts = results.iter().fold(CheckCounts::default(), |mut acc, r| {
        acc.passed += u64::from(r.passed);
        acc.failed += u64::from(r.failed);
        acc.skipped += u64::from(r.skipped);
        acc
    });

    let total = counts.total();
    let success_rate = if total == 0 {
        0.0
    } else {
        counts.passed as f64 / total as f64
    };

    let total_duration_secs: f64 = results.iter().map(|r| r.duration_secs.max(0.0)).sum();
    let performance_score = if total_duration_secs > 0.0 {
        (total as f64 / total_duration_secs * 10.0 * success_rate).min(100.0)
    } else {
        0.0
    };

    let ran = results
        .iter()
        .filter(|r| r.status != ExecutionStatus::Skipped)
        .count();
    let passed_stages = results
        .iter()
        .filter(|r| r.status == ExecutionStatus::Passed)
        .count();
    let coverage_percentage = if ran == 0 {
        0.0
    } else {
        passed_stages as f64 / ran as f64 * 100.0
    };

    Aggregate {
        status: overall_status(results, &counts),
        counts,
        metrics: RunMetrics {
            success_rate,
            performance_score,
            coverage_percentage,
            total_duration_secs,
        },
        combined_error: combined_error(results),
    }
}

/// First few `"stage: error"` strings, stages taken in rank order so the
/// message is stable regardless of completion order.
fn combined_error(results: &[StageResult]) -> Option<String> {
    let mut ordered: Vec<&StageResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.stage.rank());
    let errors: Vec<String> = ordered
        .iter()
        .flat_map(|r| r.errors.iter().map(move |e| format!("{}: {}", r.stage, e)))
        .take(MAX_COMBINED_ERRORS)
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageKind;
    use chrono::{Duration, Utc};

    fn result(stage: StageKind, passed: u32, failed: u32, skipped: u32, secs: i64) -> StageResult {
        let start = Utc::now();
        let mut r = StageResult::begin_at(stage, start);
        r.passed = passed;
        r.failed = failed;
        r.skipped = skipped;
        for i in 0..failed {
            r.errors.push(format!("check {} failed", i));
        }
        r.finish_at(start + Duration::seconds(secs));
        r
    }

    #[test]
    fn test_empty_input_is_failed_without_division_errors() {
        let agg = aggregate(&[]);
        assert_eq!(agg.status, ExecutionStatus::Failed);
        assert_eq!(agg.metrics.success_rate, 0.0);
        assert_eq!(agg.metrics.performance_score, 0.0);
        assert_eq!(agg.metrics.coverage_percentage, 0.0);
        assert_eq!(agg.combined_error, None);
    }

    #[test]
    fn test_all_passing() {
        let results = vec![
            result(StageKind::Installation, 7, 0, 0, 2),
            result(StageKind::Cli, 5, 0, 0, 2),
        ];
        let agg = aggregate(&results);
        assert_eq!(agg.status, ExecutionStatus::Passed);
        assert_eq!(agg.counts, CheckCounts { passed: 12, failed: 0, skipped: 0 });
        assert_eq!(agg.metrics.success_rate, 1.0);
        // 12 checks / 4 s * 10 = 30
        assert!((agg.metrics.performance_score - 30.0).abs() < 1e-9);
        assert_eq!(agg.metrics.coverage_percentage, 100.0);
    }

    #[test]
    fn test_performance_score_is_capped() {
        let agg = aggregate(&[result(StageKind::Cli, 500, 0, 0, 1)]);
        assert_eq!(agg.metrics.performance_score, 100.0);
    }

    #[test]
    fn test_any_failure_fails_the_run() {
        let mut timeout = StageResult::timed_out(StageKind::Recovery, Utc::now(), 1.0);
        timeout.finish_at(Utc::now());
        let results = vec![result(StageKind::Cli, 5, 0, 0, 1), timeout];
        assert_eq!(aggregate(&results).status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_all_skipped_is_skipped() {
        let results = vec![
            StageResult::skipped(StageKind::Functional, "cli critical"),
            StageResult::skipped(StageKind::Performance, "installation failed"),
        ];
        let agg = aggregate(&results);
        assert_eq!(agg.status, ExecutionStatus::Skipped);
        assert_eq!(agg.metrics.coverage_percentage, 0.0);
    }

    #[test]
    fn test_coverage_ignores_skipped_stages() {
        let results = vec![
            result(StageKind::Installation, 7, 0, 0, 1),
            StageResult::skipped(StageKind::Functional, "nothing configured"),
            result(StageKind::Performance, 2, 1, 0, 1),
        ];
        assert_eq!(aggregate(&results).metrics.coverage_percentage, 50.0);
    }

    #[test]
    fn test_combined_error_bounded_and_order_independent() {
        let a = result(StageKind::Cli, 0, 4, 0, 1);
        let b = result(StageKind::Installation, 0, 3, 0, 1);
        let forward = aggregate(&[a.clone(), b.clone()]);
        let backward = aggregate(&[b, a]);
        assert_eq!(forward, backward);

        let combined = forward.combined_error.unwrap();
        assert_eq!(combined.matches("; ").count(), MAX_COMBINED_ERRORS - 1);
        assert!(combined.starts_with("installation: check 0 failed"));
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let results = vec![
            result(StageKind::Installation, 6, 1, 0, 3),
            result(StageKind::Functional, 2, 0, 1, 5),
        ];
        assert_eq!(aggregate(&results), aggregate(&results));
    }
}
