//! Post-hoc analysis over finalized run history.
//!
//! Everything here is recomputed on demand from [`RunResult`]s and never
//! persisted. Levels are cumulative: Detailed includes Basic, Comprehensive
//! includes Detailed.

pub mod aggregator;
pub mod patterns;
pub mod stats;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use self::patterns::{failure_patterns, FailurePattern};
use self::stats::{mean, running_mean, sample_variance, DurationStats};
use crate::scheduler::RunResult;
use crate::stages::{ExecutionStatus, StageKind};

/// Size of the "recent" window for trend detection.
pub const TREND_WINDOW: usize = 5;
const TREND_THRESHOLD: f64 = 0.1;
const LOW_SUCCESS_RATE: f64 = 0.8;
const SLOW_AVG_DURATION_SECS: f64 = 120.0;
const MANY_PATTERNS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisLevel {
    Basic,
    Detailed,
    Comprehensive,
}

#[derive(Debug, Error)]
#[error("unknown analysis level '{0}' (expected basic, detailed or comprehensive)")]
pub struct ParseLevelError(String);

impl std::str::FromStr for AnalysisLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(AnalysisLevel::Basic),
            "detailed" => Ok(AnalysisLevel::Detailed),
            "comprehensive" | "full" => Ok(AnalysisLevel::Comprehensive),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_runs: usize,
    pub passed_runs: usize,
    pub failed_runs: usize,
    pub skipped_runs: usize,
    /// Passed runs / total runs.
    pub success_rate: f64,
    pub checks_passed: u64,
    pub checks_failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageBreakdown {
    pub runs: u64,
    pub passed: u64,
    pub failed: u64,
    pub avg_duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub trend: Trend,
    pub recent_success_rate: f64,
    pub older_success_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub failure_rate: f64,
    /// (1 - failure_rate) * 100.
    pub reliability_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalAnalysis {
    pub level: AnalysisLevel,
    pub generated_at: DateTime<Utc>,
    pub summary: Summary,
    pub recommendations: Vec<String>,

    // Detailed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durations: Option<DurationStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_patterns: Vec<FailurePattern>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_breakdown: BTreeMap<StageKind, StageBreakdown>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slow_runs: Vec<String>,

    // Comprehensive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub performance_insights: Vec<String>,
}

/// Analyze `runs` (any order) at the requested level.
pub fn analyze(runs: &[RunResult], level: AnalysisLevel) -> HistoricalAnalysis {
    let mut ordered: Vec<&RunResult> = runs.iter().collect();
    ordered.sort_by_key(|r| r.started_at);

    let summary = summarize(&ordered);
    let mut analysis = HistoricalAnalysis {
        level,
        generated_at: Utc::now(),
        summary,
        recommendations: basic_recommendations(&summary),
        durations: None,
        failure_patterns: Vec::new(),
        stage_breakdown: BTreeMap::new(),
        slow_runs: Vec::new(),
        trend: None,
        risk: None,
        quality_score: None,
        performance_insights: Vec::new(),
    };

    if level >= AnalysisLevel::Detailed {
        detailed(&mut analysis, runs, &ordered);
    }
    if level >= AnalysisLevel::Comprehensive {
        comprehensive(&mut analysis, &ordered);
    }
    analysis
}

fn summarize(runs: &[&RunResult]) -> Summary {
    let count = |status: ExecutionStatus| runs.iter().filter(|r| r.status == status).count();
    let passed_runs = count(ExecutionStatus::Passed);
    Summary {
        total_runs: runs.len(),
        passed_runs,
        failed_runs: runs.iter().filter(|r| r.status.is_failure()).count(),
        skipped_runs: count(ExecutionStatus::Skipped),
        success_rate: success_rate(runs),
        checks_passed: runs.iter().map(|r| r.counts.passed).sum(),
        checks_failed: runs.iter().map(|r| r.counts.failed).sum(),
    }
}

fn success_rate(runs: &[&RunResult]) -> f64 {
    if runs.is_empty() {
        return 0.0;
    }
    runs.iter().filter(|r| r.status.is_success()).count() as f64 / runs.len() as f64
}

fn basic_recommendations(summary: &Summary) -> Vec<String> {
    let mut recs = Vec::new();
    if summary.total_runs == 0 {
        recs.push("No test runs recorded yet; run `autobuild run` to collect history".to_string());
        return recs;
    }
    if summary.success_rate < LOW_SUCCESS_RATE {
        recs.push(format!(
            "Success rate {:.0}% is below {:.0}%; investigate the failing stages",
            summary.success_rate * 100.0,
            LOW_SUCCESS_RATE * 100.0
        ));
    }
    if summary.failed_runs > 0 {
        recs.push(format!(
            "{} run(s) failed; review their combined error messages",
            summary.failed_runs
        ));
    }
    recs
}

fn detailed(analysis: &mut HistoricalAnalysis, runs: &[RunResult], ordered: &[&RunResult]) {
    let durations: Vec<f64> = ordered.iter().map(|r| r.duration_secs).collect();
    let stats = DurationStats::from_samples(&durations);

    if stats.avg_secs > 0.0 {
        analysis.slow_runs = ordered
            .iter()
            .filter(|r| r.duration_secs > 2.0 * stats.avg_secs)
            .map(|r| r.run_id.clone())
            .collect();
    }

    for run in ordered {
        for stage in &run.stages {
            let entry = analysis.stage_breakdown.entry(stage.stage).or_default();
            entry.runs += 1;
            if stage.status.is_success() {
                entry.passed += 1;
            } else if stage.status.is_failure() {
                entry.failed += 1;
            }
            entry.avg_duration_secs =
                running_mean(entry.avg_duration_secs, stage.duration_secs, entry.runs);
        }
    }

    analysis.failure_patterns = failure_patterns(runs);

    if stats.avg_secs > SLOW_AVG_DURATION_SECS {
        analysis.recommendations.push(format!(
            "Average run duration {:.0}s exceeds {:.0}s; enable parallel execution or trim slow checks",
            stats.avg_secs, SLOW_AVG_DURATION_SECS
        ));
    }
    if analysis.failure_patterns.len() > MANY_PATTERNS {
        analysis.recommendations.push(format!(
            "{} distinct failure patterns found; failures do not share a single cause",
            analysis.failure_patterns.len()
        ));
    }
    analysis.durations = Some(stats);
}

/// Compare the success rate of the most recent window against everything
/// before it. With fewer than `TREND_WINDOW + 1` runs the window shrinks so
/// at least one run remains on the older side.
pub fn trend(ordered: &[&RunResult]) -> TrendAnalysis {
    if ordered.len() < 2 {
        return TrendAnalysis {
            trend: Trend::InsufficientData,
            recent_success_rate: success_rate(ordered),
            older_success_rate: 0.0,
        };
    }
    let window = TREND_WINDOW.min(ordered.len() - 1);
    let (older, recent) = ordered.split_at(ordered.len() - window);
    let recent_rate = success_rate(recent);
    let older_rate = success_rate(older);
    let trend = if recent_rate > older_rate + TREND_THRESHOLD {
        Trend::Improving
    } else if recent_rate < older_rate - TREND_THRESHOLD {
        Trend::Declining
    } else {
        Trend::Stable
    };
    TrendAnalysis {
        trend,
        recent_success_rate: recent_rate,
        older_success_rate: older_rate,
    }
}

pub fn assess_risk(ordered: &[&RunResult]) -> RiskAssessment {
    if ordered.is_empty() {
        return RiskAssessment {
            level: RiskLevel::Unknown,
            failure_rate: 0.0,
            reliability_score: 0.0,
        };
    }
    let failures = ordered.iter().filter(|r| r.status.is_failure()).count();
    let failure_rate = failures as f64 / ordered.len() as f64;
    let level = if failure_rate > 0.3 {
        RiskLevel::High
    } else if failure_rate > 0.1 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    RiskAssessment {
        level,
        failure_rate,
        reliability_score: (1.0 - failure_rate) * 100.0,
    }
}

/// success_rate * 60 + performance_factor * 30 + consistency_factor * 10,
/// clamped to [0, 100]. 0 with no history.
pub fn quality_score(ordered: &[&RunResult]) -> f64 {
    if ordered.is_empty() {
        return 0.0;
    }
    let durations: Vec<f64> = ordered.iter().map(|r| r.duration_secs).collect();
    let performance_factor = (1.0 - mean(&durations) / 600.0).max(0.0);
    let consistency_factor = if durations.len() < 2 {
        1.0
    } else {
        (1.0 - sample_variance(&durations) / 10_000.0).max(0.0)
    };
    let score = success_rate(ordered) * 60.0 + performance_factor * 30.0 + consistency_factor * 10.0;
    score.clamp(0.0, 100.0)
}

fn performance_insights(analysis: &HistoricalAnalysis, ordered: &[&RunResult]) -> Vec<String> {
    let mut insights = Vec::new();
    if let Some(d) = &analysis.durations {
        if d.sample_count > 0 {
            insights.push(format!(
                "Run duration avg {:.1}s (min {:.1}s, max {:.1}s)",
                d.avg_secs, d.min_secs, d.max_secs
            ));
        }
    }
    let slowest = analysis
        .stage_breakdown
        .iter()
        .max_by(|a, b| a.1.avg_duration_secs.total_cmp(&b.1.avg_duration_secs));
    if let Some((kind, breakdown)) = slowest {
        insights.push(format!(
            "Slowest stage on average: {} ({:.1}s)",
            kind, breakdown.avg_duration_secs
        ));
    }

    let perf_metric = |key: &str| -> Vec<f64> {
        ordered
            .iter()
            .filter_map(|r| r.stage(StageKind::Performance))
            .filter_map(|s| s.metric(key))
            .collect()
    };
    let startup = perf_metric("startup_ms_avg");
    if !startup.is_empty() {
        insights.push(format!("Average CLI startup {:.0} ms", mean(&startup)));
    }
    let memory = perf_metric("peak_memory_mb");
    if let Some(peak) = memory.iter().cloned().reduce(f64::max) {
        insights.push(format!("Highest observed peak memory {:.1} MB", peak));
    }
    insights
}

fn comprehensive(analysis: &mut HistoricalAnalysis, ordered: &[&RunResult]) {
    let trend = trend(ordered);
    let risk = assess_risk(ordered);

    if trend.trend == Trend::Declining {
        analysis.recommendations.push(format!(
            "Success rate is declining ({:.0}% recently vs {:.0}% before)",
            trend.recent_success_rate * 100.0,
            trend.older_success_rate * 100.0
        ));
    }
    if risk.level == RiskLevel::High {
        analysis.recommendations.push(format!(
            "High failure risk: {:.0}% of runs failed",
            risk.failure_rate * 100.0
        ));
    }

    analysis.performance_insights = performance_insights(analysis, ordered);
    analysis.quality_score = Some(quality_score(ordered));
    analysis.trend = Some(trend);
    analysis.risk = Some(risk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{RunConfiguration, RunKind};
    use crate::stages::StageResult;

    /// A finalized run with zero duration started `offset` seconds from epoch.
    fn run(id: &str, passed: bool, offset: i64, duration_secs: f64) -> RunResult {
        let mut run = RunResult::begin(id, RunKind::Comprehensive, None, RunConfiguration::default());
        let mut stage = StageResult::begin(StageKind::Cli);
        if passed {
            stage.passed = 5;
        } else {
            stage.failed = 2;
            stage.errors.push("help_flag: command not found: todo".into());
        }
        run.finalize(vec![stage.finish()]);
        run.started_at = DateTime::<Utc>::from_timestamp(1_700_000_000 + offset, 0).unwrap();
        run.duration_secs = duration_secs;
        run
    }

    #[test]
    fn test_empty_history() {
        let analysis = analyze(&[], AnalysisLevel::Comprehensive);
        assert_eq!(analysis.summary.total_runs, 0);
        assert_eq!(analysis.quality_score, Some(0.0));
        assert_eq!(analysis.risk.unwrap().level, RiskLevel::Unknown);
        assert_eq!(analysis.trend.unwrap().trend, Trend::InsufficientData);
        assert_eq!(analysis.recommendations.len(), 1);
    }

    #[test]
    fn test_quality_score_boundary() {
        let runs = vec![run("a", true, 0, 0.0)];
        let analysis = analyze(&runs, AnalysisLevel::Comprehensive);
        assert_eq!(analysis.quality_score, Some(100.0));

        let runs = vec![run("a", true, 0, 0.0), run("b", true, 1, 0.0)];
        assert_eq!(analyze(&runs, AnalysisLevel::Comprehensive).quality_score, Some(100.0));
    }

    #[test]
    fn test_trend_improving() {
        let mut runs = vec![run("old", false, 0, 1.0)];
        for i in 1..=5 {
            runs.push(run(&format!("new{}", i), true, i, 1.0));
        }
        // input order must not matter
        runs.reverse();
        let analysis = analyze(&runs, AnalysisLevel::Comprehensive);
        let trend = analysis.trend.unwrap();
        assert_eq!(trend.trend, Trend::Improving);
        assert_eq!(trend.recent_success_rate, 1.0);
        assert_eq!(trend.older_success_rate, 0.0);
    }

    #[test]
    fn test_trend_declining_and_stable() {
        let runs = vec![run("a", true, 0, 1.0), run("b", false, 1, 1.0)];
        let ordered: Vec<&RunResult> = runs.iter().collect();
        assert_eq!(trend(&ordered).trend, Trend::Declining);

        let runs = vec![run("a", true, 0, 1.0), run("b", true, 1, 1.0)];
        let ordered: Vec<&RunResult> = runs.iter().collect();
        assert_eq!(trend(&ordered).trend, Trend::Stable);

        let runs = vec![run("a", true, 0, 1.0)];
        let ordered: Vec<&RunResult> = runs.iter().collect();
        assert_eq!(trend(&ordered).trend, Trend::InsufficientData);
    }

    #[test]
    fn test_risk_levels() {
        let mut runs: Vec<RunResult> = (0..10).map(|i| run(&i.to_string(), true, i, 1.0)).collect();
        let ordered: Vec<&RunResult> = runs.iter().collect();
        assert_eq!(assess_risk(&ordered).level, RiskLevel::Low);
        assert_eq!(assess_risk(&ordered).reliability_score, 100.0);

        runs[0] = run("0", false, 0, 1.0);
        runs[1] = run("1", false, 1, 1.0);
        let ordered: Vec<&RunResult> = runs.iter().collect();
        assert_eq!(assess_risk(&ordered).level, RiskLevel::Medium);

        runs[2] = run("2", false, 2, 1.0);
        runs[3] = run("3", false, 3, 1.0);
        let ordered: Vec<&RunResult> = runs.iter().collect();
        let risk = assess_risk(&ordered);
        assert_eq!(risk.level, RiskLevel::High);
        assert!((risk.reliability_score - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_basic_recommendations() {
        let runs = vec![run("a", true, 0, 1.0), run("b", false, 1, 1.0)];
        let analysis = analyze(&runs, AnalysisLevel::Basic);
        assert_eq!(analysis.summary.success_rate, 0.5);
        assert_eq!(analysis.recommendations.len(), 2);
        assert!(analysis.durations.is_none());
        assert!(analysis.trend.is_none());
    }

    #[test]
    fn test_detailed_flags_slow_runs_and_patterns() {
        let runs = vec![
            run("a", true, 0, 10.0),
            run("b", true, 1, 10.0),
            run("c", true, 2, 10.0),
            run("slow", false, 3, 200.0),
        ];
        let analysis = analyze(&runs, AnalysisLevel::Detailed);
        assert_eq!(analysis.slow_runs, vec!["slow".to_string()]);
        let words: Vec<&str> = analysis.failure_patterns.iter().map(|p| p.word.as_str()).collect();
        assert_eq!(words, vec!["command", "found", "help_flag"]);
        assert_eq!(analysis.stage_breakdown[&StageKind::Cli].runs, 4);
        assert_eq!(analysis.stage_breakdown[&StageKind::Cli].failed, 1);
        assert!(analysis.quality_score.is_none());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("Detailed".parse::<AnalysisLevel>().unwrap(), AnalysisLevel::Detailed);
        assert!("verbose".parse::<AnalysisLevel>().is_err());
    }
}
