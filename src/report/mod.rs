//! Report rendering: JSON for machines, text and Markdown for people.
//!
//! Pure rendering over finished runs; nothing here mutates its inputs.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::HistoricalAnalysis;
use crate::scheduler::RunResult;
use crate::stages::StageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Text,
    Markdown,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Text => "txt",
            ReportFormat::Markdown => "md",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown report format '{0}' (expected json, text or markdown)")]
pub struct ParseFormatError(String);

impl std::str::FromStr for ReportFormat {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "text" | "txt" => Ok(ReportFormat::Text),
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            other => Err(ParseFormatError(other.to_string())),
        }
    }
}

/// Where a run's report is written after it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDestination {
    pub format: ReportFormat,
    pub path: PathBuf,
}

pub fn render(
    format: ReportFormat,
    runs: &[RunResult],
    analysis: Option<&HistoricalAnalysis>,
) -> Result<String> {
    match format {
        ReportFormat::Json => render_json(runs, analysis),
        ReportFormat::Text => Ok(render_text(runs, analysis)),
        ReportFormat::Markdown => Ok(render_markdown(runs, analysis)),
    }
}

/// Structured document: metadata, per-run details and optional analysis.
pub fn render_json(runs: &[RunResult], analysis: Option<&HistoricalAnalysis>) -> Result<String> {
    let mut doc = serde_json::json!({
        "metadata": {
            "generator": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "generated_at": Utc::now(),
            "run_count": runs.len(),
        },
        "runs": runs,
    });
    if let Some(analysis) = analysis {
        doc["analysis"] = serde_json::to_value(analysis)?;
    }
    serde_json::to_string_pretty(&doc).context("failed to serialize report")
}

/// One-line summary of a run.
pub fn format_summary(run: &RunResult) -> String {
    let mut summary = format!(
        "run {} [{}] {}: {} passed, {} failed, {} skipped in {:.1}s",
        run.run_id,
        run.kind,
        run.status,
        run.counts.passed,
        run.counts.failed,
        run.counts.skipped,
        run.duration_secs,
    );
    summary.push_str(&format!(
        " (success {:.1}%, coverage {:.1}%, score {:.1})",
        run.metrics.success_rate * 100.0,
        run.metrics.coverage_percentage,
        run.metrics.performance_score,
    ));
    if let Some(project) = &run.project_id {
        summary.push_str(&format!(", project: {}", project));
    }
    summary
}

/// One-line summary of a stage.
pub fn format_stage(stage: &StageResult) -> String {
    format!(
        "{:<13} {:<8} {:>3} passed {:>3} failed {:>3} skipped  {:>7.2}s",
        stage.stage.as_str(),
        stage.status.as_str(),
        stage.passed,
        stage.failed,
        stage.skipped,
        stage.duration_secs,
    )
}

pub fn render_text(runs: &[RunResult], analysis: Option<&HistoricalAnalysis>) -> String {
    let mut out = String::new();
    if runs.is_empty() {
        out.push_str("No runs.\n");
    }
    for run in runs {
        let _ = writeln!(out, "{}", format_summary(run));
        for stage in &run.stages {
            let _ = writeln!(out, "  {}", format_stage(stage));
        }
        if let Some(error) = &run.combined_error {
            let _ = writeln!(out, "  errors: {}", error);
        }
        out.push('\n');
    }
    if let Some(analysis) = analysis {
        out.push_str(&format_analysis(analysis));
    }
    out
}

/// Multi-line narrative of an analysis.
pub fn format_analysis(analysis: &HistoricalAnalysis) -> String {
    let mut out = String::new();
    let s = &analysis.summary;
    let _ = writeln!(
        out,
        "Analysis ({:?}): {} runs, {} passed, {} failed, success rate {:.1}%",
        analysis.level,
        s.total_runs,
        s.passed_runs,
        s.failed_runs,
        s.success_rate * 100.0
    );
    if let Some(score) = analysis.quality_score {
        let _ = writeln!(out, "  quality score: {:.1}/100", score);
    }
    if let Some(trend) = &analysis.trend {
        let _ = writeln!(out, "  trend: {:?}", trend.trend);
    }
    if let Some(risk) = &analysis.risk {
        let _ = writeln!(
            out,
            "  risk: {:?} (reliability {:.1})",
            risk.level, risk.reliability_score
        );
    }
    if !analysis.failure_patterns.is_empty() {
        let words: Vec<String> = analysis
            .failure_patterns
            .iter()
            .map(|p| format!("{} ({})", p.word, p.count))
            .collect();
        let _ = writeln!(out, "  failure patterns: {}", words.join(", "));
    }
    for insight in &analysis.performance_insights {
        let _ = writeln!(out, "  - {}", insight);
    }
    for rec in &analysis.recommendations {
        let _ = writeln!(out, "  * {}", rec);
    }
    out
}

fn md_escape(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

pub fn render_markdown(runs: &[RunResult], analysis: Option<&HistoricalAnalysis>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Test report\n");
    let _ = writeln!(out, "Generated {} by {} {}\n", Utc::now().to_rfc3339(), env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    if !runs.is_empty() {
        out.push_str("| Run | Kind | Status | Passed | Failed | Skipped | Duration | Success |\n");
        out.push_str("|---|---|---|---:|---:|---:|---:|---:|\n");
        for run in runs {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} | {:.1}s | {:.1}% |",
                run.run_id,
                run.kind,
                run.status,
                run.counts.passed,
                run.counts.failed,
                run.counts.skipped,
                run.duration_secs,
                run.metrics.success_rate * 100.0
            );
        }
        out.push('\n');
    }

    for run in runs {
        let _ = writeln!(out, "## Run {}\n", run.run_id);
        out.push_str("| Stage | Status | Passed | Failed | Skipped | Duration |\n");
        out.push_str("|---|---|---:|---:|---:|---:|\n");
        for stage in &run.stages {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {:.2}s |",
                stage.stage, stage.status, stage.passed, stage.failed, stage.skipped, stage.duration_secs
            );
        }
        let errors: Vec<String> = run
            .stages
            .iter()
            .flat_map(|s| s.errors.iter().map(move |e| format!("- **{}**: {}", s.stage, md_escape(e))))
            .collect();
        if !errors.is_empty() {
            out.push_str("\n### Errors\n\n");
            for line in errors {
                let _ = writeln!(out, "{}", line);
            }
        }
        out.push('\n');
    }

    if let Some(analysis) = analysis {
        out.push_str("## Analysis\n\n");
        let s = &analysis.summary;
        let _ = writeln!(
            out,
            "- Runs: {} ({} passed, {} failed)\n- Success rate: {:.1}%",
            s.total_runs,
            s.passed_runs,
            s.failed_runs,
            s.success_rate * 100.0
        );
        if let Some(score) = analysis.quality_score {
            let _ = writeln!(out, "- Quality score: {:.1}/100", score);
        }
        if let Some(trend) = &analysis.trend {
            let _ = writeln!(out, "- Trend: {:?}", trend.trend);
        }
        if let Some(risk) = &analysis.risk {
            let _ = writeln!(out, "- Risk: {:?}", risk.level);
        }
        if !analysis.recommendations.is_empty() {
            out.push_str("\n### Recommendations\n\n");
            for rec in &analysis.recommendations {
                let _ = writeln!(out, "- {}", md_escape(rec));
            }
        }
    }
    out
}

/// Render and write a report, creating parent directories as needed.
pub fn write_to(
    destination: &ReportDestination,
    runs: &[RunResult],
    analysis: Option<&HistoricalAnalysis>,
) -> Result<()> {
    let body = render(destination.format, runs, analysis)?;
    write_file(&destination.path, &body)
}

fn write_file(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, body).with_context(|| format!("failed to write report {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{analyze, AnalysisLevel};
    use crate::scheduler::{RunConfiguration, RunKind};
    use crate::stages::StageKind;

    fn sample_run() -> RunResult {
        let mut run = RunResult::begin("r-1", RunKind::Comprehensive, Some("todo".into()), RunConfiguration::default());
        let mut install = StageResult::begin(StageKind::Installation);
        install.passed = 7;
        let mut cli = StageResult::begin(StageKind::Cli);
        cli.passed = 4;
        cli.failed = 1;
        cli.errors.push("invalid_argument: option | was accepted".into());
        run.finalize(vec![install.finish(), cli.finish()]);
        run
    }

    #[test]
    fn test_format_summary() {
        let summary = format_summary(&sample_run());
        assert!(summary.starts_with("run r-1 [comprehensive] failed: 11 passed, 1 failed, 0 skipped"));
        assert!(summary.ends_with("project: todo"));
    }

    #[test]
    fn test_json_report_structure() {
        let runs = vec![sample_run()];
        let analysis = analyze(&runs, AnalysisLevel::Comprehensive);
        let doc: serde_json::Value =
            serde_json::from_str(&render_json(&runs, Some(&analysis)).unwrap()).unwrap();
        assert_eq!(doc["metadata"]["run_count"], 1);
        assert_eq!(doc["runs"][0]["status"], "failed");
        assert_eq!(doc["runs"][0]["stages"][1]["stage"], "cli");
        assert!(doc["analysis"]["quality_score"].is_number());

        let doc: serde_json::Value = serde_json::from_str(&render_json(&runs, None).unwrap()).unwrap();
        assert!(doc.get("analysis").is_none());
    }

    #[test]
    fn test_markdown_escapes_tables() {
        let md = render_markdown(&[sample_run()], None);
        assert!(md.contains("| r-1 | comprehensive | failed | 11 | 1 | 0 |"));
        assert!(md.contains("- **cli**: invalid_argument: option \\| was accepted"));
    }

    #[test]
    fn test_text_includes_stages_and_analysis() {
        let runs = vec![sample_run()];
        let analysis = analyze(&runs, AnalysisLevel::Basic);
        let text = render_text(&runs, Some(&analysis));
        assert!(text.contains("installation"));
        assert!(text.contains("errors: cli: invalid_argument"));
        assert!(text.contains("Analysis (Basic): 1 runs"));
    }

    #[test]
    fn test_write_to_creates_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = ReportDestination {
            format: ReportFormat::Markdown,
            path: dir.path().join("reports").join("latest.md"),
        };
        write_to(&dest, &[sample_run()], None).unwrap();
        let body = std::fs::read_to_string(&dest.path).unwrap();
        assert!(body.starts_with("# Test report"));
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("MD".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert!("html".parse::<ReportFormat>().is_err());
    }
}
