//! Performance stage: startup latency, resource footprint under a sampled
//! workload, and behaviour under concurrent invocations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;

use super::{
    describe_failure, project_command, write_artifact, CheckOutcome, Checklist, Stage, StageError,
    StageKind, StageResult,
};
use crate::analysis::stats::mean;
use crate::config::{PerformanceConfig, ToolchainConfig};
use crate::context::{ExecutionContext, ProjectRef};
use crate::process::CommandRunner;

const CHECKS: [&str; 3] = ["startup_latency", "resource_usage", "concurrent_invocations"];
const CONCURRENCY: usize = 4;

pub struct PerformanceStage {
    config: PerformanceConfig,
    toolchain: ToolchainConfig,
    runner: Arc<dyn CommandRunner>,
}

impl PerformanceStage {
    pub fn new(
        config: PerformanceConfig,
        toolchain: ToolchainConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            toolchain,
            runner,
        }
    }

    fn workload(&self) -> Vec<&str> {
        match &self.config.workload {
            Some(args) => args.iter().map(String::as_str).collect(),
            None => vec!["--help"],
        }
    }

    async fn startup_latency(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
    ) -> CheckOutcome {
        let runs = self.config.startup_runs.max(1);
        let mut samples_ms = Vec::with_capacity(runs as usize);
        for attempt in 0..runs {
            let Some(inv) = project_command(project, &["--help"], self.toolchain.command_timeout())
            else {
                return CheckOutcome::Skipped("project has no entrypoint".to_string());
            };
            let out = match self.runner.run(&inv).await {
                Ok(out) => out,
                Err(e) => return CheckOutcome::Failed(e.to_string()),
            };
            if attempt == 0 {
                checks.artifact(write_artifact(ctx, StageKind::Performance, "startup_latency", &inv, &out));
            }
            if !out.success() {
                return CheckOutcome::Failed(format!("startup run {} {}", attempt + 1, describe_failure(&out)));
            }
            samples_ms.push(out.elapsed.as_secs_f64() * 1000.0);
        }

        let avg = mean(&samples_ms);
        let max = samples_ms.iter().cloned().fold(0.0_f64, f64::max);
        checks.metric("startup_ms_avg", avg);
        checks.metric("startup_ms_max", max);

        if avg > self.config.max_startup_ms as f64 {
            CheckOutcome::Failed(format!(
                "average startup {:.0} ms exceeds {} ms",
                avg, self.config.max_startup_ms
            ))
        } else {
            CheckOutcome::Passed
        }
    }

    async fn resource_usage(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
    ) -> CheckOutcome {
        let Some(inv) = project_command(project, &self.workload(), self.toolchain.command_timeout())
        else {
            return CheckOutcome::Skipped("project has no entrypoint".to_string());
        };
        let inv = inv.sampled(Duration::from_millis(self.config.sample_interval_ms.max(1)));
        let out = match self.runner.run(&inv).await {
            Ok(out) => out,
            Err(e) => return CheckOutcome::Failed(e.to_string()),
        };
        checks.artifact(write_artifact(ctx, StageKind::Performance, "resource_usage", &inv, &out));
        if out.timed_out {
            return CheckOutcome::Failed(format!("workload {}", describe_failure(&out)));
        }

        let Some(usage) = out.resources else {
            checks.warn("resource_usage: workload exited before it could be sampled");
            return CheckOutcome::Passed;
        };
        checks.metric("peak_memory_mb", usage.peak_memory_mb());
        checks.metric("avg_cpu_percent", usage.avg_cpu_percent as f64);

        if usage.peak_memory_mb() > self.config.max_peak_memory_mb as f64 {
            CheckOutcome::Failed(format!(
                "peak memory {:.1} MB exceeds {} MB",
                usage.peak_memory_mb(),
                self.config.max_peak_memory_mb
            ))
        } else {
            CheckOutcome::Passed
        }
    }

    async fn concurrent_invocations(
        &self,
        checks: &mut Checklist,
        project: &ProjectRef,
    ) -> CheckOutcome {
        let invocations: Vec<_> = (0..CONCURRENCY)
            .filter_map(|_| project_command(project, &["--help"], self.toolchain.command_timeout()))
            .collect();
        if invocations.is_empty() {
            return CheckOutcome::Skipped("project has no entrypoint".to_string());
        }

        let started = Instant::now();
        let outputs = join_all(invocations.iter().map(|inv| self.runner.run(inv))).await;
        checks.metric("concurrent_wall_ms", started.elapsed().as_secs_f64() * 1000.0);

        let failures: Vec<String> = outputs
            .into_iter()
            .enumerate()
            .filter_map(|(i, result)| match result {
                Ok(out) if out.success() => None,
                Ok(out) => Some(format!("#{} {}", i + 1, describe_failure(&out))),
                Err(e) => Some(format!("#{} {}", i + 1, e)),
            })
            .collect();
        if failures.is_empty() {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed(format!(
                "{} of {} concurrent runs failed: {}",
                failures.len(),
                CONCURRENCY,
                failures.join("; ")
            ))
        }
    }
}

#[async_trait]
impl Stage for PerformanceStage {
    fn kind(&self) -> StageKind {
        StageKind::Performance
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageResult, StageError> {
        let mut checks = Checklist::new(StageKind::Performance);
        let Some(project) = ctx.project.clone() else {
            for check in CHECKS {
                checks.record(check, CheckOutcome::Skipped("no project attached".to_string()));
            }
            return Ok(checks.finish());
        };

        for check in CHECKS {
            if ctx.is_cancelled() {
                checks.record(check, CheckOutcome::cancelled());
                continue;
            }
            let outcome = match check {
                "startup_latency" => self.startup_latency(ctx, &mut checks, &project).await,
                "resource_usage" => self.resource_usage(ctx, &mut checks, &project).await,
                _ => self.concurrent_invocations(&mut checks, &project).await,
            };
            checks.record(check, outcome);
        }
        Ok(checks.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{output, ScriptedRunner};
    use crate::process::ResourceUsage;
    use crate::stages::ExecutionStatus;

    fn ctx() -> ExecutionContext {
        let project = ProjectRef::new("/srv/todo").with_entrypoint(["todo"]);
        ExecutionContext::new("run", Some(project))
    }

    fn stage(config: PerformanceConfig, runner: Arc<ScriptedRunner>) -> PerformanceStage {
        PerformanceStage::new(config, ToolchainConfig::default(), runner)
    }

    #[tokio::test]
    async fn test_fast_cli_passes_with_metrics() {
        let runner = Arc::new(ScriptedRunner::new());
        let result = stage(PerformanceConfig::default(), runner.clone())
            .execute(&mut ctx())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!(result.passed, 3);
        assert_eq!(result.metric("startup_ms_avg"), Some(5.0));
        // 3 startup runs, 1 sampled workload, 4 concurrent
        assert_eq!(runner.commands().len(), 8);
    }

    #[tokio::test]
    async fn test_slow_startup_fails() {
        let mut slow = output(0, "usage: todo", "");
        slow.elapsed = Duration::from_secs(3);
        let runner = Arc::new(ScriptedRunner::new().on("--help", slow));
        let result = stage(PerformanceConfig::default(), runner)
            .execute(&mut ctx())
            .await
            .unwrap();
        assert!(result.errors[0].starts_with("startup_latency: average startup 3000 ms exceeds 2000 ms"));
    }

    #[tokio::test]
    async fn test_memory_ceiling() {
        let mut heavy = output(0, "", "");
        heavy.resources = Some(ResourceUsage {
            peak_memory_kb: 1024 * 1024,
            avg_cpu_percent: 80.0,
            samples: 10,
        });
        let runner = Arc::new(ScriptedRunner::new().on("bulk-import", heavy));
        let config = PerformanceConfig {
            workload: Some(vec!["bulk-import".to_string()]),
            ..PerformanceConfig::default()
        };
        let result = stage(config, runner).execute(&mut ctx()).await.unwrap();
        assert_eq!(result.metric("peak_memory_mb"), Some(1024.0));
        assert_eq!(
            result.errors,
            vec!["resource_usage: peak memory 1024.0 MB exceeds 512 MB".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unsampled_workload_warns() {
        let result = stage(PerformanceConfig::default(), Arc::new(ScriptedRunner::new()))
            .execute(&mut ctx())
            .await
            .unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("could not be sampled")));
    }
}
