//! Recovery stage: the project must cope with bad input, being killed
//! mid-run, and a stripped-down environment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    crash_marker, describe_failure, project_command, write_artifact, CheckOutcome, Checklist,
    Stage, StageError, StageKind, StageResult,
};
use crate::config::{RecoveryConfig, ToolchainConfig};
use crate::context::{ExecutionContext, ProjectRef};
use crate::process::{CommandOutput, CommandRunner, Invocation, ProcessError};

const CHECKS: [&str; 4] = [
    "invalid_input",
    "interrupted_run",
    "rerun_consistency",
    "minimal_environment",
];

const GARBAGE_INPUT: &str = "\u{fffd}\u{0}{{not valid]]\n\t\u{7f}";
const MISSING_PATH: &str = "/nonexistent/autobuild/input.dat";

pub struct RecoveryStage {
    config: RecoveryConfig,
    toolchain: ToolchainConfig,
    runner: Arc<dyn CommandRunner>,
}

impl RecoveryStage {
    pub fn new(
        config: RecoveryConfig,
        toolchain: ToolchainConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            toolchain,
            runner,
        }
    }

    fn help(&self, project: &ProjectRef) -> Option<Invocation> {
        project_command(project, &["--help"], self.toolchain.command_timeout())
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        check: &str,
        inv: &Invocation,
    ) -> Result<CommandOutput, ProcessError> {
        let out = self.runner.run(inv).await?;
        checks.artifact(write_artifact(ctx, StageKind::Recovery, check, inv, &out));
        Ok(out)
    }

    fn crash(&self, out: &CommandOutput) -> Option<String> {
        crash_marker(out, &self.toolchain.crash_markers).map(|m| format!("crashed ({})", m))
    }

    async fn invalid_input(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
    ) -> CheckOutcome {
        let Some(inv) = project_command(project, &[MISSING_PATH], self.toolchain.command_timeout())
        else {
            return CheckOutcome::Skipped("project has no entrypoint".to_string());
        };
        let inv = inv.stdin(GARBAGE_INPUT);
        match self.run(ctx, checks, "invalid_input", &inv).await {
            Err(e) => CheckOutcome::Failed(e.to_string()),
            Ok(out) if out.timed_out => {
                CheckOutcome::Failed(format!("hung on invalid input: {}", describe_failure(&out)))
            }
            Ok(out) => match self.crash(&out) {
                Some(crash) => CheckOutcome::Failed(format!("{} on invalid input", crash)),
                None => CheckOutcome::Passed,
            },
        }
    }

    async fn interrupted_run(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
    ) -> CheckOutcome {
        let workload: Vec<&str> = match &self.config.workload {
            Some(args) => args.iter().map(String::as_str).collect(),
            None => vec!["--help"],
        };
        let (Some(interrupted), Some(follow_up)) = (
            project_command(project, &workload, self.toolchain.command_timeout()),
            self.help(project),
        ) else {
            return CheckOutcome::Skipped("project has no entrypoint".to_string());
        };

        let interrupted =
            interrupted.with_timeout(Duration::from_millis(self.config.interrupt_after_ms));
        match self.runner.run(&interrupted).await {
            Ok(out) => checks.metric("interrupted", if out.timed_out { 1.0 } else { 0.0 }),
            Err(e) => return CheckOutcome::Failed(e.to_string()),
        }

        match self.run(ctx, checks, "interrupted_run", &follow_up).await {
            Err(e) => CheckOutcome::Failed(e.to_string()),
            Ok(out) if out.success() => CheckOutcome::Passed,
            Ok(out) => CheckOutcome::Failed(format!(
                "unusable after interruption: {}",
                describe_failure(&out)
            )),
        }
    }

    async fn rerun_consistency(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
    ) -> CheckOutcome {
        let Some(inv) = self.help(project) else {
            return CheckOutcome::Skipped("project has no entrypoint".to_string());
        };
        let first = match self.runner.run(&inv).await {
            Ok(out) => out,
            Err(e) => return CheckOutcome::Failed(e.to_string()),
        };
        let second = match self.run(ctx, checks, "rerun_consistency", &inv).await {
            Ok(out) => out,
            Err(e) => return CheckOutcome::Failed(e.to_string()),
        };
        if first.exit_code != second.exit_code {
            CheckOutcome::Failed(format!(
                "exit code changed between identical runs ({:?} then {:?})",
                first.exit_code, second.exit_code
            ))
        } else if first.stdout != second.stdout {
            CheckOutcome::Failed("output differs between identical runs".to_string())
        } else {
            CheckOutcome::Passed
        }
    }

    async fn minimal_environment(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
    ) -> CheckOutcome {
        let Some(inv) = self.help(project) else {
            return CheckOutcome::Skipped("project has no entrypoint".to_string());
        };
        let mut inv = inv.clear_env().env("LANG", "C");
        if let Some(path) = ctx.environment.vars.get("PATH") {
            inv = inv.env("PATH", path.clone());
        }
        match self.run(ctx, checks, "minimal_environment", &inv).await {
            Err(e) => CheckOutcome::Failed(e.to_string()),
            Ok(out) => match self.crash(&out) {
                Some(crash) => CheckOutcome::Failed(format!("{} with minimal environment", crash)),
                None if out.success() => CheckOutcome::Passed,
                None => CheckOutcome::Failed(format!(
                    "minimal environment: {}",
                    describe_failure(&out)
                )),
            },
        }
    }
}

#[async_trait]
impl Stage for RecoveryStage {
    fn kind(&self) -> StageKind {
        StageKind::Recovery
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageResult, StageError> {
        let mut checks = Checklist::new(StageKind::Recovery);
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
                "invalid_input" => self.invalid_input(ctx, &mut checks, &project).await,
                "interrupted_run" => self.interrupted_run(ctx, &mut checks, &project).await,
                "rerun_consistency" => self.rerun_consistency(ctx, &mut checks, &project).await,
                _ => self.minimal_environment(ctx, &mut checks, &project).await,
            };
            checks.record(check, outcome);
        }
        Ok(checks.finish())
    }
}
