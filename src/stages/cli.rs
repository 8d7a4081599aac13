//! CLI stage: the project's command line must describe itself, reject bad
//! input cleanly and survive being run bare.

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    crash_marker, describe_failure, project_command, write_artifact, CheckOutcome, Checklist,
    Stage, StageError, StageKind, StageResult,
};
use crate::config::ToolchainConfig;
use crate::context::{ExecutionContext, ProjectRef};
use crate::process::{CommandOutput, CommandRunner, ProcessError};

const CHECKS: [&str; 5] = [
    "help_flag",
    "help_lists_usage",
    "version_flag",
    "invalid_argument",
    "no_arguments",
];

/// An option no real CLI should accept.
const BOGUS_OPTION: &str = "--autobuild-no-such-option";

/// Phrases argument parsers use when they reject an option.
const UNSUPPORTED_HINTS: [&str; 4] = [
    "unrecognized",
    "no such option",
    "unknown option",
    "invalid option",
];

pub struct CliStage {
    toolchain: ToolchainConfig,
    runner: Arc<dyn CommandRunner>,
}

impl CliStage {
    pub fn new(toolchain: ToolchainConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { toolchain, runner }
    }

    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        check: &str,
        project: &ProjectRef,
        args: &[&str],
    ) -> Result<CommandOutput, ProcessError> {
        // Entry point presence is checked once before any check runs.
        let Some(inv) = project_command(project, args, self.toolchain.command_timeout()) else {
            return Err(ProcessError::NotFound {
                program: "<no entrypoint>".to_string(),
            });
        };
        let output = self.runner.run(&inv).await?;
        checks.artifact(write_artifact(ctx, StageKind::Cli, check, &inv, &output));
        Ok(output)
    }

    fn crashed(&self, output: &CommandOutput) -> Option<String> {
        if output.timed_out {
            return Some(describe_failure(output));
        }
        crash_marker(output, &self.toolchain.crash_markers).map(|m| format!("crashed ({})", m))
    }

    fn help_outcome(&self, result: &Result<CommandOutput, ProcessError>) -> CheckOutcome {
        match result {
            Err(e) => CheckOutcome::Failed(e.to_string()),
            Ok(out) => {
                if let Some(crash) = self.crashed(out) {
                    CheckOutcome::Failed(format!("--help {}", crash))
                } else if !out.success() {
                    CheckOutcome::Failed(format!("--help {}", describe_failure(out)))
                } else if out.stdout.trim().is_empty() && out.stderr.trim().is_empty() {
                    CheckOutcome::Failed("--help printed nothing".to_string())
                } else {
                    CheckOutcome::Passed
                }
            }
        }
    }

    fn version_outcome(&self, result: Result<CommandOutput, ProcessError>) -> CheckOutcome {
        let out = match result {
            Ok(out) => out,
            Err(e) => return CheckOutcome::Failed(e.to_string()),
        };
        if let Some(crash) = self.crashed(&out) {
            return CheckOutcome::Failed(format!("--version {}", crash));
        }
        if out.success() {
            if out.stdout.trim().is_empty() && out.stderr.trim().is_empty() {
                return CheckOutcome::Failed("--version printed nothing".to_string());
            }
            return CheckOutcome::Passed;
        }
        let stderr = out.stderr.to_ascii_lowercase();
        if UNSUPPORTED_HINTS.iter().any(|h| stderr.contains(h)) {
            CheckOutcome::Skipped("--version not supported".to_string())
        } else {
            CheckOutcome::Failed(format!("--version {}", describe_failure(&out)))
        }
    }

    fn invalid_argument_outcome(&self, result: Result<CommandOutput, ProcessError>) -> CheckOutcome {
        let out = match result {
            Ok(out) => out,
            Err(e) => return CheckOutcome::Failed(e.to_string()),
        };
        if let Some(crash) = self.crashed(&out) {
            CheckOutcome::Failed(format!("{} on invalid argument", crash))
        } else if out.exit_code == Some(0) {
            CheckOutcome::Failed(format!("unknown option {} was accepted", BOGUS_OPTION))
        } else {
            CheckOutcome::Passed
        }
    }

    fn no_arguments_outcome(&self, result: Result<CommandOutput, ProcessError>) -> CheckOutcome {
        match result {
            Err(e) => CheckOutcome::Failed(e.to_string()),
            Ok(out) => match self.crashed(&out) {
                Some(crash) => CheckOutcome::Failed(format!("{} without arguments", crash)),
                None => CheckOutcome::Passed,
            },
        }
    }
}

#[async_trait]
impl Stage for CliStage {
    fn kind(&self) -> StageKind {
        StageKind::Cli
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageResult, StageError> {
        let mut checks = Checklist::new(StageKind::Cli);
        let project = match ctx.project.clone() {
            Some(p) if !p.entrypoint.is_empty() => p,
            other => {
                let reason = if other.is_some() {
                    "project has no entrypoint"
                } else {
                    "no project attached"
                };
                for check in CHECKS {
                    checks.record(check, CheckOutcome::Skipped(reason.to_string()));
                }
                return Ok(checks.finish());
            }
        };

        let mut help: Option<Result<CommandOutput, ProcessError>> = None;
        for check in CHECKS {
            if ctx.is_cancelled() {
                checks.record(check, CheckOutcome::cancelled());
                continue;
            }
            let outcome = match check {
                "help_flag" => {
                    let result = self.invoke(ctx, &mut checks, check, &project, &["--help"]).await;
                    if let Ok(out) = &result {
                        checks.metric("help_ms", out.elapsed.as_secs_f64() * 1000.0);
                    }
                    let outcome = self.help_outcome(&result);
                    help = Some(result);
                    outcome
                }
                "help_lists_usage" => match &help {
                    Some(Ok(out)) if out.success() => {
                        let text = format!("{}\n{}", out.stdout, out.stderr).to_ascii_lowercase();
                        if text.contains("usage") {
                            CheckOutcome::Passed
                        } else {
                            CheckOutcome::Failed("--help output has no usage line".to_string())
                        }
                    }
                    _ => CheckOutcome::Skipped("help output unavailable".to_string()),
                },
                "version_flag" => {
                    let result = self.invoke(ctx, &mut checks, check, &project, &["--version"]).await;
                    self.version_outcome(result)
                }
                "invalid_argument" => {
                    let result = self.invoke(ctx, &mut checks, check, &project, &[BOGUS_OPTION]).await;
                    self.invalid_argument_outcome(result)
                }
                _ => {
                    let result = self.invoke(ctx, &mut checks, check, &project, &[]).await;
                    self.no_arguments_outcome(result)
                }
            };
            checks.record(check, outcome);
        }

        let help_ok = matches!(&help, Some(Ok(out)) if out.success());
        ctx.note(StageKind::Cli, "help_ok", help_ok);
        Ok(checks.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{output, ScriptedRunner};
    use crate::stages::ExecutionStatus;

    fn ctx() -> ExecutionContext {
        let project = ProjectRef::new("/srv/todo").with_entrypoint(["todo"]);
        ExecutionContext::new("run", Some(project))
    }

    async fn run(runner: ScriptedRunner) -> StageResult {
        let stage = CliStage::new(ToolchainConfig::default(), Arc::new(runner));
        stage.execute(&mut ctx()).await.unwrap()
    }

    #[tokio::test]
    async fn test_well_behaved_cli_passes() {
        let runner = ScriptedRunner::new()
            .on("--version", output(0, "todo 1.2.0", ""))
            .on(BOGUS_OPTION, output(2, "", "error: unrecognized arguments"));
        let result = run(runner).await;
        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!(result.passed, 5);
        assert!(result.metric("help_ms").is_some());
    }

    #[tokio::test]
    async fn test_missing_binary_is_critical_shaped() {
        let result = run(ScriptedRunner::new().missing("todo")).await;
        assert_eq!(result.passed, 0);
        assert_eq!(result.failed, 4);
        assert_eq!(result.skipped, 1);
        assert!(result.errors[0].contains("command not found"));
    }

    #[tokio::test]
    async fn test_unsupported_version_is_skipped() {
        let runner = ScriptedRunner::new()
            .on("--version", output(2, "", "Error: No such option: --version"))
            .on(BOGUS_OPTION, output(2, "", "Error: No such option"));
        let result = run(runner).await;
        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!((result.passed, result.skipped), (4, 1));
    }

    #[tokio::test]
    async fn test_accepting_bogus_option_fails() {
        let result = run(ScriptedRunner::new()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(
            result.errors,
            vec![format!("invalid_argument: unknown option {} was accepted", BOGUS_OPTION)]
        );
    }

    #[tokio::test]
    async fn test_traceback_counts_as_crash() {
        let runner = ScriptedRunner::new()
            .on(BOGUS_OPTION, output(1, "", "Traceback (most recent call last):\n  ..."))
            .on("--", output(0, "usage: todo", ""))
            .on("todo", output(1, "", "Traceback (most recent call last):"));
        let result = run(runner).await;
        assert!(result
            .errors
            .iter()
            .any(|e| e.starts_with("invalid_argument: crashed")));
        assert!(result
            .errors
            .iter()
            .any(|e| e.starts_with("no_arguments: crashed")));
    }

    #[tokio::test]
    async fn test_help_without_usage_line() {
        let runner = ScriptedRunner::new()
            .on("--help", output(0, "Manage your todo list.", ""))
            .on(BOGUS_OPTION, output(2, "", "bad option"));
        let result = run(runner).await;
        assert!(result
            .errors
            .contains(&"help_lists_usage: --help output has no usage line".to_string()));
    }

    #[tokio::test]
    async fn test_project_without_entrypoint_skips() {
        let stage = CliStage::new(ToolchainConfig::default(), Arc::new(ScriptedRunner::new()));
        let mut ctx = ExecutionContext::new("run", Some(ProjectRef::new("/srv/empty")));
        let result = stage.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Skipped);
        assert_eq!(result.skipped, 5);
    }
}
