//! Functional stage: configured end-to-end scenarios plus the project's own
//! test suite.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use super::{
    crash_marker, describe_failure, project_command, write_artifact, CheckOutcome, Checklist,
    Stage, StageError, StageKind, StageResult,
};
use crate::config::{FunctionalConfig, Scenario, ToolchainConfig};
use crate::context::{ExecutionContext, ProjectRef};
use crate::process::{CommandRunner, Invocation};

const INPUT_PLACEHOLDER: &str = "{input}";

pub struct FunctionalStage {
    config: FunctionalConfig,
    toolchain: ToolchainConfig,
    runner: Arc<dyn CommandRunner>,
}

/// Check name for a scenario, safe to use as a file name.
fn scenario_check_name(scenario: &Scenario) -> String {
    let slug: String = scenario
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("scenario_{}", slug)
}

impl FunctionalStage {
    pub fn new(
        config: FunctionalConfig,
        toolchain: ToolchainConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            toolchain,
            runner,
        }
    }

    /// Build the scenario invocation. Input is substituted for `{input}` as a
    /// scratch file path, or piped on stdin when no placeholder is present.
    fn scenario_invocation(
        &self,
        project: &ProjectRef,
        scenario: &Scenario,
        scratch: &Path,
        check: &str,
    ) -> Result<Option<Invocation>, std::io::Error> {
        let uses_placeholder = scenario.args.iter().any(|a| a.contains(INPUT_PLACEHOLDER));
        let mut args = scenario.args.clone();
        if let (Some(input), true) = (&scenario.input, uses_placeholder) {
            let path = scratch.join(format!("{}.input", check));
            std::fs::write(&path, input)?;
            let rendered = path.display().to_string();
            for arg in &mut args {
                *arg = arg.replace(INPUT_PLACEHOLDER, &rendered);
            }
        }
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let Some(mut inv) = project_command(project, &argv, self.toolchain.command_timeout()) else {
            return Ok(None);
        };
        if let (Some(input), false) = (&scenario.input, uses_placeholder) {
            inv = inv.stdin(input.clone());
        }
        Ok(Some(inv))
    }

    async fn run_scenario(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
        scenario: &Scenario,
        scratch: &Path,
        check: &str,
    ) -> Result<CheckOutcome, StageError> {
        let Some(inv) = self.scenario_invocation(project, scenario, scratch, check)? else {
            return Ok(CheckOutcome::Skipped("project has no entrypoint".to_string()));
        };
        let out = match self.runner.run(&inv).await {
            Ok(out) => out,
            Err(e) => return Ok(CheckOutcome::Failed(e.to_string())),
        };
        checks.artifact(write_artifact(ctx, StageKind::Functional, check, &inv, &out));

        if out.timed_out {
            return Ok(CheckOutcome::Failed(describe_failure(&out)));
        }
        if let Some(marker) = crash_marker(&out, &self.toolchain.crash_markers) {
            return Ok(CheckOutcome::Failed(format!("crashed ({})", marker)));
        }
        if out.exit_code != Some(scenario.expect_exit) {
            return Ok(CheckOutcome::Failed(format!(
                "expected exit code {}, got {}",
                scenario.expect_exit,
                describe_failure(&out)
            )));
        }
        if let Some(expected) = &scenario.expect_stdout {
            if !out.stdout.contains(expected.as_str()) {
                return Ok(CheckOutcome::Failed(format!("stdout missing '{}'", expected)));
            }
        }
        Ok(CheckOutcome::Passed)
    }

    async fn run_test_suite(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
        command: &[String],
    ) -> CheckOutcome {
        let Some((program, args)) = command.split_first() else {
            return CheckOutcome::Skipped("empty test command".to_string());
        };
        let inv = Invocation::new(program.clone(), self.toolchain.install_timeout())
            .args(args.iter().cloned())
            .cwd(&project.root);
        match self.runner.run(&inv).await {
            Ok(out) => {
                checks.artifact(write_artifact(ctx, StageKind::Functional, "test_suite", &inv, &out));
                if out.success() {
                    CheckOutcome::Passed
                } else {
                    CheckOutcome::Failed(format!("test suite {}", describe_failure(&out)))
                }
            }
            Err(e) => CheckOutcome::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl Stage for FunctionalStage {
    fn kind(&self) -> StageKind {
        StageKind::Functional
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageResult, StageError> {
        let mut checks = Checklist::new(StageKind::Functional);
        let Some(project) = ctx.project.clone() else {
            checks.record("scenarios", CheckOutcome::Skipped("no project attached".to_string()));
            return Ok(checks.finish());
        };
        if self.config.scenarios.is_empty() && self.config.test_command.is_none() {
            checks.record(
                "scenarios",
                CheckOutcome::Skipped("no functional scenarios configured".to_string()),
            );
            return Ok(checks.finish());
        }

        let scratch = TempDir::new()?;
        let mut passed = 0u64;
        for scenario in &self.config.scenarios {
            let check = scenario_check_name(scenario);
            if ctx.is_cancelled() {
                checks.record(&check, CheckOutcome::cancelled());
                continue;
            }
            let outcome = self
                .run_scenario(ctx, &mut checks, &project, scenario, scratch.path(), &check)
                .await?;
            if outcome == CheckOutcome::Passed {
                passed += 1;
            }
            checks.record(&check, outcome);
        }
        checks.metric("scenarios_run", self.config.scenarios.len() as u64);
        checks.metric("scenarios_passed", passed);

        if let Some(command) = &self.config.test_command {
            let outcome = if ctx.is_cancelled() {
                CheckOutcome::cancelled()
            } else {
                self.run_test_suite(ctx, &mut checks, &project, command).await
            };
            checks.record("test_suite", outcome);
        }

        ctx.note(StageKind::Functional, "scenarios_passed", passed);
        Ok(checks.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{output, ScriptedRunner};
    use crate::stages::ExecutionStatus;

    fn scenario(name: &str, args: &[&str]) -> Scenario {
        Scenario {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            input: None,
            expect_exit: 0,
            expect_stdout: None,
        }
    }

    fn ctx() -> ExecutionContext {
        let project = ProjectRef::new("/srv/todo").with_entrypoint(["todo"]);
        ExecutionContext::new("run", Some(project))
    }

    fn stage(config: FunctionalConfig, runner: Arc<ScriptedRunner>) -> FunctionalStage {
        FunctionalStage::new(config, ToolchainConfig::default(), runner)
    }

    #[tokio::test]
    async fn test_nothing_configured_skips() {
        let stage = stage(FunctionalConfig::default(), Arc::new(ScriptedRunner::new()));
        let result = stage.execute(&mut ctx()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Skipped);
        assert_eq!(result.skipped, 1);
    }

    #[tokio::test]
    async fn test_scenarios_check_exit_and_stdout() {
        let mut add = scenario("Add item", &["add", "milk"]);
        add.expect_stdout = Some("added".to_string());
        let mut remove = scenario("remove", &["remove", "eggs"]);
        remove.expect_exit = 1;

        let runner = Arc::new(
            ScriptedRunner::new()
                .on("add milk", output(0, "added milk", ""))
                .on("remove eggs", output(0, "removed", "")),
        );
        let config = FunctionalConfig {
            scenarios: vec![add, remove],
            test_command: None,
        };
        let result = stage(config, runner).execute(&mut ctx()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!((result.passed, result.failed), (1, 1));
        assert!(result.errors[0].starts_with("scenario_remove: expected exit code 1"));
        assert_eq!(result.metric("scenarios_passed"), Some(1.0));
    }

    #[tokio::test]
    async fn test_input_placeholder_becomes_scratch_file() {
        let mut import = scenario("import", &["import", "--file", "{input}"]);
        import.input = Some("milk\neggs\n".to_string());
        let runner = Arc::new(ScriptedRunner::new());
        let config = FunctionalConfig {
            scenarios: vec![import],
            test_command: None,
        };
        stage(config, runner.clone()).execute(&mut ctx()).await.unwrap();

        let commands = runner.commands();
        assert!(commands[0].contains("scenario_import.input"));
        assert!(!commands[0].contains(INPUT_PLACEHOLDER));
    }

    #[tokio::test]
    async fn test_suite_failure_is_reported() {
        let runner = Arc::new(ScriptedRunner::new().on("pytest", output(1, "", "2 failed, 8 passed")));
        let config = FunctionalConfig {
            scenarios: Vec::new(),
            test_command: Some(vec!["pytest".to_string(), "-q".to_string()]),
        };
        let result = stage(config, runner).execute(&mut ctx()).await.unwrap();
        assert_eq!(
            result.errors,
            vec!["test_suite: test suite exit code 1: 2 failed, 8 passed".to_string()]
        );
    }

    #[test]
    fn test_check_names_are_file_safe() {
        assert_eq!(scenario_check_name(&scenario("Add item/v2", &[])), "scenario_add_item_v2");
    }
}
