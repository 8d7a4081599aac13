//! Installation stage: can the project be installed into a clean environment,
//! imported, invoked, and removed again?

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::info;

use super::{
    describe_failure, write_artifact, CheckOutcome, Checklist, Stage, StageError, StageKind,
    StageResult,
};
use crate::config::ToolchainConfig;
use crate::context::{ExecutionContext, ProjectRef};
use crate::process::{CommandOutput, CommandRunner, Invocation, ProcessError};

const MANIFESTS: [&str; 3] = ["pyproject.toml", "setup.py", "setup.cfg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallCheck {
    PackageStructure,
    Dependencies,
    CleanInstall,
    Import,
    CliEntrypoint,
    EntryPointRegistration,
    Uninstall,
}

impl InstallCheck {
    const ORDER: [InstallCheck; 7] = [
        InstallCheck::PackageStructure,
        InstallCheck::Dependencies,
        InstallCheck::CleanInstall,
        InstallCheck::Import,
        InstallCheck::CliEntrypoint,
        InstallCheck::EntryPointRegistration,
        InstallCheck::Uninstall,
    ];

    fn name(self) -> &'static str {
        match self {
            InstallCheck::PackageStructure => "package_structure",
            InstallCheck::Dependencies => "dependencies",
            InstallCheck::CleanInstall => "clean_install",
            InstallCheck::Import => "import",
            InstallCheck::CliEntrypoint => "cli_entrypoint",
            InstallCheck::EntryPointRegistration => "entry_point_registration",
            InstallCheck::Uninstall => "uninstall",
        }
    }
}

/// Isolated environment for one stage execution. Dropping it removes the
/// environment from disk, whichever way the stage exits.
#[derive(Default)]
struct InstallSession {
    dir: Option<TempDir>,
    installed: bool,
}

impl InstallSession {
    fn venv(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.path().join("venv"))
    }
}

fn venv_bin(venv: &Path, exe: &str) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join(format!("{}.exe", exe))
    } else {
        venv.join("bin").join(exe)
    }
}

pub struct InstallationStage {
    toolchain: ToolchainConfig,
    runner: Arc<dyn CommandRunner>,
}

impl InstallationStage {
    pub fn new(toolchain: ToolchainConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { toolchain, runner }
    }

    async fn run_logged(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        check: InstallCheck,
        invocation: Invocation,
    ) -> Result<CommandOutput, ProcessError> {
        let output = self.runner.run(&invocation).await?;
        checks.artifact(write_artifact(
            ctx,
            StageKind::Installation,
            check.name(),
            &invocation,
            &output,
        ));
        Ok(output)
    }

    fn check_structure(&self, project: &ProjectRef) -> CheckOutcome {
        let root = &project.root;
        if !root.is_dir() {
            return CheckOutcome::Failed(format!(
                "project root {} is not a directory",
                root.display()
            ));
        }
        if !MANIFESTS.iter().any(|m| root.join(m).exists()) {
            return CheckOutcome::Failed("no pyproject.toml, setup.py or setup.cfg found".to_string());
        }
        if let Some(module) = project.import_name() {
            let candidates = [
                root.join(&module),
                root.join("src").join(&module),
                root.join(format!("{}.py", module)),
            ];
            if !candidates.iter().any(|p| p.exists()) {
                return CheckOutcome::Failed(format!(
                    "package '{}' not found in project root or src/",
                    module
                ));
            }
        }
        CheckOutcome::Passed
    }

    /// Count declared dependencies, rejecting malformed declarations.
    fn declared_dependencies(&self, root: &Path) -> Result<Option<usize>, String> {
        let pyproject = root.join("pyproject.toml");
        if pyproject.exists() {
            let content = std::fs::read_to_string(&pyproject)
                .map_err(|e| format!("cannot read pyproject.toml: {}", e))?;
            let doc: toml::Value =
                toml::from_str(&content).map_err(|e| format!("invalid pyproject.toml: {}", e))?;
            if let Some(deps) = doc.get("project").and_then(|p| p.get("dependencies")) {
                let list = deps
                    .as_array()
                    .ok_or_else(|| "[project].dependencies is not an array".to_string())?;
                for dep in list {
                    match dep.as_str() {
                        Some(spec) if !spec.trim().is_empty() => {}
                        _ => return Err(format!("invalid dependency entry: {}", dep)),
                    }
                }
                return Ok(Some(list.len()));
            }
        }

        let requirements = root.join("requirements.txt");
        if requirements.exists() {
            let content = std::fs::read_to_string(&requirements)
                .map_err(|e| format!("cannot read requirements.txt: {}", e))?;
            let mut count = 0;
            for (idx, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
                    continue;
                }
                if !line.starts_with(|c: char| c.is_ascii_alphanumeric()) {
                    return Err(format!(
                        "requirements.txt line {} is not a requirement: {}",
                        idx + 1,
                        line
                    ));
                }
                count += 1;
            }
            return Ok(Some(count));
        }

        Ok(None)
    }

    async fn clean_install(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
        session: &mut InstallSession,
    ) -> CheckOutcome {
        let dir = match tempfile::Builder::new().prefix("autobuild-venv-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return CheckOutcome::Failed(format!(
                    "installation failed: cannot create isolated environment: {}",
                    e
                ))
            }
        };
        let venv = dir.path().join("venv");
        session.dir = Some(dir);

        let create = Invocation::new(&self.toolchain.python, self.toolchain.venv_timeout())
            .args(["-m", "venv"])
            .arg(venv.display().to_string());
        match self.run_logged(ctx, checks, InstallCheck::CleanInstall, create).await {
            Ok(out) if out.success() => {}
            Ok(out) => {
                return CheckOutcome::Failed(format!(
                    "installation failed: environment creation {}",
                    describe_failure(&out)
                ))
            }
            Err(e) => return CheckOutcome::Failed(format!("installation failed: {}", e)),
        }

        let install = Invocation::new(
            venv_bin(&venv, "python").display().to_string(),
            self.toolchain.install_timeout(),
        )
        .args([
            "-m",
            "pip",
            "install",
            "--disable-pip-version-check",
            "--no-input",
        ])
        .arg(project.root.display().to_string());
        match self.run_logged(ctx, checks, InstallCheck::CleanInstall, install).await {
            Ok(out) if out.success() => {
                session.installed = true;
                CheckOutcome::Passed
            }
            Ok(out) => CheckOutcome::Failed(format!(
                "installation failed: pip install {}",
                describe_failure(&out)
            )),
            Err(e) => CheckOutcome::Failed(format!("installation failed: {}", e)),
        }
    }

    async fn check_import(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
        session: &InstallSession,
    ) -> CheckOutcome {
        let (Some(venv), true) = (session.venv(), session.installed) else {
            return CheckOutcome::Skipped("clean install did not complete".to_string());
        };
        let Some(module) = project.import_name() else {
            return CheckOutcome::Skipped("package name unknown".to_string());
        };
        let inv = Invocation::new(
            venv_bin(&venv, "python").display().to_string(),
            self.toolchain.command_timeout(),
        )
        .arg("-c")
        .arg(format!("import {}", module));
        match self.run_logged(ctx, checks, InstallCheck::Import, inv).await {
            Ok(out) if out.success() => CheckOutcome::Passed,
            Ok(out) => CheckOutcome::Failed(format!(
                "import {} failed: {}",
                module,
                describe_failure(&out)
            )),
            Err(e) => CheckOutcome::Failed(e.to_string()),
        }
    }

    async fn check_cli_entrypoint(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
        session: &InstallSession,
    ) -> CheckOutcome {
        let Some(script) = project.scripts.first() else {
            return CheckOutcome::Skipped("no console scripts declared".to_string());
        };
        let (Some(venv), true) = (session.venv(), session.installed) else {
            return CheckOutcome::Skipped("clean install did not complete".to_string());
        };
        let inv = Invocation::new(
            venv_bin(&venv, script).display().to_string(),
            self.toolchain.command_timeout(),
        )
        .arg("--help");
        match self.run_logged(ctx, checks, InstallCheck::CliEntrypoint, inv).await {
            Ok(out) if out.success() => CheckOutcome::Passed,
            Ok(out) => CheckOutcome::Failed(format!(
                "'{} --help' {}",
                script,
                describe_failure(&out)
            )),
            Err(e) => CheckOutcome::Failed(e.to_string()),
        }
    }

    fn check_registration(&self, project: &ProjectRef, session: &InstallSession) -> CheckOutcome {
        if project.scripts.is_empty() {
            return CheckOutcome::Skipped("no console scripts declared".to_string());
        }
        let (Some(venv), true) = (session.venv(), session.installed) else {
            return CheckOutcome::Skipped("clean install did not complete".to_string());
        };
        let missing: Vec<&str> = project
            .scripts
            .iter()
            .filter(|s| !venv_bin(&venv, s).exists())
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed(format!(
                "console scripts not registered: {}",
                missing.join(", ")
            ))
        }
    }

    async fn check_uninstall(
        &self,
        ctx: &ExecutionContext,
        checks: &mut Checklist,
        project: &ProjectRef,
        session: &InstallSession,
    ) -> CheckOutcome {
        let (Some(venv), true) = (session.venv(), session.installed) else {
            return CheckOutcome::Skipped("clean install did not complete".to_string());
        };
        let Some(name) = project.name.as_deref() else {
            return CheckOutcome::Skipped("package name unknown".to_string());
        };
        let inv = Invocation::new(
            venv_bin(&venv, "python").display().to_string(),
            self.toolchain.command_timeout(),
        )
        .args(["-m", "pip", "uninstall", "-y", name]);
        match self.run_logged(ctx, checks, InstallCheck::Uninstall, inv).await {
            Ok(out) if out.success() => CheckOutcome::Passed,
            Ok(out) => CheckOutcome::Failed(format!("uninstall {}", describe_failure(&out))),
            Err(e) => CheckOutcome::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl Stage for InstallationStage {
    fn kind(&self) -> StageKind {
        StageKind::Installation
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageResult, StageError> {
        let mut checks = Checklist::new(StageKind::Installation);
        let Some(project) = ctx.project.clone() else {
            for check in InstallCheck::ORDER {
                checks.record(check.name(), CheckOutcome::Skipped("no project attached".into()));
            }
            return Ok(checks.finish());
        };

        info!(run_id = %ctx.run_id, project = %project.id, "installation stage starting");
        let mut session = InstallSession::default();
        let mut install_secs = None;

        for check in InstallCheck::ORDER {
            if ctx.is_cancelled() {
                checks.record(check.name(), CheckOutcome::cancelled());
                continue;
            }
            let outcome = match check {
                InstallCheck::PackageStructure => self.check_structure(&project),
                InstallCheck::Dependencies => match self.declared_dependencies(&project.root) {
                    Ok(Some(count)) => {
                        checks.metric("dependency_count", count as u64);
                        CheckOutcome::Passed
                    }
                    Ok(None) => {
                        checks.warn("no dependency declarations found");
                        CheckOutcome::Passed
                    }
                    Err(e) => CheckOutcome::Failed(e),
                },
                InstallCheck::CleanInstall => {
                    let start = Instant::now();
                    let outcome = self.clean_install(ctx, &mut checks, &project, &mut session).await;
                    install_secs = Some(start.elapsed().as_secs_f64());
                    outcome
                }
                InstallCheck::Import => self.check_import(ctx, &mut checks, &project, &session).await,
                InstallCheck::CliEntrypoint => {
                    self.check_cli_entrypoint(ctx, &mut checks, &project, &session).await
                }
                InstallCheck::EntryPointRegistration => self.check_registration(&project, &session),
                InstallCheck::Uninstall => {
                    self.check_uninstall(ctx, &mut checks, &project, &session).await
                }
            };
            checks.record(check.name(), outcome);
        }

        if let Some(secs) = install_secs {
            checks.metric("install_secs", secs);
        }
        ctx.note(StageKind::Installation, "installed", session.installed);
        drop(session);

        Ok(checks.finish())
    }
}
