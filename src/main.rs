use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use autobuild::analysis::{self, AnalysisLevel};
use autobuild::config::AutobuildConfig;
use autobuild::context::{ExecutionContext, ProjectRef};
use autobuild::report::{self, ReportDestination, ReportFormat};
use autobuild::scheduler::{Framework, RunResult};
use autobuild::stages::{ExecutionStatus, StageKind};
use autobuild::storage;

#[derive(Parser)]
#[command(
    name = "autobuild",
    about = "Staged functional testing for agent-built projects",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $AUTOBUILD_CONFIG, then ./autobuild.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the staged test pipeline against a project
    Run {
        /// Project root directory
        #[arg(long)]
        project: PathBuf,

        /// Comma-separated stages to enable (default: all)
        #[arg(long, value_delimiter = ',')]
        stages: Vec<StageKind>,

        /// Run every stage sequentially
        #[arg(long)]
        sequential: bool,

        /// Per-stage wall-clock budget in minutes
        #[arg(long)]
        timeout_minutes: Option<f64>,

        /// Use this run identifier instead of a generated one
        #[arg(long)]
        run_id: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run a single stage, bypassing scheduling policy
    Stage {
        /// installation, cli, functional, performance or recovery
        kind: StageKind,

        /// Project root directory
        #[arg(long)]
        project: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List persisted runs, newest first
    History {
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Only runs with this overall status
        #[arg(long)]
        status: Option<ExecutionStatus>,
    },

    /// Analyze persisted run history
    Analyze {
        #[arg(long, default_value = "comprehensive")]
        level: AnalysisLevel,

        #[arg(long, default_value = "100")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Render a report over persisted runs
    Report {
        #[arg(long, default_value = "text")]
        format: ReportFormat,

        #[arg(long, default_value = "20")]
        limit: usize,

        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Embed a comprehensive analysis
        #[arg(long)]
        with_analysis: bool,
    },

    /// Prune old artifacts and expired results
    Cleanup {
        #[arg(long, default_value = "7")]
        max_age_days: u64,
    },
}

fn init_tracing(config: &AutobuildConfig, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn exit_for(status: ExecutionStatus) -> ExitCode {
    if status.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn persisted_runs(
    framework: &Framework,
    limit: usize,
    status: Option<ExecutionStatus>,
) -> Result<Vec<RunResult>> {
    let store = framework.store();
    tokio::task::spawn_blocking(move || storage::load_runs(store.as_ref(), limit, status))
        .await
        .context("history query task failed")?
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AutobuildConfig::load(path)?,
        None => AutobuildConfig::load_or_default(),
    };
    init_tracing(&config, cli.log_json);

    let framework = autobuild::framework(&config)?;

    match cli.command {
        Commands::Run {
            project,
            stages,
            sequential,
            timeout_minutes,
            run_id,
            json,
        } => {
            let project = ProjectRef::discover(&project, &config.toolchain.python)?;
            let mut run_config = config.run.clone();
            if !stages.is_empty() {
                run_config = run_config.with_stages(stages);
            }
            if sequential {
                run_config = run_config.sequential();
            }
            if let Some(minutes) = timeout_minutes {
                run_config = run_config.with_timeout_minutes(minutes);
            }

            tracing::info!(project = %project.root.display(), "starting run");
            let run = framework
                .run_comprehensive(run_config, Some(project), run_id)
                .await;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print!("{}", report::render_text(std::slice::from_ref(&run), None));
            }
            Ok(exit_for(run.status))
        }
        Commands::Stage { kind, project, json } => {
            let project = ProjectRef::discover(&project, &config.toolchain.python)?;
            let mut ctx = ExecutionContext::new(uuid::Uuid::new_v4().to_string(), Some(project))
                .with_artifact_root(config.storage.artifact_root.clone());
            let result = framework.run_single_stage(kind, &mut ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", report::format_stage(&result));
                for error in &result.errors {
                    println!("  error: {}", error);
                }
                for warning in &result.warnings {
                    println!("  warning: {}", warning);
                }
            }
            Ok(exit_for(result.status))
        }
        Commands::History { limit, status } => {
            let runs = persisted_runs(&framework, limit, status).await?;
            if runs.is_empty() {
                println!("No runs found.");
            }
            for run in &runs {
                println!("{} {}", run.started_at.format("%Y-%m-%d %H:%M:%S"), report::format_summary(run));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Analyze { level, limit, json } => {
            let runs = persisted_runs(&framework, limit, None).await?;
            let analysis = analysis::analyze(&runs, level);
            if json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                print!("{}", report::format_analysis(&analysis));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report {
            format,
            limit,
            output,
            with_analysis,
        } => {
            let runs = persisted_runs(&framework, limit, None).await?;
            let analysis =
                with_analysis.then(|| analysis::analyze(&runs, AnalysisLevel::Comprehensive));
            match output {
                Some(path) => {
                    let destination = ReportDestination { format, path };
                    report::write_to(&destination, &runs, analysis.as_ref())?;
                    println!("Report written to {}", destination.path.display());
                }
                None => print!("{}", report::render(format, &runs, analysis.as_ref())?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cleanup { max_age_days } => {
            let max_age = Duration::from_secs(max_age_days * 24 * 60 * 60);
            let removed = framework.cleanup_old_artifacts(max_age).await;
            println!("Removed {} item(s).", removed);
            Ok(ExitCode::SUCCESS)
        }
    }
}
