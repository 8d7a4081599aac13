//! TOML configuration for autobuild.
//!
//! Layered the same way for every entry point: an explicit path, then the
//! `AUTOBUILD_CONFIG` environment variable, then `./autobuild.toml`, then
//! compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::RunConfiguration;

pub const CONFIG_ENV: &str = "AUTOBUILD_CONFIG";
pub const LOCAL_CONFIG: &str = "autobuild.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutobuildConfig {
    #[serde(default)]
    pub run: RunConfiguration,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub functional: FunctionalConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AutobuildConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .run
            .validate()
            .with_context(|| format!("invalid [run] section in {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: `$AUTOBUILD_CONFIG`, `./autobuild.toml`, defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "AUTOBUILD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where results and artifacts live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Root directory for per-run check artifacts. Empty disables artifacts.
    pub artifact_root: Option<PathBuf>,
    /// Retention for persisted run results.
    pub retention_days: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/autobuild.db"),
            artifact_root: Some(PathBuf::from("data/artifacts")),
            retention_days: 7,
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

// ---------------------------------------------------------------------------
// Toolchain
// ---------------------------------------------------------------------------

/// Interpreter and per-command limits used by the stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub python: String,
    /// Budget for creating the isolated install environment.
    pub venv_timeout_secs: u64,
    /// Budget for installing the project into it.
    pub install_timeout_secs: u64,
    /// Budget for any single check command.
    pub command_timeout_secs: u64,
    /// Output fragments that mark an invocation as crashed.
    pub crash_markers: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            venv_timeout_secs: 120,
            install_timeout_secs: 300,
            command_timeout_secs: 60,
            crash_markers: vec![
                "Traceback (most recent call last)".to_string(),
                "panicked at".to_string(),
                "Segmentation fault".to_string(),
            ],
        }
    }
}

impl ToolchainConfig {
    pub fn venv_timeout(&self) -> Duration {
        Duration::from_secs(self.venv_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Functional
// ---------------------------------------------------------------------------

/// One end-to-end scenario run against the project's CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// Arguments after the entrypoint. `{input}` is replaced by the path of a
    /// scratch file holding `input`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub expect_exit: i32,
    #[serde(default)]
    pub expect_stdout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionalConfig {
    pub scenarios: Vec<Scenario>,
    /// Project test suite command (e.g. `["pytest", "-q"]`), run in the project root.
    pub test_command: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Performance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Number of cold starts measured for startup latency.
    pub startup_runs: u32,
    pub max_startup_ms: u64,
    pub max_peak_memory_mb: u64,
    pub sample_interval_ms: u64,
    /// Arguments for the sampled workload; defaults to `--help`.
    pub workload: Option<Vec<String>>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            startup_runs: 3,
            max_startup_ms: 2000,
            max_peak_memory_mb: 512,
            sample_interval_ms: 50,
            workload: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// How long the interrupted workload runs before it is killed.
    pub interrupt_after_ms: u64,
    /// Arguments for the interrupted workload; defaults to `--help`.
    pub workload: Option<Vec<String>>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interrupt_after_ms: 500,
            workload: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable logs.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportFormat;
    use crate::stages::StageKind;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AutobuildConfig::default();

        assert_eq!(cfg.run.stages.len(), 5);
        assert_eq!(cfg.run.timeout_minutes, 30.0);
        assert!(cfg.run.parallel_execution);
        assert_eq!(cfg.run.max_retries, 0);

        assert_eq!(cfg.storage.database_path, PathBuf::from("data/autobuild.db"));
        assert_eq!(cfg.storage.retention_days, 7);
        assert_eq!(cfg.storage.retention(), Duration::from_secs(604_800));

        assert_eq!(cfg.toolchain.python, "python3");
        assert_eq!(cfg.toolchain.install_timeout(), Duration::from_secs(300));
        assert!(cfg.functional.scenarios.is_empty());
        assert_eq!(cfg.performance.startup_runs, 3);
        assert_eq!(cfg.recovery.interrupt_after_ms, 500);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[run]
stages = ["recovery", "installation", "cli"]
timeout_minutes = 5.5
parallel_execution = false
max_retries = 2
reports = [{ format = "markdown", path = "out/report.md" }]

[storage]
database_path = "/var/lib/autobuild/results.db"
retention_days = 14

[toolchain]
python = "/usr/bin/python3.12"
command_timeout_secs = 15

[[functional.scenarios]]
name = "add-item"
args = ["add", "--file", "{input}"]
input = "milk"
expect_stdout = "added"

[performance]
max_startup_ms = 800

[logging]
level = "debug"
json = true
"#;

        let cfg: AutobuildConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            cfg.run.enabled_stages(),
            vec![StageKind::Installation, StageKind::Cli, StageKind::Recovery]
        );
        assert_eq!(cfg.run.timeout_minutes, 5.5);
        assert!(!cfg.run.parallel_execution);
        assert_eq!(cfg.run.max_retries, 2);
        assert_eq!(cfg.run.reports[0].format, ReportFormat::Markdown);
        assert_eq!(cfg.storage.retention_days, 14);
        assert_eq!(cfg.toolchain.python, "/usr/bin/python3.12");
        assert_eq!(cfg.toolchain.command_timeout_secs, 15);
        assert_eq!(cfg.toolchain.install_timeout_secs, 300);
        assert_eq!(cfg.functional.scenarios.len(), 1);
        assert_eq!(cfg.functional.scenarios[0].expect_exit, 0);
        assert_eq!(cfg.performance.max_startup_ms, 800);
        assert_eq!(cfg.performance.startup_runs, 3);
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AutobuildConfig = toml::from_str("").unwrap();
        let defaults = AutobuildConfig::default();
        assert_eq!(cfg.storage.database_path, defaults.storage.database_path);
        assert_eq!(cfg.run.stages, defaults.run.stages);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("autobuild.toml");
        std::fs::write(&path, "[run]\ntimeout_minutes = 2\n").unwrap();

        let cfg = AutobuildConfig::load(&path).unwrap();
        assert_eq!(cfg.run.timeout_minutes, 2.0);
    }

    #[test]
    fn test_load_rejects_non_positive_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("autobuild.toml");
        std::fs::write(&path, "[run]\ntimeout_minutes = 0\n").unwrap();

        assert!(AutobuildConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(AutobuildConfig::load(Path::new("/nonexistent/autobuild.toml")).is_err());
    }
}
