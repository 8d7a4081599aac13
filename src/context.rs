//! Per-run execution context shared across stages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stages::StageKind;

/// Environment variables captured into the snapshot.
const CAPTURED_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "SHELL",
    "VIRTUAL_ENV",
    "PYTHONPATH",
    "CI",
];

/// Reference to the built project under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRef {
    /// Correlation identifier used in persisted records.
    pub id: String,
    pub root: PathBuf,
    /// Distribution name as declared by the project manifest.
    pub name: Option<String>,
    /// Command prefix used to invoke the project's CLI.
    pub entrypoint: Vec<String>,
    /// Console scripts declared by the manifest.
    pub scripts: Vec<String>,
}

impl ProjectRef {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        Self {
            id,
            root,
            name: None,
            entrypoint: Vec::new(),
            scripts: Vec::new(),
        }
    }

    /// Inspect `pyproject.toml` (when present) for the name and console scripts.
    ///
    /// The default entrypoint is `<python> -m <import name>`.
    pub fn discover(root: &Path, python: &str) -> Result<Self> {
        let mut project = Self::new(root);
        let manifest = root.join("pyproject.toml");
        if manifest.exists() {
            let content = std::fs::read_to_string(&manifest)
                .with_context(|| format!("failed to read {}", manifest.display()))?;
            let doc: toml::Value = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", manifest.display()))?;

            project.name = doc
                .get("project")
                .and_then(|p| p.get("name"))
                .or_else(|| doc.get("tool").and_then(|t| t.get("poetry")).and_then(|p| p.get("name")))
                .and_then(|n| n.as_str())
                .map(str::to_string);

            let scripts = doc
                .get("project")
                .and_then(|p| p.get("scripts"))
                .or_else(|| {
                    doc.get("tool")
                        .and_then(|t| t.get("poetry"))
                        .and_then(|p| p.get("scripts"))
                })
                .and_then(|s| s.as_table());
            if let Some(table) = scripts {
                project.scripts = table.keys().cloned().collect();
            }
        }

        if let Some(module) = project.import_name() {
            project.entrypoint = vec![python.to_string(), "-m".to_string(), module];
        }
        Ok(project)
    }

    pub fn with_entrypoint<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = argv.into_iter().map(Into::into).collect();
        self
    }

    /// Importable module name derived from the distribution name.
    pub fn import_name(&self) -> Option<String> {
        self.name
            .as_ref()
            .map(|n| n.trim().replace(|c: char| c == '-' || c == '.', "_").to_ascii_lowercase())
            .filter(|n| !n.is_empty())
    }
}

/// Read-only snapshot of the host environment, captured once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub captured_at: DateTime<Utc>,
    pub os: String,
    pub arch: String,
    pub cpu_count: usize,
    pub working_dir: Option<PathBuf>,
    pub vars: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    pub fn capture() -> Self {
        let vars = CAPTURED_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
            .collect();
        Self {
            captured_at: Utc::now(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            working_dir: std::env::current_dir().ok(),
            vars,
        }
    }
}

/// Live, lock-free state of a run that outside callers may observe or poke.
#[derive(Debug, Default)]
pub struct RunHandle {
    cancelled: AtomicBool,
    current_stage: AtomicU8,
    completed: AtomicUsize,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_current_stage(&self, stage: StageKind) {
        self.current_stage.store(stage.rank(), Ordering::SeqCst);
    }

    pub fn current_stage(&self) -> Option<StageKind> {
        StageKind::from_rank(self.current_stage.load(Ordering::SeqCst))
    }

    pub fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

/// Mutable per-run state handed to each stage.
///
/// Cloning yields an independent copy: the project, environment snapshot and
/// run handle are shared, the metadata bag is not.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub project: Option<Arc<ProjectRef>>,
    pub started_at: DateTime<Utc>,
    pub environment: Arc<EnvironmentSnapshot>,
    artifact_root: Option<PathBuf>,
    handle: Arc<RunHandle>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new(run_id: impl Into<String>, project: Option<ProjectRef>) -> Self {
        Self {
            run_id: run_id.into(),
            project: project.map(Arc::new),
            started_at: Utc::now(),
            environment: Arc::new(EnvironmentSnapshot::capture()),
            artifact_root: None,
            handle: Arc::new(RunHandle::default()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_artifact_root(mut self, root: Option<PathBuf>) -> Self {
        self.artifact_root = root;
        self
    }

    /// Independent copy for a concurrently running stage.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn handle(&self) -> Arc<RunHandle> {
        Arc::clone(&self.handle)
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn current_stage(&self) -> Option<StageKind> {
        self.handle.current_stage()
    }

    pub fn set_current_stage(&self, stage: StageKind) {
        self.handle.set_current_stage(stage);
    }

    /// Directory for a stage's artifacts, when an artifact root is configured.
    pub fn artifact_dir(&self, stage: StageKind) -> Option<PathBuf> {
        self.artifact_root
            .as_ref()
            .map(|root| root.join(&self.run_id).join(stage.as_str()))
    }

    /// Record a note under the stage's namespace (`<stage>.<key>`).
    pub fn note(&mut self, stage: StageKind, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata
            .insert(format!("{}.{}", stage.as_str(), key), value.into());
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn get_note(&self, stage: StageKind, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(&format!("{}.{}", stage.as_str(), key))
    }
}
