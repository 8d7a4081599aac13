//! Run orchestration.
//!
//! The [`Framework`] orders enabled stages by rank, runs the Installation/CLI
//! prefix sequentially and the remaining stages concurrently (or everything
//! sequentially when asked), applies the skip/abort policy between stages and
//! enforces the per-stage wall-clock budget. Every run ends in exactly one
//! finalized [`RunResult`] that is persisted and appended to the history.

pub mod policy;
pub mod run;
pub mod state;

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AutobuildConfig;
use crate::context::{ExecutionContext, ProjectRef, RunHandle};
use crate::stages::{ExecutionStatus, RegistryError, Stage, StageKind, StageRegistry, StageResult};
use crate::storage::{self, ResultStore};

use self::policy::OnCritical;
use self::state::FrameworkState;

pub use self::run::{ConfigError, RunConfiguration, RunKind, RunResult, RunStatusSnapshot};
pub use self::state::FrameworkStats;

/// Stage kind reported for a concurrent task whose own kind was lost.
const FALLBACK_KIND: StageKind = StageKind::Functional;

/// Framework-level settings that are not part of a single run's configuration.
#[derive(Debug, Clone)]
pub struct FrameworkSettings {
    pub artifact_root: Option<PathBuf>,
    /// TTL for persisted run records.
    pub retention: Duration,
    /// Used by `run_single_stage`, which has no configuration of its own.
    pub defaults: RunConfiguration,
}

impl Default for FrameworkSettings {
    fn default() -> Self {
        Self {
            artifact_root: None,
            retention: Duration::from_secs(7 * 24 * 3600),
            defaults: RunConfiguration::default(),
        }
    }
}

impl FrameworkSettings {
    pub fn from_config(config: &AutobuildConfig) -> Self {
        Self {
            artifact_root: config.storage.artifact_root.clone(),
            retention: config.storage.retention(),
            defaults: config.run.clone(),
        }
    }
}

struct LiveRun {
    handle: Arc<RunHandle>,
    started_at: DateTime<Utc>,
}

struct Inner {
    registry: StageRegistry,
    store: Arc<dyn ResultStore>,
    settings: FrameworkSettings,
    state: Mutex<FrameworkState>,
    live: RwLock<HashMap<String, LiveRun>>,
}

/// Cheap to clone; clones share the registry, store and state.
#[derive(Clone)]
pub struct Framework {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("registry", &self.inner.registry)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Framework {
    pub fn new(
        registry: StageRegistry,
        store: Arc<dyn ResultStore>,
        settings: FrameworkSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                settings,
                state: Mutex::new(FrameworkState::default()),
                live: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn ResultStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn settings(&self) -> &FrameworkSettings {
        &self.inner.settings
    }

    /// Execute a run and return its finalized result. Never fails: faults are
    /// folded into the result, which is persisted either way.
    pub async fn run_comprehensive(
        &self,
        config: RunConfiguration,
        project: Option<ProjectRef>,
        run_id: Option<String>,
    ) -> RunResult {
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let project_id = project.as_ref().map(|p| p.id.clone());
        let mut run = RunResult::begin(run_id.clone(), config.kind(), project_id, config.clone());
        let ctx = ExecutionContext::new(run_id.clone(), project)
            .with_artifact_root(self.inner.settings.artifact_root.clone());

        self.inner.live.write().await.insert(
            run_id.clone(),
            LiveRun {
                handle: ctx.handle(),
                started_at: run.started_at,
            },
        );
        info!(
            run_id = %run_id,
            kind = %run.kind,
            stages = ?config.enabled_stages(),
            parallel = config.parallel_execution,
            timeout_minutes = config.timeout_minutes,
            max_retries = config.max_retries,
            "run started"
        );

        let mut results = Vec::new();
        let outcome = AssertUnwindSafe(self.schedule(&config, ctx, &mut results))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => run.finalize(results),
            Ok(Err(e)) => {
                warn!(run_id = %run_id, error = %e, "run aborted");
                run.finalize_with_fault(results, e);
            }
            Err(panic) => {
                let message = panic_message(panic);
                warn!(run_id = %run_id, error = %message, "run faulted");
                run.finalize_with_fault(results, message);
            }
        }
        // Recorded before the live entry goes so status lookups never miss it.
        self.inner.state.lock().await.record(run.clone());
        self.inner.live.write().await.remove(&run_id);

        info!(
            run_id = %run_id,
            status = %run.status,
            passed = run.counts.passed,
            failed = run.counts.failed,
            skipped = run.counts.skipped,
            duration_secs = run.duration_secs,
            "run finished"
        );

        self.persist(&run).await;
        self.write_reports(&run);
        run
    }

    /// Execute one stage against a caller-owned context, bypassing scheduling
    /// policy. Notes the stage records are kept in `ctx`.
    pub async fn run_single_stage(
        &self,
        kind: StageKind,
        ctx: &mut ExecutionContext,
    ) -> Result<StageResult, RegistryError> {
        let stage = self.inner.registry.resolve(kind)?;
        let defaults = &self.inner.settings.defaults;
        ctx.set_current_stage(kind);
        let (result, returned) = invoke(
            stage,
            ctx.clone(),
            defaults.stage_timeout(),
            defaults.timeout_minutes,
        )
        .await;
        if let Some(returned) = returned {
            *ctx = returned;
        }
        ctx.handle().mark_completed();
        info!(run_id = %ctx.run_id, stage = %kind, status = %result.status, "single stage finished");
        Ok(result)
    }

    /// Live runs first, then the in-process history, then the store.
    pub async fn get_run_status(&self, run_id: &str) -> Option<RunStatusSnapshot> {
        if let Some(live) = self.inner.live.read().await.get(run_id) {
            return Some(RunStatusSnapshot {
                run_id: run_id.to_string(),
                status: ExecutionStatus::Running,
                current_stage: live.handle.current_stage(),
                completed_stages: live.handle.completed(),
                started_at: live.started_at,
                ended_at: None,
                cancelled: live.handle.is_cancelled(),
            });
        }
        if let Some(run) = self.inner.state.lock().await.find(run_id) {
            return Some(RunStatusSnapshot::finished(run));
        }

        let store = Arc::clone(&self.inner.store);
        let id = run_id.to_string();
        match tokio::task::spawn_blocking(move || storage::load_run(store.as_ref(), &id)).await {
            Ok(Ok(found)) => found.as_ref().map(RunStatusSnapshot::finished),
            Ok(Err(e)) => {
                warn!(run_id, error = %e, "failed to look up persisted run");
                None
            }
            Err(e) => {
                warn!(run_id, error = %e, "run lookup task failed");
                None
            }
        }
    }

    /// Set the advisory cancellation flag of a live run.
    pub async fn cancel_run(&self, run_id: &str) -> bool {
        match self.inner.live.read().await.get(run_id) {
            Some(live) => {
                live.handle.cancel();
                info!(run_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Most recent runs of this process, newest first.
    pub async fn get_history(&self, limit: usize, status: Option<ExecutionStatus>) -> Vec<RunResult> {
        self.inner.state.lock().await.recent(limit, status)
    }

    pub async fn stats(&self) -> FrameworkStats {
        self.inner.state.lock().await.stats()
    }

    /// Remove artifact files older than `max_age` (and directories left empty)
    /// plus expired store records. Returns the number of items removed.
    pub async fn cleanup_old_artifacts(&self, max_age: Duration) -> usize {
        let root = self.inner.settings.artifact_root.clone();
        let store = Arc::clone(&self.inner.store);
        let task = tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            if let Some(root) = root.filter(|r| r.is_dir()) {
                let cutoff = SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
                removed += prune_dir(&root, cutoff, true);
            }
            match store.purge_expired() {
                Ok(n) => removed += n,
                Err(e) => warn!(error = %e, "failed to purge expired records"),
            }
            removed
        });
        match task.await {
            Ok(removed) => {
                info!(removed, max_age_secs = max_age.as_secs(), "cleanup finished");
                removed
            }
            Err(e) => {
                warn!(error = %e, "cleanup task failed");
                0
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    async fn schedule(
        &self,
        config: &RunConfiguration,
        ctx: ExecutionContext,
        results: &mut Vec<StageResult>,
    ) -> Result<(), ConfigError> {
        config.validate()?;
        let registry = &self.inner.registry;
        let stages: Vec<StageKind> = config
            .enabled_stages()
            .into_iter()
            .filter(|kind| {
                let known = registry.contains(*kind);
                if !known {
                    warn!(run_id = %ctx.run_id, stage = %kind, "no implementation registered, leaving stage out");
                }
                known
            })
            .collect();
        let budget = Budget {
            limit: config.stage_timeout(),
            minutes: config.timeout_minutes,
        };

        if !config.parallel_execution || stages.len() < 2 {
            self.run_sequential(&stages, ctx, budget, results).await;
        } else {
            self.run_staged(&stages, ctx, budget, results).await;
        }
        Ok(())
    }

    async fn run_sequential(
        &self,
        stages: &[StageKind],
        mut ctx: ExecutionContext,
        budget: Budget,
        results: &mut Vec<StageResult>,
    ) {
        for &kind in stages {
            if let Some(result) = self.skip_if_needed(kind, &ctx, results) {
                results.push(result);
                continue;
            }
            let result = self.run_stage(kind, &mut ctx, budget).await;
            let critical = policy::is_critical_failure(&result);
            results.push(result);
            if critical && policy::on_critical(kind) == OnCritical::Abort {
                warn!(run_id = %ctx.run_id, stage = %kind, "critical failure, remaining stages omitted");
                break;
            }
        }
    }

    async fn run_staged(
        &self,
        stages: &[StageKind],
        mut ctx: ExecutionContext,
        budget: Budget,
        results: &mut Vec<StageResult>,
    ) {
        for &kind in stages.iter().filter(|k| k.is_prefix()) {
            if let Some(result) = self.skip_if_needed(kind, &ctx, results) {
                results.push(result);
                continue;
            }
            let result = self.run_stage(kind, &mut ctx, budget).await;
            let critical = policy::is_critical_failure(&result);
            results.push(result);
            if critical {
                warn!(run_id = %ctx.run_id, stage = %kind, "critical failure in sequential prefix, run ends");
                return;
            }
        }

        // Skip rules apply to the prefix only; the group always launches.
        let mut group = JoinSet::new();
        for &kind in stages.iter().filter(|k| !k.is_prefix()) {
            let stage = match self.inner.registry.resolve(kind) {
                Ok(stage) => stage,
                Err(e) => {
                    results.push(StageResult::errored(kind, Utc::now(), e.to_string()));
                    continue;
                }
            };
            let fork = ctx.fork();
            fork.set_current_stage(kind);
            debug!(run_id = %ctx.run_id, stage = %kind, "launching concurrent stage");
            group.spawn(async move { invoke(stage, fork, budget.limit, budget.minutes).await.0 });
        }

        while let Some(joined) = group.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(run_id = %ctx.run_id, error = %e, "concurrent stage task lost");
                    StageResult::errored(FALLBACK_KIND, Utc::now(), join_message(e))
                }
            };
            info!(run_id = %ctx.run_id, stage = %result.stage, status = %result.status, "stage finished");
            ctx.handle().mark_completed();
            results.push(result);
        }
    }

    fn skip_if_needed(
        &self,
        kind: StageKind,
        ctx: &ExecutionContext,
        completed: &[StageResult],
    ) -> Option<StageResult> {
        let reason = policy::skip_reason(kind, completed)?;
        info!(run_id = %ctx.run_id, stage = %kind, %reason, "stage skipped");
        ctx.handle().mark_completed();
        Some(StageResult::skipped(kind, reason))
    }

    async fn run_stage(&self, kind: StageKind, ctx: &mut ExecutionContext, budget: Budget) -> StageResult {
        ctx.set_current_stage(kind);
        let result = match self.inner.registry.resolve(kind) {
            Ok(stage) => {
                let (result, returned) = invoke(stage, ctx.clone(), budget.limit, budget.minutes).await;
                if let Some(returned) = returned {
                    *ctx = returned;
                }
                result
            }
            Err(e) => StageResult::errored(kind, Utc::now(), e.to_string()),
        };
        info!(run_id = %ctx.run_id, stage = %kind, status = %result.status, "stage finished");
        ctx.handle().mark_completed();
        result
    }

    // -----------------------------------------------------------------------
    // After the run
    // -----------------------------------------------------------------------

    async fn persist(&self, run: &RunResult) {
        let store = Arc::clone(&self.inner.store);
        let retention = self.inner.settings.retention;
        let snapshot = run.clone();
        let task = tokio::task::spawn_blocking(move || {
            let record = storage::run_record(&snapshot, retention)?;
            store.store(record)
        });
        match task.await {
            Ok(Ok(())) => debug!(run_id = %run.run_id, "run persisted"),
            Ok(Err(e)) => warn!(run_id = %run.run_id, error = %e, "failed to persist run"),
            Err(e) => warn!(run_id = %run.run_id, error = %e, "persist task failed"),
        }
    }

    fn write_reports(&self, run: &RunResult) {
        for destination in &run.configuration.reports {
            match crate::report::write_to(destination, std::slice::from_ref(run), None) {
                Ok(()) => info!(path = %destination.path.display(), "report written"),
                Err(e) => warn!(path = %destination.path.display(), error = %e, "failed to write report"),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    limit: Duration,
    minutes: f64,
}

/// Run one stage on its own task so that a panic or a blown budget is
/// contained. Returns the context the stage finished with, when it finished.
async fn invoke(
    stage: Arc<dyn Stage>,
    mut ctx: ExecutionContext,
    limit: Duration,
    minutes: f64,
) -> (StageResult, Option<ExecutionContext>) {
    let kind = stage.kind();
    let started_at = Utc::now();
    let task = tokio::spawn(async move {
        let outcome = stage.execute(&mut ctx).await;
        (outcome, ctx)
    });
    let abort = task.abort_handle();

    match tokio::time::timeout(limit, task).await {
        Ok(Ok((Ok(result), ctx))) => (normalize(kind, result), Some(ctx)),
        Ok(Ok((Err(e), ctx))) => {
            warn!(stage = %kind, error = %e, "stage faulted");
            (StageResult::errored(kind, started_at, e.to_string()), Some(ctx))
        }
        Ok(Err(e)) => {
            warn!(stage = %kind, error = %e, "stage task failed");
            (StageResult::errored(kind, started_at, join_message(e)), None)
        }
        Err(_) => {
            abort.abort();
            warn!(stage = %kind, timeout_minutes = minutes, "stage timed out");
            (StageResult::timed_out(kind, started_at, minutes), None)
        }
    }
}

/// Enforce the result invariants regardless of what the stage returned.
fn normalize(kind: StageKind, mut result: StageResult) -> StageResult {
    if result.stage != kind {
        warn!(expected = %kind, reported = %result.stage, "stage reported a foreign kind");
        result.stage = kind;
    }
    if result.ended_at.is_none() || !result.status.is_terminal() {
        result.finish_at(Utc::now());
    }
    if result.failed > 0 && !result.status.is_failure() {
        result.status = ExecutionStatus::Failed;
    }
    if result.status == ExecutionStatus::Failed && result.failed == 0 && result.errors.is_empty() {
        result.errors.push("stage reported failure without detail".to_string());
    }
    result
}

fn join_message(e: tokio::task::JoinError) -> String {
    if e.is_panic() {
        format!("stage panicked: {}", panic_message(e.into_panic()))
    } else {
        "stage task was cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Delete files older than `cutoff` below `dir`, then `dir` itself if it
/// ended up empty (never the root).
fn prune_dir(dir: &Path, cutoff: SystemTime, is_root: bool) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "cannot read artifact directory");
            return 0;
        }
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            removed += prune_dir(&path, cutoff, false);
        } else if meta.modified().map(|m| m <= cutoff).unwrap_or(false) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove artifact"),
            }
        }
    }
    if !is_root {
        let empty = std::fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false);
        if empty && std::fs::remove_dir(dir).is_ok() {
            debug!(path = %dir.display(), "removed empty artifact directory");
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageError;
    use crate::storage::SqliteStore;

    struct Fixed {
        kind: StageKind,
        passed: u32,
        failed: u32,
        error: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl Stage for Fixed {
        fn kind(&self) -> StageKind {
            self.kind
        }

        async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageResult, StageError> {
            ctx.note(self.kind, "ran", true);
            let mut result = StageResult::begin(self.kind);
            result.passed = self.passed;
            result.failed = self.failed;
            result.errors.extend(self.error.map(str::to_string));
            Ok(result.finish())
        }
    }

    fn passing(kind: StageKind) -> Arc<dyn Stage> {
        Arc::new(Fixed { kind, passed: 3, failed: 0, error: None })
    }

    fn framework(registry: StageRegistry) -> Framework {
        let store = SqliteStore::in_memory().unwrap();
        Framework::new(registry, Arc::new(store), FrameworkSettings::default())
    }

    fn all_passing() -> StageRegistry {
        StageKind::ALL
            .into_iter()
            .fold(StageRegistry::empty(), |r, k| r.with(passing(k)))
    }

    #[tokio::test]
    async fn test_all_passing_run() {
        let fw = framework(all_passing());
        let run = fw
            .run_comprehensive(RunConfiguration::default(), None, Some("r-ok".into()))
            .await;
        assert_eq!(run.status, ExecutionStatus::Passed);
        assert_eq!(run.stages.len(), 5);
        assert_eq!(run.counts.passed, 15);
        assert_eq!(run.kind, RunKind::Comprehensive);
        assert!(run.ended_at.unwrap() >= run.started_at);

        let stats = fw.stats().await;
        assert_eq!((stats.total_runs, stats.total_passed), (1, 1));
        assert_eq!(fw.get_history(10, None).await.len(), 1);
        let persisted = storage::load_run(fw.store().as_ref(), "r-ok").unwrap();
        assert!(persisted.is_some());
    }

    #[tokio::test]
    async fn test_prefix_runs_before_group() {
        let fw = framework(all_passing());
        let run = fw
            .run_comprehensive(RunConfiguration::default(), None, None)
            .await;
        assert_eq!(run.stages[0].stage, StageKind::Installation);
        assert_eq!(run.stages[1].stage, StageKind::Cli);
        let mut rest: Vec<StageKind> = run.stages[2..].iter().map(|s| s.stage).collect();
        rest.sort();
        assert_eq!(rest, vec![StageKind::Functional, StageKind::Performance, StageKind::Recovery]);
    }

    #[tokio::test]
    async fn test_staged_prefix_critical_returns_early() {
        let registry = all_passing().with(Arc::new(Fixed {
            kind: StageKind::Cli,
            passed: 2,
            failed: 1,
            error: Some("help_flag: command not found: todo"),
        }));
        let fw = framework(registry);
        let run = fw.run_comprehensive(RunConfiguration::default(), None, None).await;
        assert_eq!(run.stages.len(), 2);
        assert_eq!(run.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_configuration_becomes_failed_run() {
        let fw = framework(all_passing());
        let config = RunConfiguration::default().with_timeout_minutes(-1.0);
        let run = fw.run_comprehensive(config, None, Some("bad".into())).await;
        assert_eq!(run.status, ExecutionStatus::Failed);
        assert!(run.stages.is_empty());
        assert!(run.combined_error.unwrap().starts_with("framework error: timeout_minutes"));
        assert!(fw.get_run_status("bad").await.is_some());
    }

    #[tokio::test]
    async fn test_unregistered_stages_are_left_out() {
        let registry = StageRegistry::empty().with(passing(StageKind::Cli));
        let fw = framework(registry);
        let run = fw.run_comprehensive(RunConfiguration::default(), None, None).await;
        assert_eq!(run.stages.len(), 1);
        assert_eq!(run.status, ExecutionStatus::Passed);
    }

    #[tokio::test]
    async fn test_run_single_stage_keeps_notes() {
        let fw = framework(all_passing());
        let mut ctx = ExecutionContext::new("single", None);
        let result = fw.run_single_stage(StageKind::Recovery, &mut ctx).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!(ctx.get_note(StageKind::Recovery, "ran"), Some(&serde_json::json!(true)));
        assert_eq!(ctx.handle().completed(), 1);

        let fw = framework(StageRegistry::empty());
        assert_eq!(
            fw.run_single_stage(StageKind::Cli, &mut ctx).await.err(),
            Some(RegistryError::Unregistered(StageKind::Cli))
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let fw = framework(all_passing());
        assert!(!fw.cancel_run("nope").await);
        assert!(fw.get_run_status("nope").await.is_none());
    }

    #[test]
    fn test_normalize_never_passes_with_failures() {
        let mut result = StageResult::begin(StageKind::Cli);
        result.failed = 1;
        result.status = ExecutionStatus::Passed;
        let result = normalize(StageKind::Cli, result);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.ended_at.is_some());

        let mut foreign = StageResult::begin(StageKind::Recovery);
        foreign.status = ExecutionStatus::Failed;
        let foreign = normalize(StageKind::Performance, foreign);
        assert_eq!(foreign.stage, StageKind::Performance);
        assert_eq!(foreign.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_prunes_old_artifacts() {
        let dir = tempfile::TempDir::new().unwrap();
        let stage_dir = dir.path().join("run-1").join("cli");
        std::fs::create_dir_all(&stage_dir).unwrap();
        std::fs::write(stage_dir.join("help_flag.log"), "x").unwrap();

        let settings = FrameworkSettings {
            artifact_root: Some(dir.path().to_path_buf()),
            ..FrameworkSettings::default()
        };
        let fw = Framework::new(all_passing(), Arc::new(SqliteStore::in_memory().unwrap()), settings);

        // Nothing is older than an hour yet.
        assert_eq!(fw.cleanup_old_artifacts(Duration::from_secs(3600)).await, 0);
        assert!(stage_dir.join("help_flag.log").exists());

        assert_eq!(fw.cleanup_old_artifacts(Duration::ZERO).await, 1);
        assert!(!dir.path().join("run-1").exists());
        assert!(dir.path().exists());
    }
}
