//! autobuild -- staged functional testing for agent-built projects.
//!
//! This crate provides the stage implementations, the run scheduler, result
//! aggregation and historical analysis, report rendering, and the SQLite-backed
//! result store.

pub mod analysis;
pub mod config;
pub mod context;
pub mod process;
pub mod report;
pub mod scheduler;
pub mod stages;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use crate::config::AutobuildConfig;
use crate::process::{CommandRunner, SystemRunner};
use crate::scheduler::{Framework, FrameworkSettings};
use crate::stages::StageRegistry;
use crate::storage::SqliteStore;

/// Build a framework with the built-in stages, real subprocesses and the
/// configured database.
pub fn framework(config: &AutobuildConfig) -> Result<Framework> {
    tracing::info!(db = %config.storage.database_path.display(), "opening result store");
    let store = SqliteStore::open(&config.storage.database_path)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    Ok(Framework::new(
        StageRegistry::builtin(config, runner),
        Arc::new(store),
        FrameworkSettings::from_config(config),
    ))
}
