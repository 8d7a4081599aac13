//! Maps stage kinds to their implementations.
//!
//! The registry is a plain value handed to the scheduler at construction, so
//! tests can substitute any stage with a scripted one.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::{cli, functional, installation, performance, recovery, Stage, StageKind};
use crate::config::AutobuildConfig;
use crate::process::CommandRunner;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no stage registered for '{0}'")]
    Unregistered(StageKind),
}

#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The five built-in stages, all driving the project through `runner`.
    pub fn builtin(config: &AutobuildConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let toolchain = config.toolchain.clone();
        Self::empty()
            .with(Arc::new(installation::InstallationStage::new(
                toolchain.clone(),
                Arc::clone(&runner),
            )))
            .with(Arc::new(cli::CliStage::new(toolchain.clone(), Arc::clone(&runner))))
            .with(Arc::new(functional::FunctionalStage::new(
                config.functional.clone(),
                toolchain.clone(),
                Arc::clone(&runner),
            )))
            .with(Arc::new(performance::PerformanceStage::new(
                config.performance.clone(),
                toolchain.clone(),
                Arc::clone(&runner),
            )))
            .with(Arc::new(recovery::RecoveryStage::new(
                config.recovery.clone(),
                toolchain,
                runner,
            )))
    }

    /// Register `stage` under its own kind, returning any replaced implementation.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Option<Arc<dyn Stage>> {
        self.stages.insert(stage.kind(), stage)
    }

    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    pub fn resolve(&self, kind: StageKind) -> Result<Arc<dyn Stage>, RegistryError> {
        self.stages
            .get(&kind)
            .cloned()
            .ok_or(RegistryError::Unregistered(kind))
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.contains_key(&kind)
    }

    /// Registered kinds in rank order.
    pub fn kinds(&self) -> Vec<StageKind> {
        let mut kinds: Vec<StageKind> = self.stages.keys().copied().collect();
        kinds.sort_by_key(|k| k.rank());
        kinds
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::process::SystemRunner;
    use crate::stages::{StageError, StageResult};

    struct Noop(StageKind);

    #[async_trait::async_trait]
    impl Stage for Noop {
        fn kind(&self) -> StageKind {
            self.0
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<StageResult, StageError> {
            Ok(StageResult::begin(self.0).finish())
        }
    }

    #[test]
    fn test_builtin_registers_all_five() {
        let registry = StageRegistry::builtin(&AutobuildConfig::default(), Arc::new(SystemRunner));
        assert_eq!(registry.kinds(), StageKind::ALL.to_vec());
    }

    #[test]
    fn test_register_substitutes_by_kind() {
        let mut registry = StageRegistry::builtin(&AutobuildConfig::default(), Arc::new(SystemRunner));
        let replaced = registry.register(Arc::new(Noop(StageKind::Cli)));
        assert!(replaced.is_some());
        assert_eq!(registry.kinds().len(), 5);
    }

    #[test]
    fn test_resolve_unregistered_fails_loudly() {
        let registry = StageRegistry::empty().with(Arc::new(Noop(StageKind::Cli)));
        assert!(registry.resolve(StageKind::Cli).is_ok());
        assert_eq!(
            registry.resolve(StageKind::Recovery).err(),
            Some(RegistryError::Unregistered(StageKind::Recovery))
        );
    }
}
