//! Skip and abort policy applied between stages.

use crate::stages::{StageKind, StageResult};

/// Error fragments that make a stage result critical regardless of counts.
/// Matched case-insensitively as plain substrings.
pub const CRITICAL_PHRASES: [&str; 3] = ["installation failed", "command not found", "permission denied"];

/// A stage result severe enough to stop scheduling: nothing passed and more
/// than two checks failed, or an error names one of [`CRITICAL_PHRASES`].
pub fn is_critical_failure(result: &StageResult) -> bool {
    if result.passed == 0 && result.failed > 2 {
        return true;
    }
    result.errors.iter().any(|error| {
        let error = error.to_lowercase();
        CRITICAL_PHRASES.iter().any(|phrase| error.contains(phrase))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnCritical {
    /// Keep scheduling; dependants are handled by [`skip_reason`].
    Continue,
    /// Omit every remaining stage from the run.
    Abort,
}

/// What sequential scheduling does after a critical result from `stage`.
///
/// | stage        | on critical |
/// |--------------|-------------|
/// | installation | abort       |
/// | cli          | continue (functional is skipped) |
/// | functional   | abort       |
/// | performance  | abort       |
/// | recovery     | abort       |
///
/// The staged (prefix then parallel) mode does not consult this table: any
/// critical result in the prefix ends the run.
pub fn on_critical(stage: StageKind) -> OnCritical {
    match stage {
        StageKind::Cli => OnCritical::Continue,
        StageKind::Installation
        | StageKind::Functional
        | StageKind::Performance
        | StageKind::Recovery => OnCritical::Abort,
    }
}

/// Why `stage` should not run given the results so far, if it should not.
pub fn skip_reason(stage: StageKind, completed: &[StageResult]) -> Option<String> {
    let find = |kind: StageKind| completed.iter().find(|r| r.stage == kind);

    if stage != StageKind::Installation {
        if let Some(install) = find(StageKind::Installation) {
            if install.status.is_failure() {
                return Some(format!("skipped: installation stage {}", install.status));
            }
        }
    }
    if stage == StageKind::Functional {
        if let Some(cli) = find(StageKind::Cli) {
            if is_critical_failure(cli) {
                return Some("skipped: cli stage failed critically".to_string());
            }
        }
    }
    None
}
