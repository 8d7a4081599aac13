//! Failure-pattern extraction: word frequencies across the error messages of
//! runs that did not pass.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::scheduler::RunResult;
use crate::stages::ExecutionStatus;

pub const MIN_WORD_LEN: usize = 5;
pub const TOP_PATTERNS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub word: String,
    pub count: usize,
}

fn tokens(message: &str) -> impl Iterator<Item = String> + '_ {
    message
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= MIN_WORD_LEN)
        .map(str::to_lowercase)
}

/// Most frequent words (by count, then alphabetically) in the combined error
/// messages of non-passing runs.
pub fn failure_patterns(runs: &[RunResult]) -> Vec<FailurePattern> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for run in runs.iter().filter(|r| r.status != ExecutionStatus::Passed) {
        if let Some(message) = &run.combined_error {
            for word in tokens(message) {
                *counts.entry(word).or_insert(0) += 1;
            }
        }
    }

    let mut patterns: Vec<FailurePattern> = counts
        .into_iter()
        .map(|(word, count)| FailurePattern { word, count })
        .collect();
    patterns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    patterns.truncate(TOP_PATTERNS);
    patterns
}
