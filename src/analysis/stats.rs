//! Small descriptive statistics over run durations and metrics.

use serde::{Deserialize, Serialize};

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (n - 1 denominator). 0 for fewer than two values.
pub fn sample_variance(values: &[f64]) -> f64 {
    let count = values.len();
    if count < 2 {
        return 0.0;
    }
    let mean = mean(values);
    let variance_sum: f64 = values
        .iter()
        .map(|v| {
            let diff = mean - *v;
            diff * diff
        })
        .sum();
    variance_sum / (count - 1) as f64
}

/// Incremental mean update: the new average after observing `value` as the
/// `count`-th sample.
pub fn running_mean(previous: f64, value: f64, count: u64) -> f64 {
    if count == 0 {
        return value;
    }
    previous + (value - previous) / count as f64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub avg_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub variance: f64,
    pub sample_count: usize,
}

impl DurationStats {
    pub fn from_samples(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        Self {
            avg_secs: mean(values),
            min_secs: values.iter().cloned().fold(f64::INFINITY, f64::min),
            max_secs: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            variance: sample_variance(values),
            sample_count: values.len(),
        }
    }
}
