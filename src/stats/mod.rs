//! Order statistics
//!
//! Stateless helpers used by both sides of the protocol:
//!
//! - `mean()`: arithmetic mean of a sample
//! - `median()`: median of a sample, optionally already sorted
//! - `midpoint()`: halfway point of two values, safe near `f64::MAX`
//! - `WeightedMean`: running count-weighted mean used to fold per-worker
//!   averages into a global one without seeing the raw values
//!
//! Argument problems (empty input, NaN values) are reported as
//! `StatsError::InvalidArgument` and are never coerced.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the order-statistic utilities
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

fn check_sample(values: &[f64]) -> Result<(), StatsError> {
    if values.is_empty() {
        return Err(StatsError::InvalidArgument("`values` should contain items"));
    }
    if values.iter().any(|v| v.is_nan()) {
        return Err(StatsError::InvalidArgument("`values` should be numeric (found NaN)"));
    }
    Ok(())
}

/// Arithmetic mean of `values`
pub fn mean(values: &[f64]) -> Result<f64, StatsError> {
    check_sample(values)?;
    let sum: f64 = values.iter().sum();
    Ok(sum / values.len() as f64)
}

/// Median of `values`
///
/// When `is_sorted` is false a sorted copy is made first; the input is never
/// reordered. Odd lengths return the middle element, even lengths the average
/// of the two middle elements.
pub fn median(values: &[f64], is_sorted: bool) -> Result<f64, StatsError> {
    check_sample(values)?;

    if is_sorted {
        return Ok(middle_of_sorted(values));
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(middle_of_sorted(&sorted))
}

fn middle_of_sorted(sorted: &[f64]) -> f64 {
    let half = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[half]
    } else {
        midpoint(sorted[half - 1], sorted[half])
    }
}

/// Halfway point between `a` and `b`
///
/// Exact whenever `(a + b) / 2` is; falls back to halving each side first when
/// the sum of two large finite values overflows.
pub fn midpoint(a: f64, b: f64) -> f64 {
    let sum = a + b;
    if sum.is_finite() {
        sum / 2.0
    } else {
        a / 2.0 + b / 2.0
    }
}

/// Running count-weighted mean
///
/// Folds `(count, mean)` pairs reported by independent partitions. The result
/// matches the mean of the concatenated partitions up to floating-point error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedMean {
    /// Current weighted mean
    pub mean: f64,

    /// Number of values folded in so far
    pub count: u64,
}

impl WeightedMean {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one partition's `(count, mean)` into the accumulator
    pub fn combine(&mut self, count: u64, mean: f64) {
        let total = self.count + count;

        // Both sides empty: nothing to weight, keep the reported mean
        if total == 0 {
            self.mean = mean;
        } else {
            self.mean = (self.mean * self.count as f64 + mean * count as f64) / total as f64;
        }
        self.count = total;
    }

    /// Whether any values were folded in
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_mean_of_ones() {
        assert_eq!(mean(&[1.0, 1.0, 1.0, 1.0, 1.0]).unwrap(), 1.0);
    }

    #[test]
    fn test_mean_mixed() {
        assert_eq!(mean(&[1.0, 2.0, 3.0, 4.0]).unwrap(), 2.5);
    }

    #[test]
    fn test_mean_rejects_empty() {
        assert!(matches!(mean(&[]), Err(StatsError::InvalidArgument(_))));
    }

    #[test]
    fn test_mean_rejects_nan() {
        assert!(matches!(mean(&[1.0, f64::NAN]), Err(StatsError::InvalidArgument(_))));
    }

    #[test]
    fn test_median_odd_length() {
        assert_eq!(median(&[1.0, 2.0, 3.0], true).unwrap(), 2.0);
    }

    #[test]
    fn test_median_even_length() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0], true).unwrap(), 2.5);
    }

    #[test]
    fn test_median_near_max() {
        assert_eq!(median(&[1.7e308, 1.7e308], true).unwrap(), 1.7e308);
        assert_eq!(median(&[f64::MAX, f64::MAX], false).unwrap(), f64::MAX);
        assert_eq!(median(&[-f64::MAX, -f64::MAX], true).unwrap(), -f64::MAX);
    }

    #[test]
    fn test_midpoint() {
        assert_eq!(midpoint(2.0, 4.0), 3.0);
        assert_eq!(midpoint(-f64::MAX, f64::MAX), 0.0);
        assert_eq!(midpoint(f64::MAX, f64::MAX / 2.0), f64::MAX / 4.0 * 3.0);
        assert_eq!(midpoint(5e-324, 5e-324), 5e-324);
    }

    #[test]
    fn test_median_unsorted_input_is_not_reordered() {
        let values = [5.0, 1.0, 4.0, 2.0, 3.0];
        assert_eq!(median(&values, false).unwrap(), 3.0);
        assert_eq!(values, [5.0, 1.0, 4.0, 2.0, 3.0]);
    }

    #[test]
    fn test_median_single_element() {
        assert_eq!(median(&[42.0], false).unwrap(), 42.0);
    }

    #[test]
    fn test_median_rejects_empty() {
        assert!(matches!(median(&[], true), Err(StatsError::InvalidArgument(_))));
        assert!(matches!(median(&[], false), Err(StatsError::InvalidArgument(_))));
    }

    #[test]
    fn test_median_sorted_and_unsorted_agree() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(1..50);
            let values: Vec<f64> = (0..len).map(|_| rng.gen_range(-100..100) as f64).collect();

            let mut sorted = values.clone();
            sorted.sort_by(f64::total_cmp);

            assert_eq!(median(&values, false).unwrap(), median(&sorted, true).unwrap());
        }
    }

    #[test]
    fn test_weighted_mean_empty_partitions() {
        let mut acc = WeightedMean::new();
        acc.combine(0, 0.0);
        assert!(acc.is_empty());
        assert_eq!(acc.mean, 0.0);

        acc.combine(4, 1.0);
        acc.combine(0, 0.0);
        assert_eq!(acc.count, 4);
        assert_eq!(acc.mean, 1.0);
    }

    #[test]
    fn test_weighted_mean_matches_concatenation() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let a: Vec<f64> = (0..rng.gen_range(1..40)).map(|_| rng.gen_range(-1e3..1e3)).collect();
            let b: Vec<f64> = (0..rng.gen_range(1..40)).map(|_| rng.gen_range(-1e3..1e3)).collect();

            let mut acc = WeightedMean::new();
            acc.combine(a.len() as u64, mean(&a).unwrap());
            acc.combine(b.len() as u64, mean(&b).unwrap());

            let whole: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
            let expected = mean(&whole).unwrap();

            assert!((acc.mean - expected).abs() < 1e-9, "{} vs {}", acc.mean, expected);
            assert_eq!(acc.count, whole.len() as u64);
        }
    }
}
