//! Window statistics over plain slices

use statrs::statistics::Statistics;

/// Arithmetic mean; 0.0 for an empty window
pub fn mean(window: &[f64]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().mean()
}

/// Population standard deviation (divides by n); 0.0 for an empty window
pub fn population_std(window: &[f64]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    finite_or_zero(window.iter().population_std_dev())
}

/// Z-score with the denominator floor-clamped to `epsilon`
pub fn zscore(value: f64, mean: f64, std: f64, epsilon: f64) -> f64 {
    (value - mean) / std.max(epsilon)
}

/// Period-over-period relative change; the first element is 0.0
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(prices.len());
    for i in 0..prices.len() {
        if i == 0 {
            out.push(0.0);
        } else {
            out.push(prices[i] / prices[i - 1] - 1.0);
        }
    }
    out
}

/// Replace NaN and infinities with 0.0
#[inline]
pub fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
