//! Training-corpus statistics used for explanations and score calibration

use crate::features::rolling::{finite_or_zero, mean, population_std};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Smallest std used for contributions, relative to the feature's scale
const RELATIVE_STD_FLOOR: f64 = 1e-3;
const SPAN_FLOOR: f64 = 1e-12;

/// Per-feature mean and population std of the training corpus.
///
/// A feature's contribution is `|x - mean| / std`, i.e. how many training
/// standard deviations the value sits from the training mean. It depends only
/// on the corpus, not on the fitted trees. The std is floored at
/// `1e-3 * max(|mean|, 1)` so a feature that never varied in training does not
/// blow up the explanation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureBaseline {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl FeatureBaseline {
    pub fn fit(rows: &[Vec<f64>], n_features: usize) -> Self {
        let mut means = Vec::with_capacity(n_features);
        let mut stds = Vec::with_capacity(n_features);
        for f in 0..n_features {
            let column: Vec<f64> = rows.iter().map(|r| r[f]).collect();
            means.push(mean(&column));
            stds.push(population_std(&column));
        }
        Self { means, stds }
    }

    pub fn contributions(&self, names: &[String], x: &[f64]) -> BTreeMap<String, f64> {
        names
            .iter()
            .enumerate()
            .map(|(f, name)| {
                let floor = RELATIVE_STD_FLOOR * self.means[f].abs().max(1.0);
                let z = (x[f] - self.means[f]).abs() / self.stds[f].max(floor);
                (name.clone(), finite_or_zero(z))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }
}

/// Maps raw isolation scores into [0, 1], anchored on the contamination cutoff.
///
/// `offset` is the raw training score at the `1 - contamination` quantile and
/// `floor` the lowest raw training score. The transform is piecewise linear:
///
/// - `s <= offset`: `threshold * (s - floor) / (offset - floor)`, clamped at 0
/// - `s > offset`: `threshold + (1 - threshold) * (s - offset) / (1 - offset)`
///
/// so the cutoff lands exactly on the threshold the model was trained for and
/// about `contamination` of in-distribution points score above it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreCalibration {
    pub floor: f64,
    pub offset: f64,
    pub threshold: f64,
}

impl ScoreCalibration {
    pub fn fit(raw_scores: &[f64], contamination: f64, threshold: f64) -> Self {
        let offset = quantile(raw_scores, 1.0 - contamination);
        let floor = raw_scores.iter().copied().fold(offset, f64::min);
        Self {
            floor,
            offset,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn normalize(&self, raw: f64) -> f64 {
        let score = if raw <= self.offset {
            let span = self.offset - self.floor;
            if span < SPAN_FLOOR {
                if raw < self.offset {
                    0.0
                } else {
                    self.threshold
                }
            } else {
                self.threshold * (raw - self.floor) / span
            }
        } else {
            let span = (1.0 - self.offset).max(SPAN_FLOOR);
            self.threshold + (1.0 - self.threshold) * (raw - self.offset) / span
        };
        finite_or_zero(score).clamp(0.0, 1.0)
    }

    pub fn is_valid(&self) -> bool {
        self.floor.is_finite()
            && self.offset.is_finite()
            && self.floor <= self.offset
            && (0.0..=1.0).contains(&self.threshold)
    }
}

/// Value at quantile `q` of `values` (nearest-rank on a sorted copy).
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((q.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contributions_are_abs_zscores() {
        let rows = vec![vec![1.0, 10.0], vec![3.0, 10.0]];
        let baseline = FeatureBaseline::fit(&rows, 2);
        let names = vec!["a".to_string(), "b".to_string()];
        let c = baseline.contributions(&names, &[0.0, 10.0]);
        assert!((c["a"] - 2.0).abs() < 1e-12);
        assert_eq!(c["b"], 0.0);
    }

    #[test]
    fn test_constant_feature_contribution_is_scaled() {
        // "b" is flat at zero in training, like returns on an untraded day.
        let rows = vec![vec![1.0, 0.0], vec![3.0, 0.0], vec![2.0, 0.0]];
        let baseline = FeatureBaseline::fit(&rows, 2);
        let names = vec!["a".to_string(), "b".to_string()];
        let c = baseline.contributions(&names, &[2.0, 0.01]);
        assert!((c["b"] - 10.0).abs() < 1e-9);

        let rows = vec![vec![500.0]; 4];
        let baseline = FeatureBaseline::fit(&rows, 1);
        let c = baseline.contributions(&["v".to_string()], &[501.0]);
        assert!((c["v"] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_calibration_puts_cutoff_on_threshold() {
        let raw: Vec<f64> = (0..100).map(|i| 0.4 + i as f64 * 0.002).collect();
        let cal = ScoreCalibration::fit(&raw, 0.05, 0.8);
        assert_eq!(cal.offset, quantile(&raw, 0.95));
        assert_eq!(cal.normalize(cal.offset), 0.8);
        assert_eq!(cal.normalize(cal.floor), 0.0);
        assert_eq!(cal.normalize(0.1), 0.0);
        assert_eq!(cal.normalize(1.0), 1.0);

        let flagged = raw.iter().filter(|s| cal.normalize(**s) > 0.8).count();
        assert_eq!(flagged, 5);

        let mut previous = 0.0;
        for s in [0.3, 0.45, 0.55, 0.6, 0.7, 0.9] {
            let n = cal.normalize(s);
            assert!(n >= previous && n <= 1.0);
            previous = n;
        }
        assert!(cal.is_valid());
    }

    #[test]
    fn test_calibration_with_identical_scores() {
        let cal = ScoreCalibration::fit(&[0.5; 10], 0.005, 0.8);
        assert_eq!(cal.normalize(0.4), 0.0);
        assert_eq!(cal.normalize(0.5), 0.8);
        assert!(cal.normalize(0.6) > 0.8);
    }

    #[test]
    fn test_quantile() {
        let v = [5.0, 1.0, 3.0, 2.0, 4.0];
        assert_eq!(quantile(&v, 0.0), 1.0);
        assert_eq!(quantile(&v, 0.5), 3.0);
        assert_eq!(quantile(&v, 1.0), 5.0);
        assert_eq!(quantile(&[], 0.5), 0.0);
    }
}
