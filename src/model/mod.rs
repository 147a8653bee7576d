//! Unsupervised anomaly model
//!
//! An [`AnomalyModel`] is immutable once trained. Retraining builds a new model
//! and swaps it into the shared [`ModelHandle`].

mod artifact;
mod baseline;
mod handle;
pub mod isolation;

pub use artifact::{ModelArtifact, ARTIFACT_FORMAT_VERSION};
pub use baseline::{quantile, FeatureBaseline, ScoreCalibration};
pub use handle::ModelHandle;
pub use isolation::{ForestParams, IsolationForest};

use crate::config::ModelSettings;
use crate::error::PipelineError;
use crate::models::FeatureVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Descriptive metadata carried with the fitted state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub version: String,
    pub trained_at: DateTime<Utc>,
    /// Exact features the model was fitted on, in column order
    pub training_feature_names: Vec<String>,
    pub contamination_rate: f64,
    pub n_samples: usize,
    pub n_trees: usize,
    pub seed: u64,
    /// Raw training score at the `1 - contamination` quantile; normalizes to
    /// the threshold the model was trained with
    pub contamination_cutoff: f64,
}

/// Result of scoring one feature vector
#[derive(Debug, Clone)]
pub struct ModelScore {
    /// Normalized to [0, 1]
    pub score: f64,
    pub contributions: BTreeMap<String, f64>,
    /// Trained features absent (or non-finite) in the input; scored as 0.0
    pub missing: Vec<String>,
}

impl ModelScore {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyModel {
    pub metadata: ModelMetadata,
    forest: IsolationForest,
    baseline: FeatureBaseline,
    calibration: ScoreCalibration,
}

impl AnomalyModel {
    /// Fit a model on `corpus` using exactly `feature_names`, in that order.
    ///
    /// Fails with `InsufficientData` below `settings.min_training_samples`
    /// (never fewer than two samples).
    pub fn train(
        corpus: &[FeatureVector],
        feature_names: &[String],
        settings: &ModelSettings,
    ) -> Result<Self, PipelineError> {
        let required = settings.min_training_samples.max(2);
        if corpus.len() < required {
            return Err(PipelineError::InsufficientData {
                available: corpus.len(),
                required,
            });
        }
        if feature_names.is_empty() {
            return Err(PipelineError::Config(
                "model needs at least one training feature".to_string(),
            ));
        }

        let rows: Vec<Vec<f64>> = corpus
            .iter()
            .map(|v| Self::project(feature_names, v).0)
            .collect();

        let params = ForestParams {
            n_trees: settings.n_trees,
            max_samples: settings.max_samples,
            seed: settings.seed,
        };
        let forest = IsolationForest::fit(&rows, params);
        let baseline = FeatureBaseline::fit(&rows, feature_names.len());

        let raw = forest.raw_scores(&rows);
        let calibration =
            ScoreCalibration::fit(&raw, settings.contamination_rate, settings.threshold);

        Ok(Self {
            metadata: ModelMetadata {
                version: settings.version.clone(),
                trained_at: Utc::now(),
                training_feature_names: feature_names.to_vec(),
                contamination_rate: settings.contamination_rate,
                n_samples: corpus.len(),
                n_trees: forest.n_trees(),
                seed: settings.seed,
                contamination_cutoff: calibration.offset,
            },
            forest,
            baseline,
            calibration,
        })
    }

    /// Dense row in training column order plus the names that were defaulted.
    fn project(names: &[String], vector: &FeatureVector) -> (Vec<f64>, Vec<String>) {
        let mut missing = Vec::new();
        let row = names
            .iter()
            .map(|name| match vector.get(name) {
                Some(v) if v.is_finite() => v,
                _ => {
                    missing.push(name.clone());
                    0.0
                }
            })
            .collect();
        (row, missing)
    }

    pub fn score(&self, vector: &FeatureVector) -> ModelScore {
        let names = &self.metadata.training_feature_names;
        let (row, missing) = Self::project(names, vector);
        let raw = self.forest.raw_score(&row);
        ModelScore {
            score: self.calibration.normalize(raw),
            contributions: self.baseline.contributions(names, &row),
            missing,
        }
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    pub fn feature_names(&self) -> &[String] {
        &self.metadata.training_feature_names
    }

    pub fn calibration(&self) -> ScoreCalibration {
        self.calibration
    }

    /// Whether deserialized state agrees with its own metadata.
    pub(crate) fn is_consistent(&self) -> bool {
        let n = self.metadata.training_feature_names.len();
        self.forest.is_consistent()
            && self.forest.n_features() == n
            && self.baseline.len() == n
            && self.baseline.stds.len() == n
            && self.calibration.is_valid()
    }
}
