//! Scoring stored feature vectors into anomaly records

mod features_job;

pub use features_job::FeatureJob;

use crate::config::ModelSettings;
use crate::error::PipelineError;
use crate::model::{AnomalyModel, ModelArtifact, ModelHandle};
use crate::models::{AnomalyRecord, FeatureVector};
use crate::pipeline::CancelFlag;
use crate::storage::{AnomalyStore, FeatureStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts from one `process` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub written: usize,
    pub flagged: usize,
}

#[derive(Clone)]
pub struct AnomalyDetector {
    model: ModelHandle,
    features: FeatureStore,
    anomalies: AnomalyStore,
    settings: ModelSettings,
    /// Features the current engineer produces
    available_features: Vec<String>,
    scoring_batch: usize,
    training_window: usize,
}

impl AnomalyDetector {
    pub fn new(
        model: ModelHandle,
        features: FeatureStore,
        anomalies: AnomalyStore,
        settings: ModelSettings,
        available_features: Vec<String>,
    ) -> Self {
        Self {
            model,
            features,
            anomalies,
            settings,
            available_features,
            scoring_batch: 1_000,
            training_window: 500,
        }
    }

    pub fn with_limits(mut self, scoring_batch: usize, training_window: usize) -> Self {
        self.scoring_batch = scoring_batch.max(1);
        self.training_window = training_window.max(1);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.settings.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.settings.threshold
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Score one vector against a model snapshot.
    pub fn score_with(&self, model: &AnomalyModel, vector: FeatureVector) -> AnomalyRecord {
        let scored = model.score(&vector);
        if !scored.is_complete() {
            let err = PipelineError::MalformedFeatureVector {
                instrument: vector.instrument_id.clone(),
                missing: scored.missing.clone(),
            };
            warn!(timestamp = %vector.timestamp, "{}; defaulted to 0.0", err);
        }
        AnomalyRecord::new(
            vector,
            scored.score,
            self.settings.threshold,
            model.version(),
            scored.contributions,
        )
    }

    pub fn score(&self, vector: FeatureVector) -> Result<AnomalyRecord, PipelineError> {
        let model = self.model.current()?;
        Ok(self.score_with(&model, vector))
    }

    /// Score the vectors stored after the instrument's newest anomaly record.
    ///
    /// Keys already scored are never rescored, so calling this again without
    /// new features writes nothing.
    pub async fn process_detailed(&self, instrument_id: &str) -> Result<ProcessSummary, PipelineError> {
        let model = self.model.current()?;
        let since = self.anomalies.latest_timestamp(instrument_id).await?;
        let vectors = self
            .features
            .read_since(instrument_id, since, self.scoring_batch)
            .await?;
        if vectors.is_empty() {
            debug!(instrument = %instrument_id, "No unscored feature vectors");
            return Ok(ProcessSummary::default());
        }

        let records: Vec<AnomalyRecord> = vectors
            .into_iter()
            .map(|v| self.score_with(&model, v))
            .collect();
        let flagged = records.iter().filter(|r| r.is_flagged).count();
        let written = self.anomalies.write_batch(&records).await?;

        for record in records.iter().filter(|r| r.is_flagged) {
            info!(
                instrument = %record.instrument_id,
                timestamp = %record.timestamp,
                score = record.score,
                "🚨 Anomaly: {}",
                record.explanation(3)
            );
        }
        info!(instrument = %instrument_id, written, flagged, "Scored feature vectors");
        Ok(ProcessSummary { written, flagged })
    }

    /// Number of anomaly records written for the instrument.
    pub async fn process(&self, instrument_id: &str) -> Result<usize, PipelineError> {
        Ok(self.process_detailed(instrument_id).await?.written)
    }

    /// Process instruments in order. A failing instrument counts as zero and
    /// does not stop the others; after cancellation no new instrument starts.
    pub async fn process_all(
        &self,
        instruments: &[String],
        cancel: &CancelFlag,
    ) -> BTreeMap<String, usize> {
        let mut results = BTreeMap::new();
        for (i, instrument) in instruments.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(remaining = instruments.len() - i, "Detection cancelled");
                break;
            }
            let count = match self.process(instrument).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "Detection failed");
                    0
                }
            };
            results.insert(instrument.clone(), count);
        }
        results
    }

    /// Training features: the configured list, or everything the engineer emits.
    pub fn training_features(&self) -> Result<Vec<String>, PipelineError> {
        if self.settings.training_features.is_empty() {
            return Ok(self.available_features.clone());
        }
        let unknown: Vec<&String> = self
            .settings
            .training_features
            .iter()
            .filter(|f| !self.available_features.contains(f))
            .collect();
        if !unknown.is_empty() {
            return Err(PipelineError::Config(format!(
                "model.training_features names unknown features {:?}",
                unknown
            )));
        }
        Ok(self.settings.training_features.clone())
    }

    /// Fit a model on the most recent stored vectors of `instruments`.
    pub async fn train_from_store(&self, instruments: &[String]) -> Result<AnomalyModel, PipelineError> {
        let names = self.training_features()?;
        let mut corpus = Vec::new();
        for instrument in instruments {
            match self.features.read_recent(instrument, self.training_window).await {
                Ok(vectors) => corpus.extend(vectors),
                Err(e) => warn!(instrument = %instrument, error = %e, "Skipping instrument in training corpus"),
            }
        }
        info!(
            samples = corpus.len(),
            instruments = instruments.len(),
            features = names.len(),
            "🧠 Training anomaly model"
        );
        AnomalyModel::train(&corpus, &names, &self.settings)
    }

    /// Train, persist the artifact, then swap it in. On any failure the
    /// active model is left as it was.
    pub async fn retrain(&self, instruments: &[String]) -> Result<Arc<AnomalyModel>, PipelineError> {
        let model = match self.train_from_store(instruments).await {
            Ok(model) => model,
            Err(e) => {
                warn!(error = %e, kept_previous = self.model.is_loaded(), "Training failed");
                return Err(e);
            }
        };
        let artifact = ModelArtifact::new(model);
        artifact.save(&self.settings.artifact_path)?;
        self.model.replace(artifact.model);
        let model = self.model.current()?;
        info!(
            version = %model.version(),
            samples = model.metadata.n_samples,
            cutoff = model.metadata.contamination_cutoff,
            "✅ Model trained and activated"
        );
        Ok(model)
    }

    /// Load the configured artifact if it exists. Returns whether a model was loaded.
    pub fn load_artifact(&self) -> Result<bool, PipelineError> {
        let path = &self.settings.artifact_path;
        if !path.exists() {
            debug!(path = %path.display(), "No model artifact on disk");
            return Ok(false);
        }
        self.model.reload_from(path, &self.available_features)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureEngineer;
    use crate::storage::{FileBackend, StorageBackend, Store};

    fn detector(dir: &std::path::Path, training_features: Vec<String>) -> AnomalyDetector {
        let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir).unwrap());
        let settings = ModelSettings {
            training_features,
            artifact_path: dir.join("model.json"),
            ..ModelSettings::default()
        };
        AnomalyDetector::new(
            ModelHandle::new(),
            Store::local(backend.clone()),
            Store::local(backend),
            settings,
            FeatureEngineer::default().feature_names(),
        )
    }

    #[test]
    fn test_training_features_default_to_engineer_output() {
        let dir = tempfile::tempdir().unwrap();
        let d = detector(dir.path(), Vec::new());
        assert_eq!(d.training_features().unwrap().len(), 7);

        let d = detector(dir.path(), vec!["volume_ratio".into(), "price_zscore".into()]);
        assert_eq!(d.training_features().unwrap(), vec!["volume_ratio", "price_zscore"]);
    }

    #[test]
    fn test_unknown_training_feature_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let d = detector(dir.path(), vec!["sentiment".into()]);
        let err = d.training_features().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_load_artifact_absent_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let d = detector(dir.path(), Vec::new());
        assert!(!d.load_artifact().unwrap());
        let vector = FeatureVector {
            instrument_id: "X".into(),
            timestamp: chrono::Utc::now(),
            named_features: BTreeMap::new(),
        };
        assert!(matches!(d.score(vector), Err(PipelineError::ModelNotLoaded)));
    }
}
