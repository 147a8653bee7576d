//! On-disk model artifact
//!
//! Pretty JSON written through a temp file and renamed into place, so a reader
//! never sees a half-written artifact.

use super::AnomalyModel;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub const ARTIFACT_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub model: AnomalyModel,
}

impl ModelArtifact {
    pub fn new(model: AnomalyModel) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            model,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let corrupt = |reason: String| PipelineError::ArtifactCorrupt {
            path: path.display().to_string(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| corrupt(e.to_string()))?;
            }
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| corrupt(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| corrupt(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| corrupt(e.to_string()))?;

        info!(
            path = %path.display(),
            version = %self.model.metadata.version,
            samples = self.model.metadata.n_samples,
            "💾 Saved model artifact"
        );
        Ok(())
    }

    /// Load and validate an artifact.
    ///
    /// `available_features` is what the current feature engineer produces; an
    /// artifact trained on anything else is rejected.
    pub fn load(path: &Path, available_features: &[String]) -> Result<AnomalyModel, PipelineError> {
        let corrupt = |reason: String| PipelineError::ArtifactCorrupt {
            path: path.display().to_string(),
            reason,
        };

        let bytes = std::fs::read(path).map_err(|e| corrupt(e.to_string()))?;
        let artifact: ModelArtifact =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(corrupt(format!(
                "format version {} (expected {})",
                artifact.format_version, ARTIFACT_FORMAT_VERSION
            )));
        }
        if !artifact.model.is_consistent() {
            return Err(corrupt("fitted state does not match its metadata".to_string()));
        }

        let missing: Vec<String> = artifact
            .model
            .feature_names()
            .iter()
            .filter(|name| !available_features.contains(name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::IncompatibleArtifact { missing });
        }

        info!(
            path = %path.display(),
            version = %artifact.model.version(),
            trained_at = %artifact.model.metadata.trained_at,
            "📦 Loaded model artifact"
        );
        Ok(artifact.model)
    }
}
