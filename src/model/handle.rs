use super::{AnomalyModel, ModelArtifact};
use crate::error::PipelineError;
use arc_swap::ArcSwapOption;
use std::path::Path;
use std::sync::Arc;

/// Shared, swappable reference to the active model.
///
/// Readers take a snapshot `Arc` and keep scoring against it even if a retrain
/// swaps in a new model mid-batch.
#[derive(Clone, Default)]
pub struct ModelHandle {
    inner: Arc<ArcSwapOption<AnomalyModel>>,
}

impl ModelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: AnomalyModel) -> Self {
        let handle = Self::new();
        handle.replace(model);
        handle
    }

    pub fn get(&self) -> Option<Arc<AnomalyModel>> {
        self.inner.load_full()
    }

    pub fn current(&self) -> Result<Arc<AnomalyModel>, PipelineError> {
        self.get().ok_or(PipelineError::ModelNotLoaded)
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.load().is_some()
    }

    /// Swap in a new model, returning the one it replaced.
    pub fn replace(&self, model: AnomalyModel) -> Option<Arc<AnomalyModel>> {
        self.inner.swap(Some(Arc::new(model)))
    }

    /// Load an artifact and swap it in. The active model is untouched on error.
    pub fn reload_from(
        &self,
        path: &Path,
        available_features: &[String],
    ) -> Result<Arc<AnomalyModel>, PipelineError> {
        let model = Arc::new(ModelArtifact::load(path, available_features)?);
        self.inner.store(Some(model.clone()));
        Ok(model)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let version = self.get().map(|m| m.version().to_string());
        f.debug_struct("ModelHandle").field("version", &version).finish()
    }
}
