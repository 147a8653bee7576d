//! Error taxonomy for the pipeline.
//!
//! Per-instrument errors are caught at the orchestrator boundary and turned into
//! outcomes; only configuration and model-artifact errors are fatal.

use thiserror::Error;

/// Failure of a single storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("remote store error: {0}")]
    Remote(String),

    #[error("remote store timed out after {0} attempt(s)")]
    Timeout(u32),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed row: {0}")]
    MalformedRow(String),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Task(e.to_string())
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StorageError::Timeout(1)
        } else {
            StorageError::Remote(e.to_string())
        }
    }
}

/// Pipeline error kinds.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Provider returned nothing for the instrument. Non-fatal, zero-count.
    #[error("no data available for {instrument}")]
    DataUnavailable { instrument: String },

    /// Fewer ticks than the feature window needs. Non-fatal.
    #[error("{instrument}: {available} ticks available, {required} required")]
    InsufficientHistory {
        instrument: String,
        available: usize,
        required: usize,
    },

    /// Training corpus too small. The previously active model stays active.
    #[error("training corpus has {available} samples, {required} required")]
    InsufficientData { available: usize, required: usize },

    /// Scoring attempted with no active model.
    #[error("no anomaly model loaded")]
    ModelNotLoaded,

    /// A required named feature was missing or non-finite and was defaulted.
    #[error("{instrument}: feature vector missing {missing:?}")]
    MalformedFeatureVector {
        instrument: String,
        missing: Vec<String>,
    },

    #[error("market data provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Artifact needs features the current feature engineer does not produce.
    #[error("model artifact requires unknown features {missing:?}")]
    IncompatibleArtifact { missing: Vec<String> },

    #[error("model artifact at {path} is corrupt: {reason}")]
    ArtifactCorrupt { path: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Errors that must stop the process instead of being reported per instrument.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_)
                | PipelineError::ArtifactCorrupt { .. }
                | PipelineError::IncompatibleArtifact { .. }
        )
    }

    /// Conditions a caller may surface as "try again later".
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::ModelNotLoaded
                | PipelineError::Provider(_)
                | PipelineError::Storage(StorageError::Timeout(_))
        )
    }

    /// Outcomes that count as zero work rather than failure.
    pub fn is_zero_count(&self) -> bool {
        matches!(
            self,
            PipelineError::DataUnavailable { .. } | PipelineError::InsufficientHistory { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::Config("bad".into()).is_fatal());
        assert!(PipelineError::IncompatibleArtifact {
            missing: vec!["x".into()]
        }
        .is_fatal());
        assert!(!PipelineError::ModelNotLoaded.is_fatal());
        assert!(!PipelineError::DataUnavailable {
            instrument: "X".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_retryable_and_zero_count() {
        assert!(PipelineError::ModelNotLoaded.is_retryable());
        assert!(PipelineError::Storage(StorageError::Timeout(2)).is_retryable());
        assert!(PipelineError::InsufficientHistory {
            instrument: "X".into(),
            available: 2,
            required: 5,
        }
        .is_zero_count());
        assert!(!PipelineError::InsufficientData {
            available: 3,
            required: 10
        }
        .is_zero_count());
    }
}
