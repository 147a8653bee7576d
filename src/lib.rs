//! Tick Sentinel Library
//!
//! Turns raw price/volume ticks into rolling feature vectors, scores them with an
//! unsupervised isolation model and persists explained anomaly records.
//!
//! ```text
//! provider ──▶ TickStore ──▶ FeatureEngineer ──▶ FeatureStore
//!                                                    │
//!                          ModelHandle ◀── train ────┤
//!                               │                    ▼
//!                               └────────────▶ AnomalyDetector ──▶ AnomalyStore
//! ```

pub mod api;
pub mod config;
pub mod detector;
pub mod error;
pub mod features;
pub mod ingest;
pub mod model;
pub mod models;
pub mod pipeline;
pub mod storage;

pub use config::AppConfig;
pub use detector::AnomalyDetector;
pub use error::{PipelineError, StorageError};
pub use features::FeatureEngineer;
pub use model::{AnomalyModel, ModelHandle};
pub use models::{AnomalyRecord, FeatureVector, OhlcvBar, Tick};
pub use pipeline::{CancelFlag, PipelineOrchestrator};
