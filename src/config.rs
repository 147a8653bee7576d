//! Application configuration
//!
//! Loaded from an optional TOML file, then overridden by environment variables
//! (after `.env` has been read). Every field has a default so an empty file is valid.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "tick_sentinel.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub features: FeatureSettings,

    #[serde(default)]
    pub model: ModelSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

/// Which backend is tried before the local file store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryBackend {
    /// Local files only
    #[default]
    None,
    /// PostgREST-style table API (Supabase)
    Rest,
    /// SQLite database with composite-key tables
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the local fallback store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub primary: PrimaryBackend,

    /// Base URL of the table API, e.g. https://xyz.supabase.co
    #[serde(default)]
    pub rest_url: Option<String>,

    #[serde(default)]
    pub rest_key: Option<String>,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// Per-request timeout for the remote backend (ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/tick_sentinel.db")
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            primary: PrimaryBackend::None,
            rest_url: None,
            rest_key: None,
            sqlite_path: default_sqlite_path(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSettings {
    /// Short horizon; also the number of ticks needed before the first vector
    #[serde(default = "default_min_window")]
    pub min_window: usize,

    /// Long horizon for the second volume average; `None` disables it
    #[serde(default = "default_long_window")]
    pub long_window: Option<usize>,

    /// Floor for standard deviations used as z-score denominators
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_min_window() -> usize {
    5
}

fn default_long_window() -> Option<usize> {
    Some(20)
}

fn default_epsilon() -> f64 {
    1e-8
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            min_window: default_min_window(),
            long_window: default_long_window(),
            epsilon: default_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_model_version")]
    pub version: String,

    /// Normalized score above which a record is flagged
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Expected outlier share; the training score at this upper quantile
    /// normalizes to `threshold`
    #[serde(default = "default_contamination")]
    pub contamination_rate: f64,

    #[serde(default = "default_min_training_samples")]
    pub min_training_samples: usize,

    #[serde(default = "default_n_trees")]
    pub n_trees: usize,

    /// Subsample size per tree
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_artifact_path")]
    pub artifact_path: PathBuf,

    /// Features to train on; empty means everything the engineer produces
    #[serde(default)]
    pub training_features: Vec<String>,

    /// Train from stored features when `pipeline` runs without an artifact
    #[serde(default = "default_true")]
    pub auto_train: bool,
}

fn default_model_version() -> String {
    "v1".to_string()
}

fn default_threshold() -> f64 {
    0.8
}

fn default_contamination() -> f64 {
    0.005
}

fn default_min_training_samples() -> usize {
    10
}

fn default_n_trees() -> usize {
    100
}

fn default_max_samples() -> usize {
    256
}

fn default_seed() -> u64 {
    42
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("models/isolation_forest.json")
}

fn default_true() -> bool {
    true
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            version: default_model_version(),
            threshold: default_threshold(),
            contamination_rate: default_contamination(),
            min_training_samples: default_min_training_samples(),
            n_trees: default_n_trees(),
            max_samples: default_max_samples(),
            seed: default_seed(),
            artifact_path: default_artifact_path(),
            training_features: Vec::new(),
            auto_train: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_tickers")]
    pub tickers: Vec<String>,

    /// Concurrent per-instrument units
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Minimum gap between two provider calls made by the same worker (ms)
    #[serde(default = "default_provider_delay_ms")]
    pub provider_delay_ms: u64,

    #[serde(default = "default_provider_url")]
    pub provider_url: String,

    #[serde(default = "default_period")]
    pub provider_period: String,

    #[serde(default = "default_interval")]
    pub provider_interval: String,

    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    /// Most recent ticks fed to the feature engineer per run
    #[serde(default = "default_tick_window")]
    pub tick_window: usize,

    /// Most recent feature vectors per instrument used for training
    #[serde(default = "default_training_window")]
    pub training_window: usize,

    /// Upper bound on feature vectors scored per instrument per run
    #[serde(default = "default_scoring_batch")]
    pub scoring_batch: usize,
}

fn default_tickers() -> Vec<String> {
    [
        "RELIANCE.NS",
        "TCS.NS",
        "INFY.NS",
        "HDFCBANK.NS",
        "ICICIBANK.NS",
        "HINDUNILVR.NS",
        "ITC.NS",
        "SBIN.NS",
        "BHARTIARTL.NS",
        "KOTAKBANK.NS",
        "WIPRO.NS",
        "LT.NS",
        "MARUTI.NS",
        "ASIANPAINT.NS",
        "NESTLEIND.NS",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_workers() -> usize {
    4
}

fn default_provider_delay_ms() -> u64 {
    1_000
}

fn default_provider_url() -> String {
    "https://query1.finance.yahoo.com".to_string()
}

fn default_period() -> String {
    "1mo".to_string()
}

fn default_interval() -> String {
    "1d".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

fn default_tick_window() -> usize {
    1_000
}

fn default_training_window() -> usize {
    500
}

fn default_scoring_batch() -> usize {
    1_000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tickers: default_tickers(),
            workers: default_workers(),
            provider_delay_ms: default_provider_delay_ms(),
            provider_url: default_provider_url(),
            provider_period: default_period(),
            provider_interval: default_interval(),
            provider_timeout_ms: default_provider_timeout_ms(),
            tick_window: default_tick_window(),
            training_window: default_training_window(),
            scoring_batch: default_scoring_batch(),
        }
    }
}

impl PipelineSettings {
    pub fn provider_delay(&self) -> Duration {
        Duration::from_millis(self.provider_delay_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8001
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl AppConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the full configuration: explicit file, default file, or defaults,
    /// then environment overrides, then validation.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE)?,
            None => {
                tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                Self::default()
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Some(url) = non_empty_var("SUPABASE_URL") {
            self.storage.rest_url = Some(url);
            self.storage.primary = PrimaryBackend::Rest;
        }
        if let Some(key) = non_empty_var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|| non_empty_var("SUPABASE_ANON_KEY"))
        {
            self.storage.rest_key = Some(key);
        }
        if let Some(path) = non_empty_var("SQLITE_PATH") {
            self.storage.sqlite_path = PathBuf::from(path);
            if self.storage.primary == PrimaryBackend::None {
                self.storage.primary = PrimaryBackend::Sqlite;
            }
        }
        if let Some(dir) = non_empty_var("DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = non_empty_var("MODEL_PATH") {
            self.model.artifact_path = PathBuf::from(path);
        }
        if let Some(version) = non_empty_var("MODEL_VERSION") {
            self.model.version = version;
        }
        if let Some(v) = parsed_var::<f64>("ANOMALY_THRESHOLD") {
            self.model.threshold = v;
        }
        if let Some(v) = parsed_var::<f64>("CONTAMINATION_RATE") {
            self.model.contamination_rate = v;
        }
        if let Some(tickers) = non_empty_var("DEFAULT_TICKERS") {
            self.pipeline.tickers = tickers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = parsed_var::<usize>("PIPELINE_WORKERS") {
            self.pipeline.workers = v;
        }
        if let Some(v) = parsed_var::<u64>("PROVIDER_DELAY_MS") {
            self.pipeline.provider_delay_ms = v;
        }
        if let Some(v) = parsed_var::<u16>("PORT") {
            self.server.port = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.features.min_window == 0 {
            bail!("features.min_window must be at least 1");
        }
        if let Some(long) = self.features.long_window {
            if long < self.features.min_window {
                bail!(
                    "features.long_window ({}) must not be shorter than min_window ({})",
                    long,
                    self.features.min_window
                );
            }
        }
        if !(self.features.epsilon > 0.0) {
            bail!("features.epsilon must be positive");
        }
        if !(0.0..=1.0).contains(&self.model.threshold) {
            bail!("model.threshold must lie in [0, 1], got {}", self.model.threshold);
        }
        if !(0.0..0.5).contains(&self.model.contamination_rate) {
            bail!(
                "model.contamination_rate must lie in [0, 0.5), got {}",
                self.model.contamination_rate
            );
        }
        if self.model.n_trees == 0 || self.model.max_samples < 2 {
            bail!("model.n_trees must be >= 1 and model.max_samples >= 2");
        }
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.storage.primary == PrimaryBackend::Rest && self.storage.rest_url.is_none() {
            bail!("storage.primary = \"rest\" requires storage.rest_url");
        }
        Ok(())
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = non_empty_var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
