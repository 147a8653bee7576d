//! HTTP scoring and query surface

mod error;
mod handlers;

pub use error::{ApiError, ApiResult};
pub use handlers::{ScoreItem, ScoreOutcome, ScoreRequest};

use crate::detector::AnomalyDetector;
use crate::pipeline::{CancelFlag, PipelineOrchestrator};
use crate::storage::StorageSet;
use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: PipelineOrchestrator,
    pub storage: StorageSet,
    /// Instruments from configuration
    pub tickers: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(orchestrator: PipelineOrchestrator, storage: StorageSet, tickers: Vec<String>) -> Self {
        Self {
            orchestrator,
            storage,
            tickers,
            started_at: Utc::now(),
        }
    }

    pub fn detector(&self) -> &AnomalyDetector {
        self.orchestrator.detector()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/score", post(handlers::score))
        .route("/anomalies/:instrument", get(handlers::anomalies))
        .route("/instruments", get(handlers::instruments))
        .route("/tickers", get(handlers::instruments))
        .route("/model/reload", post(handlers::reload_model))
        .route("/pipeline/:instrument", post(handlers::trigger_pipeline))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `cancel` is set.
pub async fn serve(state: AppState, addr: &str, cancel: CancelFlag) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !cancel.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            info!("API server shutting down");
        })
        .await
        .context("Server error")?;
    Ok(())
}
