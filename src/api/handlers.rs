use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::models::{AnomalyRecord, FeatureVector};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

// ============================================================================
// Health
// ============================================================================

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let model = state.detector().model().get();
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "started_at": state.started_at,
        "model_loaded": model.is_some(),
        "model_version": model.as_ref().map(|m| m.version().to_string()),
        "trained_at": model.as_ref().map(|m| m.metadata.trained_at),
        "threshold": state.detector().threshold(),
        "storage": state.storage.describe(),
    }))
}

// ============================================================================
// Scoring
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreItem {
    #[serde(default, alias = "ticker")]
    pub instrument_id: String,
    #[serde(default, alias = "features")]
    pub named_features: BTreeMap<String, Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Accepts `{"items": [...]}`, a bare array, or a single item.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ScoreRequest {
    Batch { items: Vec<ScoreItem> },
    List(Vec<ScoreItem>),
    Single(ScoreItem),
}

impl ScoreRequest {
    fn into_items(self) -> Vec<ScoreItem> {
        match self {
            ScoreRequest::Batch { items } | ScoreRequest::List(items) => items,
            ScoreRequest::Single(item) => vec![item],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ScoreOutcome {
    Scored {
        instrument_id: String,
        score: f64,
        is_flagged: bool,
        contributions: BTreeMap<String, f64>,
        timestamp: DateTime<Utc>,
    },
    Rejected {
        instrument_id: String,
        status: u16,
        error: String,
    },
}

impl From<AnomalyRecord> for ScoreOutcome {
    fn from(r: AnomalyRecord) -> Self {
        ScoreOutcome::Scored {
            instrument_id: r.instrument_id,
            score: r.score,
            is_flagged: r.is_flagged,
            contributions: r.contributions,
            timestamp: r.timestamp,
        }
    }
}

/// Turn a request item into a feature vector, or say why it can't be scored.
fn validate_item(item: ScoreItem, trained: &[String]) -> Result<FeatureVector, (String, String)> {
    let instrument_id = item.instrument_id.trim().to_string();
    if instrument_id.is_empty() {
        return Err((instrument_id, "instrument_id is empty".to_string()));
    }
    if item.named_features.is_empty() {
        return Err((instrument_id, "no features supplied".to_string()));
    }

    let mut named_features = BTreeMap::new();
    for (name, value) in item.named_features {
        match value.as_f64() {
            Some(v) if v.is_finite() => {
                named_features.insert(name, v);
            }
            _ => {
                return Err((instrument_id, format!("feature {name} is not a finite number")));
            }
        }
    }
    if !trained.iter().any(|f| named_features.contains_key(f)) {
        return Err((
            instrument_id,
            format!("none of the model features {:?} were supplied", trained),
        ));
    }

    Ok(FeatureVector {
        instrument_id,
        timestamp: item.timestamp.unwrap_or_else(Utc::now),
        named_features,
    })
}

pub async fn score(
    State(state): State<AppState>,
    Json(request): Json<ScoreRequest>,
) -> ApiResult<impl IntoResponse> {
    let detector = state.detector();
    let model = detector.model().current()?;
    let items = request.into_items();
    if items.is_empty() {
        return Err(ApiError::BadRequest("empty batch".to_string()));
    }

    let mut results = Vec::with_capacity(items.len());
    let mut scored = 0usize;
    for item in items {
        match validate_item(item, model.feature_names()) {
            Ok(vector) => {
                results.push(ScoreOutcome::from(detector.score_with(&model, vector)));
                scored += 1;
            }
            Err((instrument_id, error)) => {
                warn!(instrument = %instrument_id, "Rejected score item: {}", error);
                results.push(ScoreOutcome::Rejected {
                    instrument_id,
                    status: StatusCode::BAD_REQUEST.as_u16(),
                    error,
                });
            }
        }
    }

    let status = if scored > 0 {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((
        status,
        Json(json!({
            "model_version": model.version(),
            "threshold": detector.threshold(),
            "results": results,
        })),
    ))
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AnomalyQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub flagged_only: bool,
}

fn default_limit() -> usize {
    50
}

pub async fn anomalies(
    State(state): State<AppState>,
    Path(instrument): Path<String>,
    Query(query): Query<AnomalyQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.clamp(1, 1_000);
    let mut records = state.storage.anomalies.read_recent(&instrument, limit).await?;
    records.reverse();
    if query.flagged_only {
        records.retain(|r| r.is_flagged);
    }
    Ok(Json(json!({
        "instrument_id": instrument,
        "count": records.len(),
        "anomalies": records,
    })))
}

pub async fn instruments(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut all: BTreeSet<String> = state.tickers.iter().cloned().collect();
    all.extend(state.storage.ticks.instruments().await?);
    Ok(Json(json!({
        "configured": state.tickers,
        "instruments": all,
    })))
}

// ============================================================================
// Control
// ============================================================================

pub async fn reload_model(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let detector = state.detector();
    if !detector.load_artifact()? {
        return Err(ApiError::NotFound("no model artifact on disk".to_string()));
    }
    let model = detector.model().current()?;
    info!(version = %model.version(), "Model reloaded over HTTP");
    Ok(Json(json!({
        "reloaded": true,
        "model_version": model.version(),
        "trained_at": model.metadata.trained_at,
        "training_feature_names": model.feature_names(),
    })))
}

/// Run ingest → features → detect for one instrument in the background.
pub async fn trigger_pipeline(
    State(state): State<AppState>,
    Path(instrument): Path<String>,
) -> impl IntoResponse {
    let orchestrator = state.orchestrator.clone();
    let id = instrument.clone();
    tokio::spawn(async move {
        let outcome = orchestrator.run_instrument(&id).await;
        info!(
            instrument = %id,
            status = outcome.status.as_str(),
            records = outcome.records_written,
            flagged = outcome.flagged,
            "Background pipeline finished"
        );
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": format!("pipeline started for {instrument}") })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained() -> Vec<String> {
        vec!["volume_ratio".to_string(), "price_zscore".to_string()]
    }

    #[test]
    fn test_validate_item() {
        let ok = ScoreItem {
            instrument_id: " X ".into(),
            named_features: BTreeMap::from([("volume_ratio".to_string(), json!(2.5))]),
            timestamp: None,
        };
        let v = validate_item(ok, &trained()).unwrap();
        assert_eq!(v.instrument_id, "X");
        assert_eq!(v.get("volume_ratio"), Some(2.5));

        let unrelated = ScoreItem {
            instrument_id: "X".into(),
            named_features: BTreeMap::from([("other".to_string(), json!(1.0))]),
            timestamp: None,
        };
        assert!(validate_item(unrelated, &trained()).is_err());

        let text = ScoreItem {
            instrument_id: "X".into(),
            named_features: BTreeMap::from([("volume_ratio".to_string(), json!("high"))]),
            timestamp: None,
        };
        assert!(validate_item(text, &trained()).is_err());
    }

    #[test]
    fn test_request_shapes() {
        let batch: ScoreRequest =
            serde_json::from_str(r#"{"items": [{"ticker": "X", "features": {"a": 1.0}}]}"#).unwrap();
        assert_eq!(batch.into_items().len(), 1);
        let list: ScoreRequest =
            serde_json::from_str(r#"[{"instrument_id": "X", "named_features": {}}]"#).unwrap();
        assert_eq!(list.into_items()[0].instrument_id, "X");
    }
}
