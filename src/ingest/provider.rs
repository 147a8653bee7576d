//! Market data providers

use crate::error::PipelineError;
use crate::models::OhlcvBar;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Pull-based source of OHLCV bars.
///
/// An empty vector means the provider has nothing for the instrument; that is
/// not an error.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_bars(
        &self,
        instrument_id: &str,
        period: &str,
        interval: &str,
    ) -> Result<Vec<OhlcvBar>, PipelineError>;
}

// ============================================================================
// Yahoo-style chart API
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    #[serde(default)]
    indicators: Indicators,
}

#[derive(Debug, Default, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<i64>>,
}

#[derive(Clone)]
pub struct ChartApiProvider {
    client: Client,
    base_url: String,
}

impl ChartApiProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (compatible; tick-sentinel/0.1)")
            .build()
            .map_err(|e| PipelineError::Provider(format!("failed to build client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_once(
        &self,
        instrument_id: &str,
        period: &str,
        interval: &str,
    ) -> Result<ChartEnvelope, PipelineError> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, instrument_id);
        let resp = self
            .client
            .get(&url)
            .query(&[("range", period), ("interval", interval)])
            .send()
            .await
            .map_err(|e| PipelineError::Provider(format!("GET {url}: {e}")))?;

        let status = resp.status();
        // The chart API reports unknown symbols as 404 with a JSON error body.
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Provider(format!("GET {url} {status}: {text}")));
        }
        resp.json::<ChartEnvelope>()
            .await
            .map_err(|e| PipelineError::Provider(format!("failed to parse chart response: {e}")))
    }
}

#[async_trait]
impl MarketDataProvider for ChartApiProvider {
    fn name(&self) -> &str {
        "chart-api"
    }

    async fn fetch_bars(
        &self,
        instrument_id: &str,
        period: &str,
        interval: &str,
    ) -> Result<Vec<OhlcvBar>, PipelineError> {
        let envelope = match self.fetch_once(instrument_id, period, interval).await {
            Ok(envelope) => envelope,
            Err(first) => {
                debug!(instrument = %instrument_id, error = %first, "Provider call failed, retrying once");
                self.fetch_once(instrument_id, period, interval).await?
            }
        };

        if let Some(err) = envelope.chart.error {
            warn!(
                instrument = %instrument_id,
                code = %err.code,
                "Provider has no data: {}",
                err.description
            );
            return Ok(Vec::new());
        }

        let Some(result) = envelope.chart.result.and_then(|r| r.into_iter().next()) else {
            return Ok(Vec::new());
        };
        Ok(bars_from_chart(instrument_id, result))
    }
}

fn bars_from_chart(instrument_id: &str, result: ChartResult) -> Vec<OhlcvBar> {
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let mut bars = Vec::with_capacity(result.timestamp.len());
    let mut skipped = 0usize;

    for (i, &ts) in result.timestamp.iter().enumerate() {
        let at = |v: &Vec<Option<f64>>| v.get(i).copied().flatten();
        let (Some(close), Some(volume), Some(timestamp)) = (
            at(&quote.close),
            quote.volume.get(i).copied().flatten(),
            DateTime::<Utc>::from_timestamp(ts, 0),
        ) else {
            skipped += 1;
            continue;
        };
        bars.push(OhlcvBar {
            timestamp,
            open: at(&quote.open).unwrap_or(close),
            high: at(&quote.high).unwrap_or(close),
            low: at(&quote.low).unwrap_or(close),
            close,
            volume,
        });
    }

    if skipped > 0 {
        debug!(instrument = %instrument_id, skipped, "Skipped bars with missing close or volume");
    }
    bars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chart_response() {
        let body = r#"{
            "chart": {
                "result": [{
                    "timestamp": [1704153600, 1704240000, 1704326400],
                    "indicators": {
                        "quote": [{
                            "open": [10.0, 11.0, null],
                            "high": [10.5, 11.5, null],
                            "low": [9.5, 10.5, null],
                            "close": [10.2, 11.1, null],
                            "volume": [1000, 1200, null]
                        }]
                    }
                }],
                "error": null
            }
        }"#;
        let envelope: ChartEnvelope = serde_json::from_str(body).unwrap();
        let result = envelope.chart.result.unwrap().into_iter().next().unwrap();
        let bars = bars_from_chart("X", result);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 11.1);
        assert_eq!(bars[1].volume, 1200);
        assert_eq!(bars[0].timestamp.timestamp(), 1704153600);
    }

    #[test]
    fn test_parse_error_envelope() {
        let body = r#"{"chart": {"result": null, "error": {"code": "Not Found", "description": "No data found"}}}"#;
        let envelope: ChartEnvelope = serde_json::from_str(body).unwrap();
        assert!(envelope.chart.result.is_none());
        assert_eq!(envelope.chart.error.unwrap().code, "Not Found");
    }
}
