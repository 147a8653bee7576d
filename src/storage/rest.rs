//! PostgREST-style remote table backend (Supabase)
//!
//! Tables are addressed as `{base}/rest/v1/{table}`. Upserts rely on a unique
//! constraint over `(instrument_id, timestamp)` and `on_conflict` merging.

use super::{Collection, Row, StorageBackend};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::HeaderValue;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 2;

#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    base_url: String,
}

impl RestBackend {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Result<Self, StorageError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let key_header: HeaderValue = api_key
            .parse()
            .map_err(|_| StorageError::Remote("invalid api key".to_string()))?;
        let bearer: HeaderValue = format!("Bearer {}", api_key)
            .parse()
            .map_err(|_| StorageError::Remote("invalid api key".to_string()))?;
        headers.insert("apikey", key_header);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .default_headers(headers)
            .build()
            .map_err(|e| StorageError::Remote(format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, collection: Collection) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection.table())
    }

    /// Send with one retry on transport errors and 5xx responses.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, StorageError> {
        let mut last_err = StorageError::Remote("no attempt made".to_string());
        for attempt in 1..=MAX_ATTEMPTS {
            match build().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    let err = StorageError::Remote(format!("{status}: {text}"));
                    if !status.is_server_error() {
                        return Err(err);
                    }
                    last_err = err;
                }
                Err(e) if e.is_timeout() => last_err = StorageError::Timeout(attempt),
                Err(e) => last_err = StorageError::from(e),
            }
            if attempt < MAX_ATTEMPTS {
                debug!(attempt, error = %last_err, "Remote store request failed, retrying");
            }
        }
        Err(last_err)
    }

    async fn fetch_rows(&self, build: impl Fn() -> RequestBuilder) -> Result<Vec<Row>, StorageError> {
        let resp = self.send(build).await?;
        let values: Vec<Value> = resp.json().await?;
        let mut rows = Vec::with_capacity(values.len());
        for value in values {
            match Row::from_body(value) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(error = %e, "Skipping malformed remote row"),
            }
        }
        Ok(rows)
    }
}

fn ts_param(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl StorageBackend for RestBackend {
    fn name(&self) -> &'static str {
        "remote-rest"
    }

    async fn upsert(&self, collection: Collection, rows: &[Row]) -> Result<(), StorageError> {
        let bodies: Vec<&Value> = rows.iter().map(|r| &r.body).collect();
        let url = self.url(collection);
        self.send(|| {
            self.client
                .post(&url)
                .query(&[("on_conflict", "instrument_id,timestamp")])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&bodies)
        })
        .await?;
        Ok(())
    }

    async fn read_recent(
        &self,
        collection: Collection,
        instrument_id: &str,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        let url = self.url(collection);
        let filter = format!("eq.{instrument_id}");
        let limit = limit.to_string();
        let mut rows = self
            .fetch_rows(|| {
                self.client.get(&url).query(&[
                    ("select", "*"),
                    ("instrument_id", filter.as_str()),
                    ("order", "timestamp.desc"),
                    ("limit", limit.as_str()),
                ])
            })
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn read_since(
        &self,
        collection: Collection,
        instrument_id: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Row>, StorageError> {
        let url = self.url(collection);
        let filter = format!("eq.{instrument_id}");
        let limit = limit.to_string();
        let mut query: Vec<(&str, String)> = vec![
            ("select", "*".to_string()),
            ("instrument_id", filter),
            ("order", "timestamp.asc".to_string()),
            ("limit", limit),
        ];
        if let Some(after) = after {
            query.push(("timestamp", format!("gt.{}", ts_param(after))));
        }
        self.fetch_rows(|| self.client.get(&url).query(&query)).await
    }

    async fn instruments(&self, collection: Collection) -> Result<Vec<String>, StorageError> {
        let url = self.url(collection);
        let resp = self
            .send(|| self.client.get(&url).query(&[("select", "instrument_id")]))
            .await?;
        let values: Vec<Value> = resp.json().await?;
        let ids: BTreeSet<String> = values
            .iter()
            .filter_map(|v| v.get("instrument_id").and_then(Value::as_str))
            .map(String::from)
            .collect();
        Ok(ids.into_iter().collect())
    }
}
