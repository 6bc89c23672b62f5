//! Prometheus collector: instant queries against the v1 HTTP API, gated on
//! scrape freshness.
//!
//! Before querying, the collector inspects the server's scrape targets. An
//! unhealthy target or a last scrape older than `completion + interval`
//! yields a retryable error so the engine asks again once the final scrape
//! has landed.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::{CaptureError, CaptureRequest, Collector, Observation};
use tw_types::MetricKind;

const SCRAPE_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct PrometheusCollector {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TargetsResponse {
    data: TargetsData,
}

#[derive(Debug, Deserialize)]
struct TargetsData {
    #[serde(rename = "activeTargets", default)]
    active_targets: Vec<ActiveTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ActiveTarget {
    #[serde(default)]
    pub health: String,
    #[serde(rename = "lastScrape")]
    pub last_scrape: DateTime<Utc>,
    #[serde(rename = "scrapeInterval", default)]
    pub scrape_interval: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType", default)]
    result_type: String,
    #[serde(default)]
    result: serde_json::Value,
}

/// Parse a Prometheus duration string ("15s", "2m", "1h"). Unparseable
/// values count as zero.
pub(crate) fn parse_interval(value: &str) -> ChronoDuration {
    let value = value.trim();
    let Some(last) = value.chars().last() else {
        return ChronoDuration::zero();
    };
    let number: i64 = match value[..value.len() - 1].parse() {
        Ok(n) => n,
        Err(_) => return ChronoDuration::zero(),
    };
    match last {
        's' => ChronoDuration::seconds(number),
        'm' => ChronoDuration::minutes(number),
        'h' => ChronoDuration::hours(number),
        _ => ChronoDuration::zero(),
    }
}

/// Decide whether the server has finished scraping the trial window. Returns
/// the latest scrape time on success.
pub(crate) fn scrape_readiness(
    targets: &[ActiveTarget],
    completion: DateTime<Utc>,
) -> Result<DateTime<Utc>, CaptureError> {
    if targets.iter().any(|t| t.health != "up") {
        return Err(CaptureError::retryable(SCRAPE_RETRY));
    }

    let last_scrape = targets
        .iter()
        .map(|t| t.last_scrape)
        .max()
        .unwrap_or(completion);
    let interval = targets
        .iter()
        .filter_map(|t| t.scrape_interval.as_deref())
        .map(parse_interval)
        .max()
        .unwrap_or_else(ChronoDuration::zero);

    if last_scrape < completion + interval {
        // Waiting for the final scrape of the trial window.
        return Err(CaptureError::retryable(SCRAPE_RETRY));
    }
    Ok(last_scrape)
}

/// Coerce an instant-query result to a number. Scalars and single-element
/// vectors convert; anything else is NaN.
pub(crate) fn coerce(result_type: &str, result: &serde_json::Value) -> f64 {
    let sample = match result_type {
        "scalar" => result.clone(),
        "vector" => match result.as_array() {
            Some(items) if items.len() == 1 => {
                items[0].get("value").cloned().unwrap_or_default()
            }
            _ => return f64::NAN,
        },
        _ => return f64::NAN,
    };
    sample
        .as_array()
        .and_then(|pair| pair.get(1))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(f64::NAN)
}

impl PrometheusCollector {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn targets(&self, base: &str) -> Result<Vec<ActiveTarget>, CaptureError> {
        let url = format!("{}/api/v1/targets", base.trim_end_matches('/'));
        let response: TargetsResponse = self.http.get(&url).send().await?.json().await?;
        Ok(response.data.active_targets)
    }

    async fn query(
        &self,
        base: &str,
        query: &str,
        at: DateTime<Utc>,
    ) -> Result<f64, CaptureError> {
        let url = format!("{}/api/v1/query", base.trim_end_matches('/'));
        let response: QueryResponse = self
            .http
            .get(&url)
            .query(&[("query", query), ("time", &at.to_rfc3339())])
            .send()
            .await?
            .json()
            .await?;
        Ok(coerce(&response.data.result_type, &response.data.result))
    }
}

impl Default for PrometheusCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for PrometheusCollector {
    fn kind(&self) -> MetricKind {
        MetricKind::Prometheus
    }

    async fn capture(&self, request: &CaptureRequest<'_>) -> Result<Observation, CaptureError> {
        let base = request
            .url
            .as_deref()
            .ok_or_else(|| CaptureError::permanent("prometheus metric has no resolved URL"))?;
        let completion = request.window.completion;

        let targets = self.targets(base).await?;
        let last_scrape = scrape_readiness(&targets, completion)?;

        let mut value = self.query(base, &request.query, completion).await?;
        if value.is_nan() && last_scrape > completion {
            debug!(metric = %request.metric.name, "re-querying at last scrape time");
            value = self.query(base, &request.query, last_scrape).await?;
        }
        if value.is_nan() {
            return Err(CaptureError::permanent(format!(
                "metric data not available for {}",
                request.metric.name
            )));
        }

        let error = match &request.error_query {
            Some(error_query) => {
                let e = self.query(base, error_query, completion).await?;
                if e.is_nan() {
                    0.0
                } else {
                    e
                }
            }
            None => 0.0,
        };

        Ok(Observation { value, error })
    }
}
