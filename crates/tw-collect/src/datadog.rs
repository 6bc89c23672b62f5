//! Datadog collector: time-series query over the trial window.
//!
//! The query may lead with an aggregation keyword (`avg:`, `last:`, `max:`,
//! `min:`, `sum:`) choosing how the returned series collapses to a single
//! number; `avg` is the default. The response must contain exactly one
//! series.

use async_trait::async_trait;
use serde::Deserialize;

use crate::{CaptureError, CaptureRequest, Collector, Credentials, Observation};
use tw_types::MetricKind;

const API_URL: &str = "https://api.datadoghq.com/api/v1/query";

#[derive(Debug)]
pub struct DatadogCollector {
    http: reqwest::Client,
    credentials: Credentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Aggregation {
    Avg,
    Last,
    Max,
    Min,
    Sum,
}

/// Split an optional aggregation keyword off the front of the query.
pub(crate) fn parse_query(query: &str) -> (Aggregation, &str) {
    if let Some((keyword, rest)) = query.split_once(':') {
        let aggregation = match keyword {
            "avg" => Some(Aggregation::Avg),
            "last" => Some(Aggregation::Last),
            "max" => Some(Aggregation::Max),
            "min" => Some(Aggregation::Min),
            "sum" => Some(Aggregation::Sum),
            _ => None,
        };
        if let Some(aggregation) = aggregation {
            return (aggregation, rest);
        }
    }
    (Aggregation::Avg, query)
}

/// Collapse a series' points with the chosen aggregation.
pub(crate) fn aggregate(aggregation: Aggregation, points: &[f64]) -> f64 {
    if points.is_empty() {
        return f64::NAN;
    }
    match aggregation {
        Aggregation::Avg => points.iter().sum::<f64>() / points.len() as f64,
        Aggregation::Last => *points.last().unwrap_or(&f64::NAN),
        Aggregation::Max => points.iter().copied().fold(f64::MIN, f64::max),
        Aggregation::Min => points.iter().copied().fold(f64::MAX, f64::min),
        Aggregation::Sum => points.iter().sum(),
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    series: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    pointlist: Vec<Vec<Option<f64>>>,
}

impl DatadogCollector {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
        }
    }

    fn keys(&self) -> Result<(&str, &str), CaptureError> {
        let api_key = self
            .credentials
            .datadog_api_key
            .as_deref()
            .ok_or_else(|| CaptureError::permanent("datadog API key is not configured"))?;
        let app_key = self
            .credentials
            .datadog_app_key
            .as_deref()
            .ok_or_else(|| CaptureError::permanent("datadog application key is not configured"))?;
        Ok((api_key, app_key))
    }
}

#[async_trait]
impl Collector for DatadogCollector {
    fn kind(&self) -> MetricKind {
        MetricKind::Datadog
    }

    async fn capture(&self, request: &CaptureRequest<'_>) -> Result<Observation, CaptureError> {
        let (api_key, app_key) = self.keys()?;
        let (aggregation, query) = parse_query(&request.query);

        let response: QueryResponse = self
            .http
            .get(API_URL)
            .header("DD-API-KEY", api_key)
            .header("DD-APPLICATION-KEY", app_key)
            .query(&[
                ("from", request.window.start.timestamp().to_string()),
                ("to", request.window.completion.timestamp().to_string()),
                ("query", query.to_string()),
            ])
            .send()
            .await?
            .json()
            .await?;

        if response.series.len() != 1 {
            return Err(CaptureError::permanent(format!(
                "expected exactly one series for {}, got {}",
                request.metric.name,
                response.series.len()
            )));
        }

        let points: Vec<f64> = response.series[0]
            .pointlist
            .iter()
            .filter_map(|pair| pair.get(1).copied().flatten())
            .collect();
        let value = aggregate(aggregation, &points);
        if value.is_nan() {
            return Err(CaptureError::permanent(format!(
                "series for {} contains no data points",
                request.metric.name
            )));
        }

        Ok(Observation { value, error: 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_keyword_parsing() {
        assert_eq!(parse_query("avg:system.cpu{*}").0, Aggregation::Avg);
        assert_eq!(parse_query("last:system.cpu{*}").0, Aggregation::Last);
        assert_eq!(parse_query("sum:requests{env:prod}").0, Aggregation::Sum);
        // Unknown keyword falls back to avg and keeps the full query.
        let (aggregation, rest) = parse_query("p95:latency{*}");
        assert_eq!(aggregation, Aggregation::Avg);
        assert_eq!(rest, "p95:latency{*}");
        // No keyword at all.
        let (aggregation, rest) = parse_query("system.load.1{*}");
        assert_eq!(aggregation, Aggregation::Avg);
        assert_eq!(rest, "system.load.1{*}");
    }

    #[test]
    fn aggregations() {
        let points = [1.0, 2.0, 3.0, 6.0];
        assert_eq!(aggregate(Aggregation::Avg, &points), 3.0);
        assert_eq!(aggregate(Aggregation::Last, &points), 6.0);
        assert_eq!(aggregate(Aggregation::Max, &points), 6.0);
        assert_eq!(aggregate(Aggregation::Min, &points), 1.0);
        assert_eq!(aggregate(Aggregation::Sum, &points), 12.0);
    }

    #[test]
    fn empty_series_aggregates_to_nan() {
        assert!(aggregate(Aggregation::Avg, &[]).is_nan());
    }

    #[tokio::test]
    async fn missing_credentials_fail_permanently() {
        let collector = DatadogCollector::new(Credentials::default());
        let metric = tw_types::Metric::new("cpu", MetricKind::Datadog, "avg:system.cpu{*}");
        let request = CaptureRequest {
            metric: &metric,
            query: metric.query.clone(),
            error_query: None,
            url: None,
            window: crate::ObservationWindow {
                start: chrono::Utc::now(),
                completion: chrono::Utc::now(),
            },
        };
        assert!(matches!(
            collector.capture(&request).await,
            Err(CaptureError::Permanent { .. })
        ));
    }
}
