//! # tw-collect
//!
//! Pluggable metric collectors. Each collector kind produces one
//! `(value, error)` observation for a trial window; failures split into
//! retryable (back off and ask again) and permanent (counts against the
//! metric's attempt budget).

pub mod datadog;
pub mod jsonpath;
pub mod kubernetes;
pub mod newrelic;
pub mod prometheus;
pub mod url;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use tw_types::{Metric, MetricKind};

pub use crate::url::{resolve_url, ServiceEndpoint, ServicePort};
pub use datadog::DatadogCollector;
pub use jsonpath::JsonPathCollector;
pub use kubernetes::KubernetesCollector;
pub use newrelic::NewRelicCollector;
pub use prometheus::PrometheusCollector;

/// The time window a metric is captured over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationWindow {
    pub start: DateTime<Utc>,
    pub completion: DateTime<Utc>,
}

impl ObservationWindow {
    pub fn duration_seconds(&self) -> f64 {
        (self.completion - self.start).num_milliseconds() as f64 / 1000.0
    }
}

/// A captured `(value, error bound)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub value: f64,
    pub error: f64,
}

/// Collector failure disposition.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Not ready yet; ask again after the delay. Does not count against the
    /// metric's attempt budget.
    #[error("capture not ready, retry after {after:?}")]
    Retryable { after: Duration },

    /// Counts against the attempt budget.
    #[error("capture failed: {reason}")]
    Permanent { reason: String },
}

impl CaptureError {
    pub fn retryable(after: Duration) -> Self {
        Self::Retryable { after }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        // Network problems are worth retrying; they say nothing about the
        // metric itself.
        if err.is_timeout() || err.is_connect() {
            Self::Retryable {
                after: Duration::from_secs(5),
            }
        } else {
            Self::Permanent {
                reason: err.to_string(),
            }
        }
    }
}

/// Everything a collector needs for one capture: the metric declaration, the
/// rendered queries, the resolved endpoint, and the trial window.
#[derive(Debug, Clone)]
pub struct CaptureRequest<'a> {
    pub metric: &'a Metric,
    /// Rendered result query.
    pub query: String,
    /// Rendered error-bound query.
    pub error_query: Option<String>,
    /// Resolved endpoint URL, when the metric needs one.
    pub url: Option<String>,
    pub window: ObservationWindow,
}

/// A per-metric-kind value producer.
#[async_trait]
pub trait Collector: Send + Sync {
    fn kind(&self) -> MetricKind;

    async fn capture(&self, request: &CaptureRequest<'_>) -> Result<Observation, CaptureError>;
}

/// Credentials for the hosted metric backends, injected at construction.
/// Collectors never read the process environment.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub datadog_api_key: Option<String>,
    pub datadog_app_key: Option<String>,
    pub new_relic_api_key: Option<String>,
    pub new_relic_account_id: Option<String>,
}

/// Closed registry of collectors, one per metric kind.
pub struct CollectorSet {
    collectors: HashMap<MetricKind, Box<dyn Collector>>,
}

impl CollectorSet {
    /// Registry with every built-in collector.
    pub fn new(credentials: Credentials) -> Self {
        let mut set = Self {
            collectors: HashMap::new(),
        };
        set.register(Box::new(KubernetesCollector::new()));
        set.register(Box::new(PrometheusCollector::new()));
        set.register(Box::new(DatadogCollector::new(credentials.clone())));
        set.register(Box::new(JsonPathCollector::new()));
        set.register(Box::new(NewRelicCollector::new(credentials)));
        set
    }

    /// Empty registry; used by tests that install scripted collectors.
    pub fn empty() -> Self {
        Self {
            collectors: HashMap::new(),
        }
    }

    pub fn register(&mut self, collector: Box<dyn Collector>) {
        self.collectors.insert(collector.kind(), collector);
    }

    pub fn get(&self, kind: MetricKind) -> Option<&dyn Collector> {
        self.collectors.get(&kind).map(Box::as_ref)
    }

    /// Dispatch a capture to the collector for the metric's kind.
    pub async fn capture(
        &self,
        request: &CaptureRequest<'_>,
    ) -> Result<Observation, CaptureError> {
        match self.get(request.metric.kind) {
            Some(collector) => collector.capture(request).await,
            None => Err(CaptureError::permanent(format!(
                "no collector registered for metric type {}",
                request.metric.kind
            ))),
        }
    }
}

/// Check whether a metric declaration can be captured at all (an unknown or
/// unregistered kind fails the trial immediately, before any attempt).
pub fn supports(set: &CollectorSet, metric: &Metric) -> bool {
    set.get(metric.kind).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_duration() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let completion = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap();
        let window = ObservationWindow { start, completion };
        assert_eq!(window.duration_seconds(), 5.0);
    }

    #[tokio::test]
    async fn unknown_kind_is_permanent() {
        let set = CollectorSet::empty();
        let metric = Metric::new("duration", MetricKind::Kubernetes, "5");
        let request = CaptureRequest {
            metric: &metric,
            query: "5".into(),
            error_query: None,
            url: None,
            window: ObservationWindow {
                start: Utc::now(),
                completion: Utc::now(),
            },
        };
        let result = set.capture(&request).await;
        assert!(matches!(result, Err(CaptureError::Permanent { .. })));
    }

    #[test]
    fn full_registry_covers_all_kinds() {
        let set = CollectorSet::new(Credentials::default());
        for kind in [
            MetricKind::Kubernetes,
            MetricKind::Prometheus,
            MetricKind::Datadog,
            MetricKind::JsonPath,
            MetricKind::NewRelic,
        ] {
            assert!(set.get(kind).is_some(), "missing collector for {kind}");
        }
    }
}
