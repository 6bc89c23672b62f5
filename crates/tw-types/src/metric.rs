//! Metric declarations: what to measure and which collector measures it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The closed set of collector kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Text-template query over the trial and its target, parsed as a float.
    Kubernetes,
    /// Instant query against a Prometheus server.
    Prometheus,
    /// Time-series query against the Datadog API.
    Datadog,
    /// JSONPath expression over an HTTP JSON document.
    #[serde(rename = "jsonpath")]
    JsonPath,
    /// NRQL query against the New Relic GraphQL API.
    #[serde(rename = "newrelic")]
    NewRelic,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Kubernetes => "kubernetes",
            Self::Prometheus => "prometheus",
            Self::Datadog => "datadog",
            Self::JsonPath => "jsonpath",
            Self::NewRelic => "newrelic",
        };
        f.write_str(s)
    }
}

/// A named port on a service, referenced by number or by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

/// One objective of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    /// Lower is better when set.
    #[serde(default)]
    pub minimize: bool,
    /// Whether the remote optimizer should optimize over this metric. Unset
    /// means yes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// Collector query; rendered against the trial before capture.
    pub query: String,
    /// Optional query producing the error bound for the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_query: Option<String>,
    /// Acceptable lower bound on the observed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Acceptable upper bound on the observed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Label selector locating the service that exposes the metric endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
    /// Port on the selected service, when the selector matches more than one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortRef>,
    /// Explicit endpoint URL; wins over selector resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, kind: MetricKind, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            minimize: false,
            optimize: None,
            kind,
            query: query.into(),
            error_query: None,
            min: None,
            max: None,
            selector: None,
            port: None,
            url: None,
        }
    }

    pub fn minimized(mut self) -> Self {
        self.minimize = true;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Check a captured value against the declared acceptable bounds.
    pub fn in_bounds(&self, value: f64) -> bool {
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        true
    }
}
