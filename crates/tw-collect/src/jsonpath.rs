//! JSONPath collector: fetch a JSON document and evaluate a path expression.
//!
//! Supports the dotted/bracket subset (`$.a.b[0].c`); the expression must
//! resolve to exactly one scalar convertible to a float.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::{CaptureError, CaptureRequest, Collector, Observation};
use tw_types::MetricKind;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct JsonPathCollector {
    http: reqwest::Client,
}

impl JsonPathCollector {
    pub fn new() -> Self {
        // Timeout is per fetch; a hung endpoint becomes a retryable error.
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }
}

impl Default for JsonPathCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a dotted/bracket JSONPath subset against a document. Returns the
/// single matched value, or `None` when the path does not resolve.
pub(crate) fn evaluate(document: &Value, path: &str) -> Option<Value> {
    let path = path.trim().strip_prefix('$').unwrap_or(path);
    let mut current = document;
    for segment in split_segments(path) {
        match segment {
            Segment::Key(key) => current = current.get(key)?,
            Segment::Index(index) => current = current.get(index)?,
        }
    }
    Some(current.clone())
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn split_segments(path: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    for piece in path.split('.') {
        if piece.is_empty() {
            continue;
        }
        let mut rest = piece;
        // Peel `name[0][1]` into a key plus index segments.
        if let Some(open) = rest.find('[') {
            if open > 0 {
                segments.push(Segment::Key(&rest[..open]));
            }
            rest = &rest[open..];
            while let Some(close) = rest.find(']') {
                if let Ok(index) = rest[1..close].parse() {
                    segments.push(Segment::Index(index));
                }
                rest = &rest[close + 1..];
                if !rest.starts_with('[') {
                    break;
                }
            }
        } else {
            segments.push(Segment::Key(rest));
        }
    }
    segments
}

/// Convert a matched scalar to a float.
pub(crate) fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[async_trait]
impl Collector for JsonPathCollector {
    fn kind(&self) -> MetricKind {
        MetricKind::JsonPath
    }

    async fn capture(&self, request: &CaptureRequest<'_>) -> Result<Observation, CaptureError> {
        let url = request
            .url
            .as_deref()
            .ok_or_else(|| CaptureError::permanent("jsonpath metric has no resolved URL"))?;

        let document: Value = self.http.get(url).send().await?.json().await?;

        let matched = evaluate(&document, &request.query).ok_or_else(|| {
            CaptureError::permanent(format!(
                "path {:?} not found in response from {url}",
                request.query
            ))
        })?;
        let value = to_float(&matched).ok_or_else(|| {
            CaptureError::permanent(format!(
                "path {:?} matched a non-scalar value",
                request.query
            ))
        })?;

        let error = match &request.error_query {
            Some(error_query) => evaluate(&document, error_query)
                .as_ref()
                .and_then(to_float)
                .unwrap_or(0.0),
            None => 0.0,
        };

        Ok(Observation { value, error })
    }
}
