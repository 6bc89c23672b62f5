//! Kubernetes-resource collector: the rendered query *is* the value.
//!
//! The query template has access to the trial and its target (helpers like
//! `duration` are supplied by the renderer); by the time it reaches this
//! collector it must have rendered to a parseable floating-point number.

use async_trait::async_trait;

use crate::{CaptureError, CaptureRequest, Collector, Observation};
use tw_types::MetricKind;

#[derive(Debug, Default)]
pub struct KubernetesCollector;

impl KubernetesCollector {
    pub fn new() -> Self {
        Self
    }

    fn parse(rendered: &str, what: &str) -> Result<f64, CaptureError> {
        rendered.trim().parse().map_err(|_| {
            CaptureError::permanent(format!(
                "rendered {what} query {rendered:?} is not a floating point number"
            ))
        })
    }
}

#[async_trait]
impl Collector for KubernetesCollector {
    fn kind(&self) -> MetricKind {
        MetricKind::Kubernetes
    }

    async fn capture(&self, request: &CaptureRequest<'_>) -> Result<Observation, CaptureError> {
        let value = Self::parse(&request.query, "result")?;
        let error = match &request.error_query {
            Some(rendered) => Self::parse(rendered, "error")?,
            None => 0.0,
        };
        Ok(Observation { value, error })
    }
}
