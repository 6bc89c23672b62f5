//! Metric capture orchestration.
//!
//! Metrics are captured in declaration order, each with its own attempt
//! budget. A retryable collector error backs off without spending an
//! attempt; a permanent error spends one and, on exhaustion, fails the
//! trial. Captured values must satisfy the metric's declared bounds.

use std::time::Duration;
use tracing::{debug, warn};

use crate::render::Renderer;
use crate::workspace::WorkspaceClient;
use tw_collect::{
    resolve_url, CaptureError, CaptureRequest, CollectorSet, ObservationWindow,
};
use tw_types::{Experiment, Trial, TrialValue};

const PERMANENT_RETRY: Duration = Duration::from_secs(10);

/// Result of one capture pass over a trial's metrics.
#[derive(Debug, PartialEq)]
pub enum CaptureOutcome {
    /// Every metric has a recorded value.
    Complete,
    /// Some metrics are still pending; ask again after the delay.
    Wait { after: Duration },
    /// A metric exhausted its budget, rendered badly, or broke its bounds.
    Failed { reason: String, message: String },
}

/// Capture every still-pending metric value for the trial. Mutates the
/// trial's value entries.
pub async fn capture(
    workspace: &dyn WorkspaceClient,
    collectors: &CollectorSet,
    renderer: &dyn Renderer,
    experiment: &Experiment,
    trial: &mut Trial,
) -> Result<CaptureOutcome, crate::workspace::WorkspaceError> {
    let (Some(start), Some(completion)) =
        (trial.status.start_time, trial.status.completion_time)
    else {
        return Ok(CaptureOutcome::Wait {
            after: Duration::from_secs(5),
        });
    };
    let window = ObservationWindow { start, completion };

    // One pending entry per declared metric, in declaration order.
    for metric in &experiment.metrics {
        if !trial.status.values.iter().any(|v| v.name == metric.name) {
            trial.status.values.push(TrialValue::pending(&metric.name));
        }
    }

    let mut wait: Option<Duration> = None;

    for metric in &experiment.metrics {
        let Some(entry_index) = trial
            .status
            .values
            .iter()
            .position(|v| v.name == metric.name)
        else {
            continue;
        };
        if trial.status.values[entry_index].is_captured() {
            continue;
        }

        // An unregistered collector kind can never succeed; fail outright
        // rather than spending the attempt budget.
        if !tw_collect::supports(collectors, metric) {
            return Ok(CaptureOutcome::Failed {
                reason: "UnknownMetricType".to_string(),
                message: format!("no collector for metric type {}", metric.kind),
            });
        }

        let (query, error_query) = match renderer.render_metric_query(trial, metric, &window) {
            Ok(rendered) => rendered,
            Err(e) => {
                return Ok(CaptureOutcome::Failed {
                    reason: "MetricQueryRender".to_string(),
                    message: format!("rendering query for {}: {e}", metric.name),
                });
            }
        };

        let url = match resolve_endpoint(workspace, trial, metric).await? {
            Ok(url) => url,
            Err(message) => {
                match spend_attempt(&mut trial.status.values[entry_index], metric, &message) {
                    Some(outcome) => return Ok(outcome),
                    None => {
                        push_wait(&mut wait, PERMANENT_RETRY);
                        continue;
                    }
                }
            }
        };

        let request = CaptureRequest {
            metric,
            query,
            error_query,
            url,
            window,
        };
        match collectors.capture(&request).await {
            Ok(observation) => {
                if !metric.in_bounds(observation.value) {
                    return Ok(CaptureOutcome::Failed {
                        reason: "MetricBound".to_string(),
                        message: format!(
                            "value {} for {} is outside the acceptable range",
                            observation.value, metric.name
                        ),
                    });
                }
                debug!(metric = %metric.name, value = observation.value, "captured metric");
                trial.status.values[entry_index].record(observation.value, observation.error);
            }
            Err(CaptureError::Retryable { after }) => {
                debug!(metric = %metric.name, ?after, "collector not ready");
                push_wait(&mut wait, after);
            }
            Err(CaptureError::Permanent { reason }) => {
                match spend_attempt(&mut trial.status.values[entry_index], metric, &reason) {
                    Some(outcome) => return Ok(outcome),
                    None => push_wait(&mut wait, PERMANENT_RETRY),
                }
            }
        }
    }

    if trial.status.values.iter().all(TrialValue::is_captured) {
        return Ok(CaptureOutcome::Complete);
    }
    Ok(CaptureOutcome::Wait {
        after: wait.unwrap_or(PERMANENT_RETRY),
    })
}

/// Spend one attempt on a failed capture. Returns the terminal outcome once
/// the budget is gone.
fn spend_attempt(
    entry: &mut TrialValue,
    metric: &tw_types::Metric,
    reason: &str,
) -> Option<CaptureOutcome> {
    entry.attempts_remaining = entry.attempts_remaining.saturating_sub(1);
    warn!(
        metric = %metric.name,
        attempts_remaining = entry.attempts_remaining,
        %reason,
        "metric capture failed"
    );
    if entry.attempts_remaining == 0 {
        return Some(CaptureOutcome::Failed {
            reason: "MetricFailed".to_string(),
            message: format!("capturing {}: {reason}", metric.name),
        });
    }
    None
}

/// Resolve the endpoint a metric should be captured from, if it needs one.
/// The inner `Err` is a permanent resolution failure.
async fn resolve_endpoint(
    workspace: &dyn WorkspaceClient,
    trial: &Trial,
    metric: &tw_types::Metric,
) -> Result<Result<Option<String>, String>, crate::workspace::WorkspaceError> {
    if metric.url.is_some() {
        return Ok(Ok(metric.url.clone()));
    }
    let Some(selector) = &metric.selector else {
        return Ok(Ok(None));
    };
    let services = workspace
        .list_services(&trial.metadata.namespace, selector)
        .await?;
    match resolve_url(metric, &services) {
        Ok(url) => Ok(Ok(Some(url))),
        Err(e) => Ok(Err(e.to_string())),
    }
}

fn push_wait(wait: &mut Option<Duration>, after: Duration) {
    *wait = Some(match wait {
        Some(existing) => (*existing).min(after),
        None => after,
    });
}
