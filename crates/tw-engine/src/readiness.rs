//! Readiness check evaluation.
//!
//! Checks run after the trial is patched and gate the trial-run job. A
//! condition type under the vendor prefix is evaluated synthetically by the
//! engine; any other type must appear as a `True` status condition on the
//! target object.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::debug;

use crate::workspace::{WorkspaceClient, WorkspaceError};
use tw_types::{ReadinessCheck, Trial, VENDOR_PREFIX};

/// Synthetic condition that always holds; useful as a fixed settle delay.
pub const CONDITION_ALWAYS_TRUE: &str = "tunewise.io/always-true";

/// Result of evaluating all of a trial's readiness checks.
#[derive(Debug, PartialEq)]
pub enum ReadinessOutcome {
    /// Every check is satisfied; carries the longest initial delay so the
    /// caller can back-date the trial start.
    Satisfied { max_initial_delay: ChronoDuration },
    /// Not settled yet; ask again after the delay.
    Wait { after: Duration },
    /// A check ran out of attempts or named an unknown synthetic condition.
    Failed { reason: String, message: String },
}

/// Evaluate every readiness check. Mutates per-check bookkeeping
/// (`last_check_time`, `attempts_remaining`) on the trial.
pub async fn evaluate(
    workspace: &dyn WorkspaceClient,
    trial: &mut Trial,
    patched_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<ReadinessOutcome, WorkspaceError> {
    let mut max_initial_delay = ChronoDuration::zero();
    let mut wait: Option<Duration> = None;

    let mut checks = std::mem::take(&mut trial.readiness_checks);
    let mut failure: Option<(String, String)> = None;

    for check in &mut checks {
        if failure.is_some() {
            break;
        }

        // First evaluation normalizes the attempt budget.
        if check.last_check_time.is_none() && check.attempts_remaining == 0 {
            check.attempts_remaining = check.effective_attempts();
        }
        max_initial_delay = max_initial_delay.max(check.effective_initial_delay());

        let earliest = patched_at + check.effective_initial_delay();
        if now < earliest {
            push_wait(&mut wait, until(now, earliest));
            continue;
        }
        if let Some(last) = check.last_check_time {
            let next = last + check.effective_period();
            if now < next {
                push_wait(&mut wait, until(now, next));
                continue;
            }
        }

        match evaluate_one(workspace, check).await? {
            CheckState::Satisfied => {}
            CheckState::Unsatisfied { detail } => {
                check.last_check_time = Some(now);
                check.attempts_remaining = check.attempts_remaining.saturating_sub(1);
                if check.attempts_remaining == 0 {
                    failure = Some((
                        "ReadinessCheckExceeded".to_string(),
                        format!("readiness check on {} failed: {detail}", check.target_ref),
                    ));
                } else {
                    debug!(target = %check.target_ref, %detail, "readiness check not satisfied");
                    push_wait(
                        &mut wait,
                        Duration::from_secs(check.effective_period().num_seconds().max(1) as u64),
                    );
                }
            }
            CheckState::UnknownSynthetic { condition_type } => {
                failure = Some((
                    "UnknownReadinessCheck".to_string(),
                    format!("unknown synthetic condition type {condition_type:?}"),
                ));
            }
        }
    }

    trial.readiness_checks = checks;

    if let Some((reason, message)) = failure {
        return Ok(ReadinessOutcome::Failed { reason, message });
    }
    match wait {
        Some(after) => Ok(ReadinessOutcome::Wait { after }),
        None => Ok(ReadinessOutcome::Satisfied { max_initial_delay }),
    }
}

enum CheckState {
    Satisfied,
    Unsatisfied { detail: String },
    UnknownSynthetic { condition_type: String },
}

async fn evaluate_one(
    workspace: &dyn WorkspaceClient,
    check: &ReadinessCheck,
) -> Result<CheckState, WorkspaceError> {
    for condition_type in &check.condition_types {
        if condition_type.starts_with(VENDOR_PREFIX) {
            if condition_type == CONDITION_ALWAYS_TRUE {
                continue;
            }
            return Ok(CheckState::UnknownSynthetic {
                condition_type: condition_type.clone(),
            });
        }

        let object = match workspace.get_object(&check.target_ref).await {
            Ok(object) => object,
            Err(e) if e.is_transient() => return Err(e),
            Err(_) => {
                return Ok(CheckState::Unsatisfied {
                    detail: format!("{} is not available", check.target_ref),
                })
            }
        };
        match object.condition_status(condition_type).as_deref() {
            Some("True") => {}
            status => {
                return Ok(CheckState::Unsatisfied {
                    detail: format!(
                        "condition {condition_type} is {}",
                        status.unwrap_or("absent")
                    ),
                })
            }
        }
    }
    Ok(CheckState::Satisfied)
}

fn until(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    Duration::from_secs((then - now).num_seconds().max(1) as u64)
}

fn push_wait(wait: &mut Option<Duration>, after: Duration) {
    *wait = Some(match wait {
        Some(existing) => (*existing).min(after),
        None => after,
    });
}
