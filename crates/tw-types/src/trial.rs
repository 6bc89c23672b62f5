//! Trial records: one candidate evaluation within an experiment.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::{
    apply_condition, is_condition_true, Condition, ConditionStatus, TrialConditionType,
};
use crate::meta::ObjectMeta;
use crate::params::Assignment;
use crate::patch::{ObjectRef, PatchOperation};

/// Default attempt budget for a readiness check.
pub const DEFAULT_READINESS_ATTEMPTS: u32 = 3;
/// Default readiness re-evaluation period, seconds.
pub const DEFAULT_READINESS_PERIOD_SECONDS: u32 = 10;
/// Default attempt budget for a metric capture.
pub const DEFAULT_VALUE_ATTEMPTS: u32 = 3;

/// Reference from a trial back to its experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// A predicate over the patched workspace that must hold before the trial-run
/// job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub target_ref: ObjectRef,
    /// Condition types to verify on the target. Types under the vendor
    /// prefix are evaluated synthetically by the engine.
    pub condition_types: Vec<String>,
    #[serde(default)]
    pub initial_delay_seconds: u32,
    #[serde(default)]
    pub period_seconds: u32,
    #[serde(default)]
    pub attempts_remaining: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<DateTime<Utc>>,
}

impl ReadinessCheck {
    /// Period with the default and the one-second floor applied.
    pub fn effective_period(&self) -> Duration {
        let seconds = if self.period_seconds == 0 {
            DEFAULT_READINESS_PERIOD_SECONDS
        } else {
            self.period_seconds.max(1)
        };
        Duration::seconds(i64::from(seconds))
    }

    pub fn effective_initial_delay(&self) -> Duration {
        Duration::seconds(i64::from(self.initial_delay_seconds))
    }

    /// Attempt budget with the default and the floor of one applied.
    pub fn effective_attempts(&self) -> u32 {
        if self.attempts_remaining == 0 {
            DEFAULT_READINESS_ATTEMPTS
        } else {
            self.attempts_remaining
        }
    }
}

/// One observed metric outcome on a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialValue {
    pub name: String,
    /// String-encoded float; empty until captured.
    #[serde(default)]
    pub value: String,
    /// String-encoded error bound.
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub attempts_remaining: u32,
}

impl TrialValue {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: String::new(),
            error: String::new(),
            attempts_remaining: DEFAULT_VALUE_ATTEMPTS,
        }
    }

    pub fn is_captured(&self) -> bool {
        !self.value.is_empty()
    }

    pub fn value_f64(&self) -> Option<f64> {
        self.value.parse().ok()
    }

    /// Record a captured observation and zero the attempt counter.
    pub fn record(&mut self, value: f64, error: f64) {
        self.value = format_float(value);
        self.error = format_float(error);
        self.attempts_remaining = 0;
    }
}

/// Render a float the way summaries and the wire expect: integral values
/// without a trailing `.0`.
pub fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// A named task run before (and torn down after) the trial-run job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupTask {
    pub name: String,
    /// Object payload materialized into the workspace for this task.
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// Observed status of a trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialStatus {
    /// Effective start of the trial window, offset-adjusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_runtime_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<TrialValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition<TrialConditionType>>,
    /// Human-readable `name=value` list of the trial's assignments.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assignment_summary: String,
    /// Human-readable `name=value` list of the captured values.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value_summary: String,
}

/// One candidate evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_ref: Option<ExperimentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<Assignment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patch_operations: Vec<PatchOperation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_checks: Vec<ReadinessCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_tasks: Vec<SetupTask>,
    /// Prototype of the trial-run job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_template: Option<serde_json::Value>,
    /// Subtracted from the observed job start when recording `start_time`.
    #[serde(default)]
    pub start_time_offset_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_failure: Option<u32>,
    #[serde(default)]
    pub status: TrialStatus,
}

impl Trial {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name, namespace),
            ..Default::default()
        }
    }

    // -- condition helpers --------------------------------------------------

    pub fn is_condition_true(&self, condition_type: TrialConditionType) -> bool {
        is_condition_true(&self.status.conditions, condition_type)
    }

    pub fn apply_condition(
        &mut self,
        condition_type: TrialConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        apply_condition(
            &mut self.status.conditions,
            condition_type,
            status,
            reason,
            message,
            now,
        );
    }

    pub fn is_complete(&self) -> bool {
        self.is_condition_true(TrialConditionType::Complete)
    }

    pub fn is_failed(&self) -> bool {
        self.is_condition_true(TrialConditionType::Failed)
    }

    /// A trial is finished once either terminal condition is latched.
    pub fn is_finished(&self) -> bool {
        self.is_complete() || self.is_failed()
    }

    /// Deleted before reaching a terminal condition.
    pub fn is_abandoned(&self) -> bool {
        self.metadata.is_deleted() && !self.is_finished()
    }

    /// Counts toward the experiment's replica cap.
    pub fn is_active(&self) -> bool {
        !self.is_finished() && !self.metadata.is_deleted()
    }

    /// When the finished trial record (and its workspace) may be deleted.
    pub fn ttl_deadline(&self) -> Option<DateTime<Utc>> {
        if !self.is_finished() {
            return None;
        }
        let finished_at = self.finished_at()?;
        let ttl = if self.is_failed() {
            self.ttl_seconds_after_failure
                .or(self.ttl_seconds_after_finished)
        } else {
            self.ttl_seconds_after_finished
        }?;
        Some(finished_at + Duration::seconds(i64::from(ttl)))
    }

    /// Timestamp of the terminal condition transition.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.status
            .conditions
            .iter()
            .filter(|c| {
                matches!(
                    c.condition_type,
                    TrialConditionType::Complete | TrialConditionType::Failed
                ) && c.status == ConditionStatus::True
            })
            .map(|c| c.last_transition_time)
            .max()
    }

    /// Rebuild the human-readable assignment and value summaries.
    pub fn update_summary(&mut self) {
        self.status.assignment_summary = self
            .assignments
            .iter()
            .map(|a| format!("{}={}", a.name, a.value))
            .collect::<Vec<_>>()
            .join(", ");
        self.status.value_summary = self
            .status
            .values
            .iter()
            .filter(|v| v.is_captured())
            .map(|v| format!("{}={}", v.name, v.value))
            .collect::<Vec<_>>()
            .join(", ");
    }
}

/// Prototype from which the experiment controller spawns trial records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_tasks: Vec<SetupTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_checks: Vec<ReadinessCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_template: Option<serde_json::Value>,
    #[serde(default)]
    pub start_time_offset_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_failure: Option<u32>,
}

impl TrialTemplate {
    /// Copy the template into a fresh trial record.
    pub fn instantiate(&self) -> Trial {
        Trial {
            metadata: self.metadata.clone(),
            experiment_ref: None,
            assignments: Vec::new(),
            patch_operations: Vec::new(),
            readiness_checks: self.readiness_checks.clone(),
            setup_tasks: self.setup_tasks.clone(),
            job_template: self.job_template.clone(),
            start_time_offset_seconds: self.start_time_offset_seconds,
            ttl_seconds_after_finished: self.ttl_seconds_after_finished,
            ttl_seconds_after_failure: self.ttl_seconds_after_failure,
            status: TrialStatus::default(),
        }
    }
}
