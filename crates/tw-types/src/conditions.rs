//! Condition bookkeeping shared by experiments and trials.
//!
//! Conditions are monotone: once a condition reaches `True` it never leaves
//! it. `last_probe_time` moves on every evaluation; `last_transition_time`
//! only when the status actually changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition types tracked on a trial, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrialConditionType {
    SetupCreated,
    Patched,
    Ready,
    Observed,
    SetupDeleted,
    Complete,
    Failed,
}

/// Condition types tracked on an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExperimentConditionType {
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition<T> {
    #[serde(rename = "type")]
    pub condition_type: T,
    pub status: ConditionStatus,
    pub last_probe_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Record an observation of `condition_type`. Inserts the condition if absent.
/// A condition already at `True` is never downgraded; its probe time still
/// advances.
pub fn apply_condition<T: PartialEq + Copy>(
    conditions: &mut Vec<Condition<T>>,
    condition_type: T,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        existing.last_probe_time = now;
        if existing.status == ConditionStatus::True {
            return;
        }
        if existing.status != status {
            existing.status = status;
            existing.last_transition_time = now;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        return;
    }

    conditions.push(Condition {
        condition_type,
        status,
        last_probe_time: now,
        last_transition_time: now,
        reason: reason.to_string(),
        message: message.to_string(),
    });
}

/// Whether `condition_type` is currently `True`. Absent conditions are not.
pub fn is_condition_true<T: PartialEq + Copy>(
    conditions: &[Condition<T>],
    condition_type: T,
) -> bool {
    conditions
        .iter()
        .any(|c| c.condition_type == condition_type && c.status == ConditionStatus::True)
}

/// Look up the current status of `condition_type`, if recorded.
pub fn condition_status<T: PartialEq + Copy>(
    conditions: &[Condition<T>],
    condition_type: T,
) -> Option<ConditionStatus> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
        .map(|c| c.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_latch_true() {
        let mut conditions = Vec::new();
        let t0 = Utc::now();

        apply_condition(
            &mut conditions,
            TrialConditionType::Patched,
            ConditionStatus::False,
            "PatchPending",
            "",
            t0,
        );
        assert_eq!(
            condition_status(&conditions, TrialConditionType::Patched),
            Some(ConditionStatus::False)
        );

        let t1 = t0 + chrono::Duration::seconds(1);
        apply_condition(
            &mut conditions,
            TrialConditionType::Patched,
            ConditionStatus::True,
            "Patched",
            "",
            t1,
        );
        assert!(is_condition_true(&conditions, TrialConditionType::Patched));
        assert_eq!(conditions[0].last_transition_time, t1);

        // A later False observation must not unlatch.
        let t2 = t1 + chrono::Duration::seconds(1);
        apply_condition(
            &mut conditions,
            TrialConditionType::Patched,
            ConditionStatus::False,
            "Regression",
            "",
            t2,
        );
        assert!(is_condition_true(&conditions, TrialConditionType::Patched));
        assert_eq!(conditions[0].last_transition_time, t1);
        assert_eq!(conditions[0].last_probe_time, t2);
    }

    #[test]
    fn probe_time_advances_without_transition() {
        let mut conditions = Vec::new();
        let t0 = Utc::now();
        apply_condition(
            &mut conditions,
            TrialConditionType::Ready,
            ConditionStatus::False,
            "Waiting",
            "",
            t0,
        );

        let t1 = t0 + chrono::Duration::seconds(10);
        apply_condition(
            &mut conditions,
            TrialConditionType::Ready,
            ConditionStatus::False,
            "Waiting",
            "",
            t1,
        );
        assert_eq!(conditions[0].last_probe_time, t1);
        assert_eq!(conditions[0].last_transition_time, t0);
    }

    #[test]
    fn absent_condition_is_not_true() {
        let conditions: Vec<Condition<TrialConditionType>> = Vec::new();
        assert!(!is_condition_true(&conditions, TrialConditionType::Complete));
        assert_eq!(
            condition_status(&conditions, TrialConditionType::Complete),
            None
        );
    }
}
