//! Coarse human-readable phase derivation for experiments and trials.

use serde::{Deserialize, Serialize};

use crate::conditions::{ExperimentConditionType, TrialConditionType};
use crate::experiment::Experiment;
use crate::trial::Trial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentPhase {
    Created,
    Paused,
    Empty,
    Idle,
    Running,
    Completed,
    Failed,
    Deleted,
}

impl std::fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Paused => "Paused",
            Self::Empty => "Never run",
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// Derive the experiment phase from the experiment and its child trials.
/// Total over all inputs; first matching rule wins.
pub fn experiment_phase(experiment: &Experiment, trials: &[Trial]) -> ExperimentPhase {
    if experiment.metadata.is_deleted() {
        return ExperimentPhase::Deleted;
    }
    if crate::conditions::is_condition_true(
        &experiment.status.conditions,
        ExperimentConditionType::Failed,
    ) {
        return ExperimentPhase::Failed;
    }
    if crate::conditions::is_condition_true(
        &experiment.status.conditions,
        ExperimentConditionType::Complete,
    ) {
        return ExperimentPhase::Completed;
    }
    if trials.iter().any(Trial::is_active) {
        return ExperimentPhase::Running;
    }
    if experiment.replicas() == 0 {
        return ExperimentPhase::Paused;
    }
    if trials.is_empty() {
        return if experiment.server_sync().is_enabled() {
            ExperimentPhase::Created
        } else {
            ExperimentPhase::Empty
        };
    }
    ExperimentPhase::Idle
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialPhase {
    Created,
    Setup,
    Patched,
    Running,
    Captured,
    Completed,
    Failed,
}

impl std::fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Setup => "Setup",
            Self::Patched => "Patched",
            Self::Running => "Running",
            Self::Captured => "Captured",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Derive the trial's display phase from its conditions.
pub fn trial_phase(trial: &Trial) -> TrialPhase {
    if trial.is_condition_true(TrialConditionType::Failed) {
        return TrialPhase::Failed;
    }
    if trial.is_condition_true(TrialConditionType::Complete) {
        return TrialPhase::Completed;
    }
    if trial.is_condition_true(TrialConditionType::Observed) {
        return TrialPhase::Captured;
    }
    if trial.is_condition_true(TrialConditionType::Ready) {
        return TrialPhase::Running;
    }
    if trial.is_condition_true(TrialConditionType::Patched) {
        return TrialPhase::Patched;
    }
    if trial.is_condition_true(TrialConditionType::SetupCreated) {
        return TrialPhase::Setup;
    }
    TrialPhase::Created
}
