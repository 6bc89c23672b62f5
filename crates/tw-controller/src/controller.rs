//! The experiment reconciler.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::allocate;
use crate::sync::SyncOutcome;
use tw_api::{ApiError, Optimizer};
use tw_engine::{WorkspaceClient, WorkspaceError};
use tw_types::{
    apply_condition, experiment_phase, is_condition_true, ConditionStatus, Experiment,
    ExperimentConditionType, ServerSyncPolicy, Trial, ANNOTATION_EXPERIMENT_URL,
    ANNOTATION_NEXT_TRIAL_URL, FINALIZER_SERVER_SYNC, LABEL_EXPERIMENT,
};

const TRANSIENT_RETRY: Duration = Duration::from_secs(5);
const SYNC_RETRY: Duration = Duration::from_secs(30);
const NAMESPACE_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("optimizer error: {0}")]
    Api(#[from] ApiError),
}

/// Result of one experiment reconcile pass.
#[derive(Debug)]
pub struct ExperimentOutcome {
    pub experiment: Experiment,
    pub requeue_after: Option<Duration>,
}

/// Experiment-level control loop.
pub struct ExperimentController {
    pub(crate) workspace: Arc<dyn WorkspaceClient>,
    pub(crate) optimizer: Arc<dyn Optimizer>,
}

impl ExperimentController {
    pub fn new(workspace: Arc<dyn WorkspaceClient>, optimizer: Arc<dyn Optimizer>) -> Self {
        Self {
            workspace,
            optimizer,
        }
    }

    pub async fn reconcile(
        &self,
        experiment: &Experiment,
    ) -> Result<ExperimentOutcome, ControllerError> {
        let mut experiment = experiment.clone();
        let now = Utc::now();
        let mut trials = self
            .workspace
            .list_trials(LABEL_EXPERIMENT, &experiment.metadata.name)
            .await?;

        if experiment.metadata.is_deleted() {
            return self.finalize_deletion(experiment, trials, now).await;
        }

        if let Err(e) = experiment.validate() {
            if !is_finished(&experiment) {
                fail_experiment(&mut experiment, "InvalidExperiment", &e.to_string(), now);
                experiment.replicas = Some(0);
            }
            return self.persist(experiment, &trials, None).await;
        }

        let mut requeue: Option<Duration> = None;

        if experiment.server_sync().is_enabled() && !is_finished(&experiment) {
            match self.sync_remote(&mut experiment, now).await? {
                SyncOutcome::Synced => {}
                SyncOutcome::Requeue(after) => push_requeue(&mut requeue, after),
            }
        }

        if !is_finished(&experiment) {
            if let Some(after) = self.allocate_trials(&mut experiment, &mut trials, now).await? {
                push_requeue(&mut requeue, after);
            }
        }

        self.persist(experiment, &trials, requeue).await
    }

    /// Keep requesting assignments until the replica cap is met, a workspace
    /// is unavailable, or the remote stops the experiment.
    async fn allocate_trials(
        &self,
        experiment: &mut Experiment,
        trials: &mut Vec<Trial>,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, ControllerError> {
        let replicas = experiment.replicas();
        let mut active = trials.iter().filter(|t| t.is_active()).count() as i32;
        if active >= replicas {
            return Ok(None);
        }
        let Some(next_url) = experiment
            .metadata
            .annotation(ANNOTATION_NEXT_TRIAL_URL)
            .map(str::to_string)
        else {
            return Ok(None);
        };

        while active < replicas {
            // Locate a workspace first so an assignment is never dropped.
            let namespace =
                match allocate::choose_namespace(self.workspace.as_ref(), experiment, trials)
                    .await
                {
                    Ok(Some(namespace)) => namespace,
                    Ok(None) => {
                        debug!(experiment = %experiment.metadata.name, "no free trial namespace");
                        return Ok(Some(NAMESPACE_RETRY));
                    }
                    Err(WorkspaceError::Forbidden(message)) => {
                        warn!(%message, "namespace allocation forbidden");
                        return Ok(Some(NAMESPACE_RETRY));
                    }
                    Err(e) => return Err(e.into()),
                };

            match self.optimizer.next_trial(&next_url).await {
                Ok(suggestion) => {
                    let trial = allocate::bootstrap_trial(experiment, &suggestion, &namespace);
                    match self.workspace.create_trial(&trial).await {
                        Ok(created) => {
                            info!(
                                experiment = %experiment.metadata.name,
                                trial = %created.metadata.name,
                                namespace = %namespace,
                                "trial created"
                            );
                            trials.push(created);
                            active += 1;
                        }
                        Err(WorkspaceError::Conflict(_)) => {
                            // The suggestion already has a trial; count it.
                            active += 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(ApiError::ExperimentStopped) => {
                    info!(experiment = %experiment.metadata.name, "experiment stopped by remote");
                    experiment.replicas = Some(0);
                    experiment
                        .metadata
                        .remove_annotation(ANNOTATION_NEXT_TRIAL_URL);
                    apply_condition(
                        &mut experiment.status.conditions,
                        ExperimentConditionType::Complete,
                        ConditionStatus::True,
                        "ExperimentStopped",
                        "the remote optimizer has no further assignments",
                        now,
                    );
                    return Ok(None);
                }
                Err(ApiError::TrialUnavailable { retry_after }) => {
                    return Ok(Some(retry_after));
                }
                Err(ApiError::Unauthorized) => {
                    self.note_unauthorized(experiment, now);
                    return Ok(Some(SYNC_RETRY));
                }
                Err(e) => {
                    warn!(error = %e, "next-trial request failed");
                    return Ok(Some(SYNC_RETRY));
                }
            }
        }
        Ok(None)
    }

    /// Deletion: drive child trials to terminal state, honour the
    /// server-sync policy, then release the finalizer.
    async fn finalize_deletion(
        &self,
        mut experiment: Experiment,
        trials: Vec<Trial>,
        now: DateTime<Utc>,
    ) -> Result<ExperimentOutcome, ControllerError> {
        if experiment.metadata.has_finalizer(FINALIZER_SERVER_SYNC) {
            experiment.replicas = Some(0);

            let mut settling = false;
            for trial in &trials {
                if trial.metadata.is_deleted() {
                    settling = true;
                    continue;
                }
                // Every remaining child goes through the trial engine's
                // deletion path: active ones are abandoned remotely first.
                let mut doomed = trial.clone();
                doomed.metadata.deletion_timestamp = Some(now);
                match self.workspace.update_trial(&doomed).await {
                    Ok(_) | Err(WorkspaceError::Conflict(_))
                    | Err(WorkspaceError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                settling = true;
            }
            if settling {
                // Child trials must be abandoned or reported first.
                return self.persist(experiment, &trials, Some(TRANSIENT_RETRY)).await;
            }

            if experiment.server_sync() == ServerSyncPolicy::DeleteCompleted {
                if let Some(url) = experiment
                    .metadata
                    .annotation(ANNOTATION_EXPERIMENT_URL)
                    .map(str::to_string)
                {
                    match self.optimizer.delete_experiment(&url).await {
                        Ok(()) => {
                            info!(experiment = %experiment.metadata.name, "remote experiment deleted")
                        }
                        Err(ApiError::ExperimentNotFound) => {}
                        Err(e) if e.is_retryable() => {
                            return self
                                .persist(experiment, &trials, Some(TRANSIENT_RETRY))
                                .await;
                        }
                        Err(e) => warn!(error = %e, "remote experiment delete failed"),
                    }
                }
            }

            experiment.metadata.remove_finalizer(FINALIZER_SERVER_SYNC);
            match self.workspace.update_experiment(&experiment).await {
                Ok(updated) => experiment = updated,
                Err(WorkspaceError::Conflict(_)) => {
                    return Ok(ExperimentOutcome {
                        experiment,
                        requeue_after: Some(TRANSIENT_RETRY),
                    });
                }
                Err(WorkspaceError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        match self
            .workspace
            .delete_experiment(&experiment.metadata.namespace, &experiment.metadata.name)
            .await
        {
            Ok(()) | Err(WorkspaceError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(experiment = %experiment.metadata.name, "experiment deleted");
        Ok(ExperimentOutcome {
            experiment,
            requeue_after: None,
        })
    }

    /// Recompute derived status and write the experiment back.
    async fn persist(
        &self,
        mut experiment: Experiment,
        trials: &[Trial],
        requeue: Option<Duration>,
    ) -> Result<ExperimentOutcome, ControllerError> {
        experiment.status.active_trials = trials.iter().filter(|t| t.is_active()).count() as i32;
        experiment.status.phase = experiment_phase(&experiment, trials).to_string();

        match self.workspace.update_experiment(&experiment).await {
            Ok(updated) => Ok(ExperimentOutcome {
                experiment: updated,
                requeue_after: requeue,
            }),
            Err(e) if e.is_transient() => Ok(ExperimentOutcome {
                experiment,
                requeue_after: Some(TRANSIENT_RETRY),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn is_finished(experiment: &Experiment) -> bool {
    is_condition_true(
        &experiment.status.conditions,
        ExperimentConditionType::Complete,
    ) || is_condition_true(
        &experiment.status.conditions,
        ExperimentConditionType::Failed,
    )
}

pub(crate) fn fail_experiment(
    experiment: &mut Experiment,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    apply_condition(
        &mut experiment.status.conditions,
        ExperimentConditionType::Failed,
        ConditionStatus::True,
        reason,
        message,
        now,
    );
    warn!(experiment = %experiment.metadata.name, %reason, %message, "experiment failed");
}

fn push_requeue(requeue: &mut Option<Duration>, after: Duration) {
    *requeue = Some(match requeue {
        Some(existing) => (*existing).min(after),
        None => after,
    });
}
