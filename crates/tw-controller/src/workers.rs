//! Worker loops: pull keys from the queues, load objects, reconcile, and
//! honour requeue hints. Reconciles are at-least-once; workers never hold
//! state between items.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::controller::ExperimentController;
use crate::queue::WorkQueue;
use tw_engine::{TrialEngine, WorkspaceClient, WorkspaceError};
use tw_types::LABEL_EXPERIMENT;

/// Work-queue key: `(namespace, name)`.
pub type Key = (String, String);

const ERROR_RETRY: Duration = Duration::from_secs(5);

pub async fn run_experiment_worker(
    queue: WorkQueue<Key>,
    controller: Arc<ExperimentController>,
    workspace: Arc<dyn WorkspaceClient>,
) {
    while let Some(key) = queue.next().await {
        let (namespace, name) = &key;
        let span = info_span!(
            "experiment_reconcile",
            experiment = %name,
            reconcile_id = %Uuid::new_v4()
        );
        match workspace.get_experiment(namespace, name).await {
            Ok(experiment) => match controller.reconcile(&experiment).instrument(span).await {
                Ok(outcome) => {
                    if let Some(after) = outcome.requeue_after {
                        queue.add_after(key.clone(), after);
                    }
                }
                Err(e) => {
                    warn!(experiment = %name, error = %e, "experiment reconcile failed");
                    queue.add_after(key.clone(), ERROR_RETRY);
                }
            },
            Err(WorkspaceError::NotFound(_)) => {
                debug!(experiment = %name, "experiment gone, dropping key");
            }
            Err(e) => {
                warn!(experiment = %name, error = %e, "experiment load failed");
                queue.add_after(key.clone(), ERROR_RETRY);
            }
        }
        queue.done(&key);
    }
}

pub async fn run_trial_worker(
    queue: WorkQueue<Key>,
    engine: Arc<TrialEngine>,
    workspace: Arc<dyn WorkspaceClient>,
) {
    while let Some(key) = queue.next().await {
        let (namespace, name) = &key;
        match workspace.get_trial(namespace, name).await {
            Ok(trial) => {
                let experiment_ref = trial.experiment_ref.clone().unwrap_or_default();
                match workspace
                    .get_experiment(&experiment_ref.namespace, &experiment_ref.name)
                    .await
                {
                    Ok(experiment) => {
                        let span = info_span!(
                            "trial_reconcile",
                            trial = %name,
                            reconcile_id = %Uuid::new_v4()
                        );
                        match engine.reconcile(&experiment, &trial).instrument(span).await {
                            Ok(outcome) => {
                                if let Some(after) = outcome.requeue_after {
                                    queue.add_after(key.clone(), after);
                                }
                            }
                            Err(e) => {
                                warn!(trial = %name, error = %e, "trial reconcile failed");
                                queue.add_after(key.clone(), ERROR_RETRY);
                            }
                        }
                    }
                    Err(WorkspaceError::NotFound(_)) => {
                        warn!(trial = %name, "trial references a missing experiment");
                        queue.add_after(key.clone(), Duration::from_secs(30));
                    }
                    Err(e) => {
                        warn!(trial = %name, error = %e, "experiment load failed");
                        queue.add_after(key.clone(), ERROR_RETRY);
                    }
                }
            }
            Err(WorkspaceError::NotFound(_)) => {
                debug!(trial = %name, "trial gone, dropping key");
            }
            Err(e) => {
                warn!(trial = %name, error = %e, "trial load failed");
                queue.add_after(key.clone(), ERROR_RETRY);
            }
        }
        queue.done(&key);
    }
}

/// Periodic resync: list everything and enqueue it, so missed events are
/// eventually repaired.
pub async fn run_resync(
    workspace: Arc<dyn WorkspaceClient>,
    experiment_queue: WorkQueue<Key>,
    trial_queue: WorkQueue<Key>,
    period: Duration,
) {
    loop {
        match workspace.list_experiments().await {
            Ok(experiments) => {
                for experiment in experiments {
                    let key = (
                        experiment.metadata.namespace.clone(),
                        experiment.metadata.name.clone(),
                    );
                    experiment_queue.add(key);

                    match workspace
                        .list_trials(LABEL_EXPERIMENT, &experiment.metadata.name)
                        .await
                    {
                        Ok(trials) => {
                            for trial in trials {
                                trial_queue.add((
                                    trial.metadata.namespace.clone(),
                                    trial.metadata.name.clone(),
                                ));
                            }
                        }
                        Err(e) => warn!(error = %e, "trial list failed during resync"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "experiment list failed during resync"),
        }
        tokio::time::sleep(period).await;
    }
}
