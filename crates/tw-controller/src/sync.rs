//! Remote synchronization of the experiment definition.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

use crate::controller::{fail_experiment, ControllerError, ExperimentController};
use tw_api::{assignments_to_wire, to_server_experiment, ApiError, TrialAssignments, LABEL_BASELINE};
use tw_types::{
    Experiment, ANNOTATION_EXPERIMENT_URL, ANNOTATION_NEXT_TRIAL_URL, FINALIZER_SERVER_SYNC,
};

const SYNC_RETRY: Duration = Duration::from_secs(30);

/// Unauthorized responses tolerated before the experiment is failed.
const UNAUTHORIZED_LIMIT: u32 = 3;
const ANNOTATION_UNAUTHORIZED_ATTEMPTS: &str = "tunewise.io/unauthorized-attempts";

pub(crate) enum SyncOutcome {
    Synced,
    Requeue(Duration),
}

impl ExperimentController {
    /// Create the experiment on the remote service the first time through;
    /// afterwards refresh the next-trial link as needed.
    pub(crate) async fn sync_remote(
        &self,
        experiment: &mut Experiment,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, ControllerError> {
        if experiment
            .metadata
            .annotation(ANNOTATION_EXPERIMENT_URL)
            .is_none()
        {
            return self.create_remote(experiment, now).await;
        }
        self.refresh_links(experiment, now).await
    }

    async fn create_remote(
        &self,
        experiment: &mut Experiment,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, ControllerError> {
        let server = to_server_experiment(experiment);
        match self
            .optimizer
            .create_experiment(&experiment.metadata.name, &server)
            .await
        {
            Ok((echoed, links)) => {
                if let Some(url) = links.self_url {
                    experiment
                        .metadata
                        .set_annotation(ANNOTATION_EXPERIMENT_URL, url);
                }
                if let Some(url) = links.next_trial_url {
                    experiment
                        .metadata
                        .set_annotation(ANNOTATION_NEXT_TRIAL_URL, url);
                }
                experiment.metadata.add_finalizer(FINALIZER_SERVER_SYNC);
                experiment
                    .metadata
                    .remove_annotation(ANNOTATION_UNAUTHORIZED_ATTEMPTS);

                // The remote may adjust the optimization knobs.
                if !echoed.optimization.is_empty() {
                    experiment.optimization = echoed.optimization;
                }

                info!(experiment = %experiment.metadata.name, "experiment synchronized");
                self.seed_baseline(experiment, links.trials_url.as_deref())
                    .await;
                Ok(SyncOutcome::Synced)
            }
            Err(ApiError::Unauthorized) => {
                self.note_unauthorized(experiment, now);
                Ok(SyncOutcome::Requeue(SYNC_RETRY))
            }
            Err(e) if e.is_retryable() => Ok(SyncOutcome::Requeue(SYNC_RETRY)),
            Err(e) => {
                fail_experiment(experiment, "SyncFailed", &e.to_string(), now);
                experiment.replicas = Some(0);
                Ok(SyncOutcome::Synced)
            }
        }
    }

    /// Send the baseline assignments once, labeled as such. Validity was
    /// established before the experiment reached the remote.
    async fn seed_baseline(&self, experiment: &Experiment, trials_url: Option<&str>) {
        let Ok(Some(baseline)) = experiment.baseline_assignments() else {
            return;
        };
        let Some(trials_url) = trials_url else {
            return;
        };
        let request = TrialAssignments {
            assignments: assignments_to_wire(&baseline),
            labels: [(LABEL_BASELINE.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        };
        match self.optimizer.create_trial(trials_url, &request).await {
            Ok(location) => {
                info!(experiment = %experiment.metadata.name, %location, "baseline trial created")
            }
            Err(ApiError::ExperimentStopped) => {}
            Err(e) => warn!(error = %e, "baseline trial creation failed"),
        }
    }

    async fn refresh_links(
        &self,
        experiment: &mut Experiment,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, ControllerError> {
        if experiment
            .metadata
            .annotation(ANNOTATION_NEXT_TRIAL_URL)
            .is_some()
        {
            return Ok(SyncOutcome::Synced);
        }
        if crate::controller::is_finished(experiment) {
            return Ok(SyncOutcome::Synced);
        }
        let url = experiment
            .metadata
            .annotation(ANNOTATION_EXPERIMENT_URL)
            .map(str::to_string)
            .unwrap_or_default();

        match self.optimizer.get_experiment(&url).await {
            Ok((_, links)) => {
                if let Some(next) = links.next_trial_url {
                    experiment
                        .metadata
                        .set_annotation(ANNOTATION_NEXT_TRIAL_URL, next);
                }
                Ok(SyncOutcome::Synced)
            }
            // The remote no longer knows the experiment; nothing to refresh.
            Err(ApiError::ExperimentNotFound) => Ok(SyncOutcome::Synced),
            Err(ApiError::Unauthorized) => {
                self.note_unauthorized(experiment, now);
                Ok(SyncOutcome::Requeue(SYNC_RETRY))
            }
            Err(e) => {
                warn!(error = %e, "experiment link refresh failed");
                Ok(SyncOutcome::Requeue(SYNC_RETRY))
            }
        }
    }

    /// Count an unauthorized response; repeated ones fail the experiment and
    /// force replicas to zero.
    pub(crate) fn note_unauthorized(&self, experiment: &mut Experiment, now: DateTime<Utc>) {
        let attempts: u32 = experiment
            .metadata
            .annotation(ANNOTATION_UNAUTHORIZED_ATTEMPTS)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
            + 1;
        experiment
            .metadata
            .set_annotation(ANNOTATION_UNAUTHORIZED_ATTEMPTS, attempts.to_string());
        warn!(
            experiment = %experiment.metadata.name,
            attempts,
            "unauthorized response from optimizer"
        );
        if attempts >= UNAUTHORIZED_LIMIT {
            fail_experiment(
                experiment,
                "Unauthorized",
                "the remote optimizer rejected our credentials",
                now,
            );
            experiment.replicas = Some(0);
        }
    }
}
