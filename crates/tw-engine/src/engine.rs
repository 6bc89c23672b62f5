//! The trial lifecycle reconciler.
//!
//! One reconcile pass advances a trial through every transition whose
//! preconditions hold: setup creation, patch application, readiness, the
//! trial-run job, metric capture, setup teardown, and the terminal report to
//! the remote optimizer. Passes are idempotent; the persisted trial record is
//! the only state carried between them.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::job::{build_job, is_trial_job_target, job_ref, parse_job_status};
use crate::readiness::{self, ReadinessOutcome};
use crate::render::Renderer;
use crate::values::{self, CaptureOutcome};
use crate::workspace::{WorkspaceClient, WorkspaceError, WorkspaceObject};
use tw_api::{trial_values_from, ApiError, Optimizer};
use tw_collect::CollectorSet;
use tw_types::{
    ConditionStatus, Experiment, ObjectRef, PatchKind, PatchOperation, SetupTask, Trial,
    TrialConditionType, ANNOTATION_REPORT_TRIAL_URL, DEFAULT_PATCH_ATTEMPTS,
    FINALIZER_SERVER_SYNC, LABEL_EXPERIMENT, LABEL_TRIAL, LABEL_TRIAL_ROLE, TRIAL_ROLE_SETUP,
};

const TRANSIENT_RETRY: Duration = Duration::from_secs(5);
const PATCH_RETRY: Duration = Duration::from_secs(5);
const JOB_POLL: Duration = Duration::from_secs(5);
const PARKED_RETRY: Duration = Duration::from_secs(10);

/// Tracks report retries across reconciles; cleared once the remote accepts.
const ANNOTATION_REPORT_ATTEMPTS: &str = "tunewise.io/report-attempts";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("optimizer error: {0}")]
    Api(#[from] ApiError),
}

/// Result of one reconcile pass.
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// The trial as persisted (or as left when the record was deleted).
    pub trial: Trial,
    /// Requeue hint for the work queue.
    pub requeue_after: Option<Duration>,
}

enum Settled {
    /// The trial record was deleted (TTL expiry).
    Removed,
    Requeue(Option<Duration>),
}

/// Per-trial reconciliation engine.
pub struct TrialEngine {
    workspace: Arc<dyn WorkspaceClient>,
    optimizer: Arc<dyn Optimizer>,
    collectors: Arc<CollectorSet>,
    renderer: Arc<dyn Renderer>,
}

impl TrialEngine {
    pub fn new(
        workspace: Arc<dyn WorkspaceClient>,
        optimizer: Arc<dyn Optimizer>,
        collectors: Arc<CollectorSet>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            workspace,
            optimizer,
            collectors,
            renderer,
        }
    }

    /// Advance the trial by every transition whose preconditions hold and
    /// persist the result.
    pub async fn reconcile(
        &self,
        experiment: &Experiment,
        trial: &Trial,
    ) -> Result<ReconcileOutcome, EngineError> {
        let mut trial = trial.clone();
        let now = Utc::now();

        if trial.metadata.is_deleted() {
            return self.finalize_deletion(trial).await;
        }

        let requeue = if trial.is_finished() {
            match self.settle_finished(&mut trial, now).await? {
                Settled::Removed => {
                    return Ok(ReconcileOutcome {
                        trial,
                        requeue_after: None,
                    })
                }
                Settled::Requeue(requeue) => requeue,
            }
        } else {
            let advanced = self.advance(experiment, &mut trial, now).await?;
            if trial.is_finished() {
                // Report in the same pass so the remote sees the terminal
                // state promptly.
                match self.settle_finished(&mut trial, now).await? {
                    Settled::Removed => {
                        return Ok(ReconcileOutcome {
                            trial,
                            requeue_after: None,
                        })
                    }
                    Settled::Requeue(requeue) => min_requeue(advanced, requeue),
                }
            } else {
                advanced
            }
        };

        let persisted = match self.workspace.update_trial(&trial).await {
            Ok(persisted) => persisted,
            Err(e) if e.is_transient() => {
                debug!(trial = %trial.metadata.name, error = %e, "write conflict, requeueing");
                return Ok(ReconcileOutcome {
                    trial,
                    requeue_after: Some(TRANSIENT_RETRY),
                });
            }
            Err(e) => return Err(e.into()),
        };
        debug!(
            trial = %persisted.metadata.name,
            phase = %tw_types::trial_phase(&persisted),
            "trial reconciled"
        );
        Ok(ReconcileOutcome {
            trial: persisted,
            requeue_after: requeue,
        })
    }

    // -- deletion and terminal handling -------------------------------------

    /// A delete has been requested: make sure the remote has observed the
    /// terminal state, tear down owned objects, and release the finalizer.
    async fn finalize_deletion(&self, mut trial: Trial) -> Result<ReconcileOutcome, EngineError> {
        if trial.metadata.has_finalizer(FINALIZER_SERVER_SYNC) {
            if !trial.is_finished() {
                if let Some(url) = trial
                    .metadata
                    .annotation(ANNOTATION_REPORT_TRIAL_URL)
                    .map(str::to_string)
                {
                    match self.optimizer.abandon_trial(&url).await {
                        Ok(()) => info!(trial = %trial.metadata.name, "abandoned trial on remote"),
                        Err(ApiError::TrialNotFound) => {}
                        Err(e) if e.is_retryable() => {
                            return Ok(ReconcileOutcome {
                                trial,
                                requeue_after: Some(PARKED_RETRY),
                            });
                        }
                        Err(e) => {
                            warn!(trial = %trial.metadata.name, error = %e, "abandon failed");
                        }
                    }
                }
            }
            trial.metadata.remove_finalizer(FINALIZER_SERVER_SYNC);
        }

        self.workspace
            .delete_labeled(&trial.metadata.namespace, LABEL_TRIAL, &trial.metadata.name)
            .await?;
        match self
            .workspace
            .delete_trial(&trial.metadata.namespace, &trial.metadata.name)
            .await
        {
            Ok(()) | Err(WorkspaceError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(trial = %trial.metadata.name, "trial deleted");
        Ok(ReconcileOutcome {
            trial,
            requeue_after: None,
        })
    }

    /// A terminal condition is latched: ensure the remote has the report,
    /// release the finalizer, and enforce the TTL.
    async fn settle_finished(
        &self,
        trial: &mut Trial,
        now: DateTime<Utc>,
    ) -> Result<Settled, EngineError> {
        if trial.metadata.has_finalizer(FINALIZER_SERVER_SYNC) {
            match self.ensure_reported(trial).await? {
                None => {
                    trial.metadata.remove_finalizer(FINALIZER_SERVER_SYNC);
                    trial.metadata.remove_annotation(ANNOTATION_REPORT_ATTEMPTS);
                }
                Some(retry_after) => return Ok(Settled::Requeue(Some(retry_after))),
            }
        }

        if let Some(deadline) = trial.ttl_deadline() {
            if now >= deadline {
                self.workspace
                    .delete_labeled(&trial.metadata.namespace, LABEL_TRIAL, &trial.metadata.name)
                    .await?;
                match self
                    .workspace
                    .delete_trial(&trial.metadata.namespace, &trial.metadata.name)
                    .await
                {
                    Ok(()) | Err(WorkspaceError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                info!(trial = %trial.metadata.name, "trial removed after TTL");
                return Ok(Settled::Removed);
            }
            let wait = (deadline - now).num_seconds().max(1) as u64;
            return Ok(Settled::Requeue(Some(Duration::from_secs(wait))));
        }
        Ok(Settled::Requeue(None))
    }

    /// Report the trial's terminal state. Returns `None` once the remote has
    /// it (or there is nothing to report), or a backoff delay to retry.
    async fn ensure_reported(&self, trial: &mut Trial) -> Result<Option<Duration>, EngineError> {
        let Some(url) = trial
            .metadata
            .annotation(ANNOTATION_REPORT_TRIAL_URL)
            .map(str::to_string)
        else {
            return Ok(None);
        };

        let values = trial_values_from(trial);
        match self.optimizer.report_trial(&url, &values).await {
            Ok(()) => {
                info!(trial = %trial.metadata.name, failed = values.failed, "reported trial");
                Ok(None)
            }
            Err(ApiError::AlreadyReported) | Err(ApiError::TrialNotFound) => Ok(None),
            Err(e) => {
                let attempts: u32 = trial
                    .metadata
                    .annotation(ANNOTATION_REPORT_ATTEMPTS)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                trial
                    .metadata
                    .set_annotation(ANNOTATION_REPORT_ATTEMPTS, (attempts + 1).to_string());
                let delay = report_backoff(attempts);
                warn!(
                    trial = %trial.metadata.name,
                    error = %e,
                    attempt = attempts + 1,
                    ?delay,
                    "report failed, backing off"
                );
                Ok(Some(delay))
            }
        }
    }

    // -- the forward ladder --------------------------------------------------

    async fn advance(
        &self,
        experiment: &Experiment,
        trial: &mut Trial,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, EngineError> {
        // Pending initializers park the trial before anything happens.
        if trial.metadata.has_pending_initializers() {
            return Ok(Some(PARKED_RETRY));
        }
        // A trial without assignments has not started.
        if trial.assignments.is_empty() {
            return Ok(Some(PARKED_RETRY));
        }

        if trial
            .metadata
            .annotation(ANNOTATION_REPORT_TRIAL_URL)
            .is_some()
        {
            trial.metadata.add_finalizer(FINALIZER_SERVER_SYNC);
        }

        // Bad assignments fail the trial before any patch is applied.
        if !trial.is_condition_true(TrialConditionType::Patched) {
            if let Err(e) = experiment.validate_assignments(&trial.assignments) {
                self.fail(trial, "InvalidAssignments", &e.to_string(), now);
                return Ok(None);
            }
        }

        if !trial.is_condition_true(TrialConditionType::SetupCreated) {
            for task in &trial.setup_tasks {
                self.create_setup_object(trial, task).await?;
            }
            trial.apply_condition(
                TrialConditionType::SetupCreated,
                ConditionStatus::True,
                "SetupCreated",
                "",
                now,
            );
        }

        if !trial.is_condition_true(TrialConditionType::Patched)
            && trial.patch_operations.is_empty()
        {
            match self.render_patches(experiment, trial) {
                Ok(operations) if operations.is_empty() => {
                    trial.apply_condition(
                        TrialConditionType::Patched,
                        ConditionStatus::True,
                        "NothingToPatch",
                        "",
                        now,
                    );
                }
                Ok(operations) => trial.patch_operations = operations,
                Err(message) => {
                    self.fail(trial, "PatchRenderFailed", &message, now);
                    return Ok(None);
                }
            }
        }

        let mut requeue = None;

        if !trial.is_condition_true(TrialConditionType::Patched)
            && !trial.patch_operations.is_empty()
        {
            for index in 0..trial.patch_operations.len() {
                if trial.patch_operations[index].attempts_remaining == 0 {
                    continue;
                }
                let operation = trial.patch_operations[index].clone();
                match self
                    .workspace
                    .apply_patch(&operation.target_ref, operation.patch_kind, &operation.data)
                    .await
                {
                    Ok(()) => {
                        debug!(target = %operation.target_ref, "patch applied");
                        trial.patch_operations[index].attempts_remaining = 0;
                    }
                    Err(e) if e.is_transient() => {
                        push_requeue(&mut requeue, PATCH_RETRY);
                    }
                    Err(e) => {
                        let remaining = {
                            let op = &mut trial.patch_operations[index];
                            op.attempts_remaining = op.attempts_remaining.saturating_sub(1);
                            op.attempts_remaining
                        };
                        warn!(
                            target = %operation.target_ref,
                            attempts_remaining = remaining,
                            error = %e,
                            "patch failed"
                        );
                        if remaining == 0 {
                            self.fail(
                                trial,
                                "PatchFailed",
                                &format!("applying patch to {}: {e}", operation.target_ref),
                                now,
                            );
                            return Ok(None);
                        }
                        push_requeue(&mut requeue, PATCH_RETRY);
                    }
                }
            }
            if trial
                .patch_operations
                .iter()
                .all(PatchOperation::is_applied)
            {
                trial.apply_condition(
                    TrialConditionType::Patched,
                    ConditionStatus::True,
                    "Patched",
                    "",
                    now,
                );
            } else {
                return Ok(requeue);
            }
        }

        if trial.is_condition_true(TrialConditionType::Patched)
            && !trial.is_condition_true(TrialConditionType::Ready)
        {
            let patched_at = condition_time(trial, TrialConditionType::Patched).unwrap_or(now);
            match readiness::evaluate(self.workspace.as_ref(), trial, patched_at, now).await? {
                ReadinessOutcome::Satisfied { max_initial_delay } => {
                    trial.apply_condition(
                        TrialConditionType::Ready,
                        ConditionStatus::True,
                        "Ready",
                        "",
                        now,
                    );
                    let offset = ChronoDuration::seconds(trial.start_time_offset_seconds);
                    trial.status.start_time = Some(now - offset - max_initial_delay);
                }
                ReadinessOutcome::Wait { after } => return Ok(Some(after)),
                ReadinessOutcome::Failed { reason, message } => {
                    self.fail(trial, &reason, &message, now);
                    return Ok(None);
                }
            }
        }

        if trial.is_condition_true(TrialConditionType::Ready)
            && trial.status.completion_time.is_none()
        {
            let reference = job_ref(trial);
            match self.workspace.get_object(&reference).await {
                Err(WorkspaceError::NotFound(_)) => {
                    match self.workspace.create_object(&build_job(trial)).await {
                        Ok(()) | Err(WorkspaceError::Conflict(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    info!(trial = %trial.metadata.name, "trial run job created");
                    return Ok(Some(JOB_POLL));
                }
                Err(e) if e.is_transient() => return Ok(Some(TRANSIENT_RETRY)),
                Err(e) => return Err(e.into()),
                Ok(object) => {
                    let status = parse_job_status(&object);
                    if let Some(start) = status.start_time {
                        let offset = ChronoDuration::seconds(trial.start_time_offset_seconds);
                        trial.status.start_time = Some(start - offset);
                    }
                    if status.failed {
                        self.fail(trial, "TrialRunFailed", "trial run job failed", now);
                        return Ok(None);
                    }
                    match (status.succeeded, status.completion_time) {
                        (true, Some(completion)) => {
                            trial.status.completion_time = Some(completion);
                            if let Some(start) = trial.status.start_time {
                                trial.status.approximate_runtime_seconds =
                                    Some((completion - start).num_seconds());
                            }
                        }
                        _ => return Ok(Some(JOB_POLL)),
                    }
                }
            }
        }

        if trial.status.completion_time.is_some()
            && !trial.is_condition_true(TrialConditionType::Observed)
        {
            match values::capture(
                self.workspace.as_ref(),
                &self.collectors,
                self.renderer.as_ref(),
                experiment,
                trial,
            )
            .await?
            {
                CaptureOutcome::Complete => {
                    trial.apply_condition(
                        TrialConditionType::Observed,
                        ConditionStatus::True,
                        "ValuesCaptured",
                        "",
                        now,
                    );
                    trial.update_summary();
                }
                CaptureOutcome::Wait { after } => return Ok(Some(after)),
                CaptureOutcome::Failed { reason, message } => {
                    self.fail(trial, &reason, &message, now);
                    return Ok(None);
                }
            }
        }

        if trial.is_condition_true(TrialConditionType::Observed)
            && !trial.is_condition_true(TrialConditionType::SetupDeleted)
        {
            for task in &trial.setup_tasks {
                self.delete_setup_object(trial, task).await?;
            }
            trial.apply_condition(
                TrialConditionType::SetupDeleted,
                ConditionStatus::True,
                "SetupDeleted",
                "",
                now,
            );
        }

        if trial.is_condition_true(TrialConditionType::SetupDeleted) && !trial.is_failed() {
            trial.apply_condition(
                TrialConditionType::Complete,
                ConditionStatus::True,
                "Completed",
                "",
                now,
            );
            trial.update_summary();
            info!(
                trial = %trial.metadata.name,
                values = %trial.status.value_summary,
                "trial complete"
            );
        }

        Ok(requeue)
    }

    // -- helpers -------------------------------------------------------------

    /// Latch `failed=true`. A trial that already completed stays completed.
    fn fail(&self, trial: &mut Trial, reason: &str, message: &str, now: DateTime<Utc>) {
        if trial.is_complete() {
            return;
        }
        trial.apply_condition(
            TrialConditionType::Failed,
            ConditionStatus::True,
            reason,
            message,
            now,
        );
        trial.update_summary();
        warn!(trial = %trial.metadata.name, %reason, %message, "trial failed");
    }

    /// Render every patch template into a target-bound operation. Empty or
    /// null renders are skipped; a patch addressing the trial's own run job
    /// is deferred to job-submission time.
    fn render_patches(
        &self,
        experiment: &Experiment,
        trial: &Trial,
    ) -> Result<Vec<PatchOperation>, String> {
        let mut operations = Vec::new();
        for template in &experiment.patches {
            let rendered = self
                .renderer
                .render_patch(trial, template)
                .map_err(|e| e.to_string())?;
            let body = rendered.trim();
            if body.is_empty() || body == "null" {
                continue;
            }

            let mut target = match &template.target_ref {
                Some(reference) => reference.clone(),
                None => {
                    if template.kind == PatchKind::Json {
                        return Err("a JSON patch requires an explicit target".to_string());
                    }
                    let parsed: Value = serde_json::from_str(body)
                        .map_err(|e| format!("rendered patch is not valid JSON: {e}"))?;
                    ObjectRef::from_patch_body(&parsed)
                        .ok_or_else(|| "cannot determine the patch target".to_string())?
                }
            };
            if target.namespace.is_empty() {
                target.namespace = trial.metadata.namespace.clone();
            }

            let job_patch = is_trial_job_target(&target, trial);
            if job_patch && template.kind != PatchKind::Strategic {
                return Err(
                    "a patch targeting the trial run job must be a strategic merge patch"
                        .to_string(),
                );
            }

            operations.push(PatchOperation {
                target_ref: target,
                patch_kind: template.kind,
                data: body.to_string(),
                attempts_remaining: if job_patch { 0 } else { DEFAULT_PATCH_ATTEMPTS },
            });
        }
        Ok(operations)
    }

    async fn create_setup_object(
        &self,
        trial: &Trial,
        task: &SetupTask,
    ) -> Result<(), EngineError> {
        let mut object = WorkspaceObject::new(setup_ref(trial, task))
            .with_data(task.spec.clone())
            .with_label(LABEL_TRIAL, &trial.metadata.name)
            .with_label(LABEL_TRIAL_ROLE, TRIAL_ROLE_SETUP);
        if let Some(experiment) = trial.metadata.label(LABEL_EXPERIMENT) {
            object
                .labels
                .insert(LABEL_EXPERIMENT.to_string(), experiment.to_string());
        }
        match self.workspace.create_object(&object).await {
            Ok(()) | Err(WorkspaceError::Conflict(_)) => Ok(()),
            Err(WorkspaceError::Forbidden(_)) => {
                // RBAC may restrict setup objects in multi-tenant clusters.
                debug!(task = %task.name, "ignoring permission error on setup create");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_setup_object(
        &self,
        trial: &Trial,
        task: &SetupTask,
    ) -> Result<(), EngineError> {
        match self.workspace.delete_object(&setup_ref(trial, task)).await {
            Ok(()) | Err(WorkspaceError::NotFound(_)) => Ok(()),
            Err(WorkspaceError::Forbidden(_)) => {
                debug!(task = %task.name, "ignoring permission error on setup delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn setup_ref(trial: &Trial, task: &SetupTask) -> ObjectRef {
    let kind = task
        .spec
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("Job");
    ObjectRef::new(
        kind,
        format!("{}-{}", trial.metadata.name, task.name),
        &trial.metadata.namespace,
    )
}

fn condition_time(trial: &Trial, condition_type: TrialConditionType) -> Option<DateTime<Utc>> {
    trial
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == condition_type && c.status == ConditionStatus::True)
        .map(|c| c.last_transition_time)
}

fn report_backoff(attempts: u32) -> Duration {
    Duration::from_secs((5u64 << attempts.min(5)).min(120))
}

fn push_requeue(requeue: &mut Option<Duration>, after: Duration) {
    *requeue = Some(match requeue {
        Some(existing) => (*existing).min(after),
        None => after,
    });
}

fn min_requeue(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::BasicRenderer;
    use crate::workspace::MemoryWorkspace;
    use tw_api::FakeOptimizer;
    use tw_types::{Assignment, Metric, MetricKind, Parameter, PatchTemplate};

    fn engine(
        workspace: Arc<MemoryWorkspace>,
        optimizer: Arc<FakeOptimizer>,
    ) -> TrialEngine {
        let mut collectors = CollectorSet::empty();
        collectors.register(Box::new(tw_collect::KubernetesCollector::new()));
        TrialEngine::new(
            workspace,
            optimizer,
            Arc::new(collectors),
            Arc::new(BasicRenderer::new()),
        )
    }

    fn sample_experiment() -> Experiment {
        let mut exp = Experiment::new("tuning", "default");
        exp.parameters = vec![Parameter::int("cpu", 100, 1000)];
        exp.metrics = vec![Metric::new(
            "duration",
            MetricKind::Kubernetes,
            "{{duration .StartTime .CompletionTime}}",
        )];
        exp
    }

    async fn seeded_trial(workspace: &MemoryWorkspace) -> Trial {
        let mut trial = Trial::new("tuning-001", "default");
        trial.assignments = vec![Assignment::new("cpu", 250)];
        workspace.create_trial(&trial).await.unwrap()
    }

    #[test]
    fn backoff_series() {
        assert_eq!(report_backoff(0), Duration::from_secs(5));
        assert_eq!(report_backoff(1), Duration::from_secs(10));
        assert_eq!(report_backoff(3), Duration::from_secs(40));
        assert_eq!(report_backoff(10), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn invalid_assignment_fails_before_patching() {
        let workspace = Arc::new(MemoryWorkspace::new());
        let optimizer = Arc::new(FakeOptimizer::new());
        let engine = engine(workspace.clone(), optimizer);

        let experiment = sample_experiment();
        let mut trial = Trial::new("tuning-001", "default");
        trial.assignments = vec![Assignment::new("cpu", 5000)]; // out of domain
        let trial = workspace.create_trial(&trial).await.unwrap();

        let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
        assert!(outcome.trial.is_failed());
        assert!(!outcome.trial.is_complete());
        // No patch operations were ever rendered.
        assert!(outcome.trial.patch_operations.is_empty());
    }

    #[tokio::test]
    async fn empty_render_skips_patch() {
        let workspace = Arc::new(MemoryWorkspace::new());
        let optimizer = Arc::new(FakeOptimizer::new());
        let engine = engine(workspace.clone(), optimizer);

        let mut experiment = sample_experiment();
        experiment.patches = vec![PatchTemplate::strategic("null", None)];
        let trial = seeded_trial(&workspace).await;

        let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
        assert!(outcome
            .trial
            .is_condition_true(TrialConditionType::Patched));
        assert!(outcome.trial.patch_operations.is_empty());
    }

    #[tokio::test]
    async fn initializer_annotation_parks_trial() {
        let workspace = Arc::new(MemoryWorkspace::new());
        let optimizer = Arc::new(FakeOptimizer::new());
        let engine = engine(workspace.clone(), optimizer);

        let experiment = sample_experiment();
        let mut trial = Trial::new("tuning-001", "default");
        trial.assignments = vec![Assignment::new("cpu", 250)];
        trial
            .metadata
            .set_annotation(tw_types::ANNOTATION_INITIALIZER, "manual");
        let trial = workspace.create_trial(&trial).await.unwrap();

        let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
        assert!(outcome.requeue_after.is_some());
        assert!(!outcome
            .trial
            .is_condition_true(TrialConditionType::SetupCreated));
    }

    #[tokio::test]
    async fn completed_trial_cannot_fail() {
        let workspace = Arc::new(MemoryWorkspace::new());
        let optimizer = Arc::new(FakeOptimizer::new());
        let engine = engine(workspace, optimizer);

        let mut trial = Trial::new("t", "default");
        trial.apply_condition(
            TrialConditionType::Complete,
            ConditionStatus::True,
            "Completed",
            "",
            Utc::now(),
        );
        engine.fail(&mut trial, "Late", "too late", Utc::now());
        assert!(trial.is_complete());
        assert!(!trial.is_failed());
    }

    #[tokio::test]
    async fn json_patch_without_target_is_a_render_failure() {
        let workspace = Arc::new(MemoryWorkspace::new());
        let optimizer = Arc::new(FakeOptimizer::new());
        let engine = engine(workspace.clone(), optimizer);

        let mut experiment = sample_experiment();
        experiment.patches = vec![PatchTemplate {
            kind: PatchKind::Json,
            patch: r#"[{"op": "add", "path": "/spec/x", "value": 1}]"#.into(),
            target_ref: None,
        }];
        let trial = seeded_trial(&workspace).await;

        let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
        assert!(outcome.trial.is_failed());
    }
}
