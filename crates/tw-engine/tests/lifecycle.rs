//! End-to-end trial lifecycle runs against the in-memory workspace and the
//! fake optimizer.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use tw_api::FakeOptimizer;
use tw_collect::{
    CaptureError, CaptureRequest, Collector, CollectorSet, KubernetesCollector, Observation,
};
use tw_engine::{BasicRenderer, MemoryWorkspace, TrialEngine, WorkspaceClient, WorkspaceObject};
use tw_types::{
    Assignment, Experiment, Metric, MetricKind, ObjectRef, Parameter, PatchTemplate, Trial,
    TrialConditionType, ANNOTATION_REPORT_TRIAL_URL, FINALIZER_SERVER_SYNC, LABEL_EXPERIMENT,
};

const REPORT_URL: &str = "fake:/experiments/tuning/trials/1";

fn make_engine(
    workspace: &Arc<MemoryWorkspace>,
    optimizer: &Arc<FakeOptimizer>,
    collectors: CollectorSet,
) -> TrialEngine {
    TrialEngine::new(
        workspace.clone(),
        optimizer.clone(),
        Arc::new(collectors),
        Arc::new(BasicRenderer::new()),
    )
}

fn kubernetes_collectors() -> CollectorSet {
    let mut set = CollectorSet::empty();
    set.register(Box::new(KubernetesCollector::new()));
    set
}

fn make_experiment() -> Experiment {
    let mut exp = Experiment::new("tuning", "default");
    exp.parameters = vec![Parameter::int("cpu", 100, 1000)];
    exp.metrics = vec![Metric::new(
        "duration",
        MetricKind::Kubernetes,
        "{{duration .StartTime .CompletionTime}}",
    )];
    exp
}

async fn make_trial(workspace: &MemoryWorkspace) -> Trial {
    let mut trial = Trial::new("tuning-001", "default");
    trial.metadata.set_label(LABEL_EXPERIMENT, "tuning");
    trial
        .metadata
        .set_annotation(ANNOTATION_REPORT_TRIAL_URL, REPORT_URL);
    trial.metadata.add_finalizer(FINALIZER_SERVER_SYNC);
    trial.assignments = vec![Assignment::new("cpu", 250)];
    workspace.create_trial(&trial).await.unwrap()
}

fn deployment_ref() -> ObjectRef {
    ObjectRef::new("Deployment", "app", "default")
}

/// Happy path: one strategic patch, one kubernetes metric, a five-second
/// simulated trial run, reported value 5.
#[tokio::test]
async fn happy_path_single_metric_single_patch() {
    let workspace = Arc::new(MemoryWorkspace::new());
    let optimizer = Arc::new(FakeOptimizer::new());
    let engine = make_engine(&workspace, &optimizer, kubernetes_collectors());

    let mut experiment = make_experiment();
    experiment.patches = vec![PatchTemplate::strategic(
        r#"{"spec": {"template": {"spec": {"cpu": "{{ .Values.cpu }}m"}}}}"#,
        Some(deployment_ref()),
    )];
    workspace.put_object(
        WorkspaceObject::new(deployment_ref()).with_data(json!({"spec": {"template": {"spec": {}}}})),
    );

    let trial = make_trial(&workspace).await;

    // First pass: setup, patch, readiness, job creation.
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    assert!(trial.is_condition_true(TrialConditionType::SetupCreated));
    assert!(trial.is_condition_true(TrialConditionType::Patched));
    assert!(trial.is_condition_true(TrialConditionType::Ready));
    assert!(outcome.requeue_after.is_some());

    // The patch landed on the deployment with the assignment substituted.
    let deployment = workspace.object(&deployment_ref()).unwrap();
    assert_eq!(
        deployment.data.pointer("/spec/template/spec/cpu"),
        Some(&json!("250m"))
    );

    // Simulate a five second trial run.
    let start = Utc::now() - ChronoDuration::seconds(10);
    let completion = start + ChronoDuration::seconds(5);
    let job = ObjectRef::new("Job", "tuning-001", "default");
    workspace.put_object_status(
        &job,
        json!({
            "startTime": start.to_rfc3339(),
            "completionTime": completion.to_rfc3339(),
            "succeeded": 1
        }),
    );

    // Second pass: observe, tear down, complete, report.
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    assert!(trial.is_condition_true(TrialConditionType::Observed));
    assert!(trial.is_condition_true(TrialConditionType::SetupDeleted));
    assert!(trial.is_complete());
    assert!(!trial.is_failed());
    assert_eq!(trial.status.values[0].value, "5");
    assert_eq!(trial.status.approximate_runtime_seconds, Some(5));
    assert!(trial.status.value_summary.contains("duration=5"));

    // The report reached the remote and the finalizer was released.
    let report = optimizer.report_for(REPORT_URL).expect("report sent");
    assert!(!report.failed);
    assert_eq!(report.values.len(), 1);
    assert_eq!(report.values[0].metric_name, "duration");
    assert_eq!(report.values[0].value, 5.0);
    assert!(!trial.metadata.has_finalizer(FINALIZER_SERVER_SYNC));
}

/// Scripted Prometheus-style collector: first call "waiting for the final
/// scrape", second call produces the value.
struct WaitingCollector {
    calls: Mutex<u32>,
}

#[async_trait]
impl Collector for WaitingCollector {
    fn kind(&self) -> MetricKind {
        MetricKind::Prometheus
    }

    async fn capture(&self, _request: &CaptureRequest<'_>) -> Result<Observation, CaptureError> {
        let mut calls = self.calls.lock();
        *calls += 1;
        if *calls == 1 {
            Err(CaptureError::retryable(Duration::from_secs(5)))
        } else {
            Ok(Observation {
                value: 1.0,
                error: 0.0,
            })
        }
    }
}

/// Prometheus waiting: the first capture pass backs off for five seconds,
/// the second reports `1`.
#[tokio::test]
async fn prometheus_waits_for_final_scrape() {
    let workspace = Arc::new(MemoryWorkspace::new());
    let optimizer = Arc::new(FakeOptimizer::new());
    let mut collectors = CollectorSet::empty();
    collectors.register(Box::new(WaitingCollector {
        calls: Mutex::new(0),
    }));
    let engine = make_engine(&workspace, &optimizer, collectors);

    let mut experiment = make_experiment();
    experiment.metrics =
        vec![Metric::new("p95", MetricKind::Prometheus, "latency").with_url("http://prom")];

    let trial = make_trial(&workspace).await;

    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;

    let completion = Utc::now();
    let job = ObjectRef::new("Job", "tuning-001", "default");
    workspace.put_object_status(
        &job,
        json!({
            "startTime": (completion - ChronoDuration::seconds(30)).to_rfc3339(),
            "completionTime": completion.to_rfc3339(),
            "succeeded": 1
        }),
    );

    // First capture pass: retryable, five second hint, no attempt spent.
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(5)));
    assert!(!trial.is_condition_true(TrialConditionType::Observed));
    assert_eq!(trial.status.values[0].attempts_remaining, 3);

    // Second pass: the scrape landed, the value reads 1.
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    assert!(trial.is_complete());
    assert_eq!(trial.status.values[0].value, "1");

    let report = optimizer.report_for(REPORT_URL).unwrap();
    assert_eq!(report.values[0].value, 1.0);
}

/// Patch exhaustion: the target does not exist; three passes spend the
/// attempt budget and the third fails the trial naming the patch.
#[tokio::test]
async fn patch_exhaustion_fails_the_trial() {
    let workspace = Arc::new(MemoryWorkspace::new());
    let optimizer = Arc::new(FakeOptimizer::new());
    let engine = make_engine(&workspace, &optimizer, kubernetes_collectors());

    let mut experiment = make_experiment();
    experiment.patches = vec![PatchTemplate::strategic(
        r#"{"spec": {}}"#,
        Some(ObjectRef::new("Deployment", "ghost", "default")),
    )];

    let mut trial = make_trial(&workspace).await;
    for pass in 0..3 {
        let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
        trial = outcome.trial;
        let expected_remaining = 2 - pass as u32;
        if pass < 2 {
            assert_eq!(
                trial.patch_operations[0].attempts_remaining, expected_remaining,
                "pass {pass}"
            );
            assert!(!trial.is_failed());
        }
    }

    assert!(trial.is_failed());
    assert!(!trial.is_complete());
    let failed = trial
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == TrialConditionType::Failed)
        .unwrap();
    assert_eq!(failed.reason, "PatchFailed");
    assert!(failed.message.contains("Deployment/ghost"));

    // The failure was reported without numeric values.
    let report = optimizer.report_for(REPORT_URL).unwrap();
    assert!(report.failed);
    assert!(report.values.is_empty());
}

/// A metric value outside the declared bounds fails the trial; the captured
/// partial results stay on the record.
#[tokio::test]
async fn metric_bound_violation_fails_the_trial() {
    let workspace = Arc::new(MemoryWorkspace::new());
    let optimizer = Arc::new(FakeOptimizer::new());
    let engine = make_engine(&workspace, &optimizer, kubernetes_collectors());

    let mut experiment = make_experiment();
    experiment.metrics[0] = experiment.metrics[0].clone().with_bounds(None, Some(3.0));

    let trial = make_trial(&workspace).await;
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;

    let completion = Utc::now();
    let job = ObjectRef::new("Job", "tuning-001", "default");
    workspace.put_object_status(
        &job,
        json!({
            "startTime": (completion - ChronoDuration::seconds(5)).to_rfc3339(),
            "completionTime": completion.to_rfc3339(),
            "succeeded": 1
        }),
    );

    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    assert!(trial.is_failed());
    let failed = trial
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == TrialConditionType::Failed)
        .unwrap();
    assert_eq!(failed.reason, "MetricBound");
}

/// TTL expiry removes the finished trial record and its owned objects.
#[tokio::test]
async fn ttl_expiry_deletes_the_trial() {
    let workspace = Arc::new(MemoryWorkspace::new());
    let optimizer = Arc::new(FakeOptimizer::new());
    let engine = make_engine(&workspace, &optimizer, kubernetes_collectors());

    let experiment = make_experiment();
    let mut trial = Trial::new("tuning-001", "default");
    trial.metadata.set_label(LABEL_EXPERIMENT, "tuning");
    trial
        .metadata
        .set_annotation(ANNOTATION_REPORT_TRIAL_URL, REPORT_URL);
    trial.metadata.add_finalizer(FINALIZER_SERVER_SYNC);
    trial.assignments = vec![Assignment::new("cpu", 250)];
    trial.ttl_seconds_after_finished = Some(0);
    let trial = workspace.create_trial(&trial).await.unwrap();

    // Run to completion.
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    let completion = Utc::now();
    let job = ObjectRef::new("Job", "tuning-001", "default");
    workspace.put_object_status(
        &job,
        json!({
            "startTime": (completion - ChronoDuration::seconds(5)).to_rfc3339(),
            "completionTime": completion.to_rfc3339(),
            "succeeded": 1
        }),
    );
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    assert!(trial.is_complete());

    // TTL of zero: the next pass removes the record and the run job.
    let _ = engine.reconcile(&experiment, &trial).await.unwrap();
    assert!(workspace.get_trial("default", "tuning-001").await.is_err());
    assert!(workspace.object(&job).is_none());
}

/// Deleting a running trial abandons it on the remote before the record
/// goes away.
#[tokio::test]
async fn deletion_of_running_trial_abandons_remotely() {
    let workspace = Arc::new(MemoryWorkspace::new());
    let optimizer = Arc::new(FakeOptimizer::new());
    let engine = make_engine(&workspace, &optimizer, kubernetes_collectors());

    let experiment = make_experiment();
    let trial = make_trial(&workspace).await;

    // Start the trial, then request deletion mid-flight.
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let mut trial = outcome.trial;
    trial.metadata.deletion_timestamp = Some(Utc::now());
    let trial = workspace.update_trial(&trial).await.unwrap();

    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    assert!(outcome.requeue_after.is_none());
    assert_eq!(optimizer.abandoned(), vec![REPORT_URL.to_string()]);
    assert!(workspace.get_trial("default", "tuning-001").await.is_err());
    // Nothing was reported for the abandoned trial.
    assert!(optimizer.report_for(REPORT_URL).is_none());
}

/// Setup tasks run at both ends of the lifecycle, and permission errors on
/// their objects are ignored.
#[tokio::test]
async fn setup_tasks_are_created_and_torn_down() {
    let workspace = Arc::new(MemoryWorkspace::new());
    let optimizer = Arc::new(FakeOptimizer::new());
    let engine = make_engine(&workspace, &optimizer, kubernetes_collectors());

    let experiment = make_experiment();
    let mut trial = Trial::new("tuning-001", "default");
    trial.metadata.set_label(LABEL_EXPERIMENT, "tuning");
    trial
        .metadata
        .set_annotation(ANNOTATION_REPORT_TRIAL_URL, REPORT_URL);
    trial.assignments = vec![Assignment::new("cpu", 250)];
    trial.setup_tasks = vec![tw_types::SetupTask {
        name: "warmup".into(),
        spec: json!({"kind": "Job"}),
    }];
    let trial = workspace.create_trial(&trial).await.unwrap();

    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    let setup = ObjectRef::new("Job", "tuning-001-warmup", "default");
    assert!(workspace.object(&setup).is_some());
    assert!(trial.is_condition_true(TrialConditionType::SetupCreated));

    let completion = Utc::now();
    let job = ObjectRef::new("Job", "tuning-001", "default");
    workspace.put_object_status(
        &job,
        json!({
            "startTime": (completion - ChronoDuration::seconds(5)).to_rfc3339(),
            "completionTime": completion.to_rfc3339(),
            "succeeded": 1
        }),
    );

    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    assert!(trial.is_condition_true(TrialConditionType::SetupDeleted));
    assert!(workspace.object(&setup).is_none());
    assert!(trial.is_complete());
}

/// Conditions stay monotone across the whole lifecycle and exactly one
/// terminal condition is ever latched.
#[tokio::test]
async fn terminal_conditions_are_exclusive() {
    let workspace = Arc::new(MemoryWorkspace::new());
    let optimizer = Arc::new(FakeOptimizer::new());
    let engine = make_engine(&workspace, &optimizer, kubernetes_collectors());

    let experiment = make_experiment();
    let trial = make_trial(&workspace).await;

    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    let completion = Utc::now();
    workspace.put_object_status(
        &ObjectRef::new("Job", "tuning-001", "default"),
        json!({
            "startTime": (completion - ChronoDuration::seconds(5)).to_rfc3339(),
            "completionTime": completion.to_rfc3339(),
            "succeeded": 1
        }),
    );
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    assert!(trial.is_complete());

    // Further reconciles keep the terminal state stable.
    let outcome = engine.reconcile(&experiment, &trial).await.unwrap();
    let trial = outcome.trial;
    assert!(trial.is_complete());
    assert!(!trial.is_failed());
}
