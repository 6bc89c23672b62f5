//! Namespace selection and per-trial bootstrap.

use std::collections::BTreeMap;
use tracing::debug;

use tw_api::{assignment_from_wire, TrialSuggestion};
use tw_engine::{WorkspaceClient, WorkspaceError, WorkspaceObject};
use tw_types::{
    Experiment, ExperimentRef, ObjectRef, Trial, ANNOTATION_REPORT_TRIAL_URL,
    FINALIZER_SERVER_SYNC, LABEL_EXPERIMENT,
};

/// Pick (or create) the namespace for a new trial.
///
/// Priority: an explicit namespace on the trial template; the experiment's
/// own namespace when no workspace policy is configured; the first selected
/// namespace not hosting an active trial; a namespace created from the
/// template. Returns `Ok(None)` when every candidate is busy and nothing may
/// be created.
pub async fn choose_namespace(
    workspace: &dyn WorkspaceClient,
    experiment: &Experiment,
    trials: &[Trial],
) -> Result<Option<String>, WorkspaceError> {
    if !experiment.trial_template.metadata.namespace.is_empty() {
        return Ok(Some(experiment.trial_template.metadata.namespace.clone()));
    }
    if !experiment.has_workspace_policy() {
        return Ok(Some(experiment.metadata.namespace.clone()));
    }

    let selector = namespace_selector(experiment);
    let candidates = workspace.list_namespaces(&selector).await?;
    for candidate in candidates {
        let busy = trials
            .iter()
            .any(|t| t.is_active() && t.metadata.namespace == candidate);
        if !busy {
            return Ok(Some(candidate));
        }
    }

    if let Some(template) = &experiment.namespace_template {
        let labels = template_labels(template);
        let prefix = format!("{}-", experiment.metadata.name);
        let name = workspace.create_namespace(&prefix, &labels).await?;
        debug!(namespace = %name, "created trial namespace");

        // Supporting role objects may be denied under restricted RBAC; setup
        // tasks can still run with default permissions.
        for role in &experiment.namespace_roles {
            let kind = role
                .get("kind")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("Role");
            let role_name = role
                .pointer("/metadata/name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("tunewise-setup");
            let object = WorkspaceObject::new(ObjectRef::new(kind, role_name, &name))
                .with_data(role.clone())
                .with_label(LABEL_EXPERIMENT, &experiment.metadata.name);
            match workspace.create_object(&object).await {
                Ok(()) | Err(WorkspaceError::Forbidden(_)) | Err(WorkspaceError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        return Ok(Some(name));
    }

    Ok(None)
}

fn namespace_selector(experiment: &Experiment) -> BTreeMap<String, String> {
    if let Some(selector) = &experiment.namespace_selector {
        return selector.clone();
    }
    experiment
        .namespace_template
        .as_ref()
        .map(template_labels)
        .unwrap_or_default()
}

fn template_labels(template: &serde_json::Value) -> BTreeMap<String, String> {
    template
        .pointer("/metadata/labels")
        .and_then(serde_json::Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Build a trial record from the experiment's template and a remote
/// suggestion. Constant-parameter assignments are merged in here.
pub fn bootstrap_trial(
    experiment: &Experiment,
    suggestion: &TrialSuggestion,
    namespace: &str,
) -> Trial {
    let mut trial = experiment.trial_template.instantiate();

    trial.metadata.namespace = namespace.to_string();
    trial
        .metadata
        .set_label(LABEL_EXPERIMENT, &experiment.metadata.name);
    trial.experiment_ref = Some(ExperimentRef {
        name: experiment.metadata.name.clone(),
        namespace: experiment.metadata.namespace.clone(),
    });

    // Name after the remote ordinal when one is present, otherwise fall back
    // to a generated name.
    match suggestion_ordinal(&suggestion.report_url) {
        Some(ordinal) => {
            trial.metadata.name = format!("{}-{:03}", experiment.metadata.name, ordinal);
        }
        None => {
            if trial.metadata.generate_name.is_none() {
                trial.metadata.generate_name = Some(format!("{}-", experiment.metadata.name));
            }
            trial.metadata.name.clear();
        }
    }

    if !suggestion.report_url.is_empty() {
        trial
            .metadata
            .set_annotation(ANNOTATION_REPORT_TRIAL_URL, &suggestion.report_url);
        trial.metadata.add_finalizer(FINALIZER_SERVER_SYNC);
    }

    trial.assignments = experiment.constant_assignments();
    trial.assignments.extend(
        suggestion
            .assignments
            .assignments
            .iter()
            .map(assignment_from_wire),
    );
    trial.update_summary();
    trial
}

fn suggestion_ordinal(report_url: &str) -> Option<u64> {
    report_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tw_api::{TrialAssignments, WireAssignment, WireValue};
    use tw_engine::MemoryWorkspace;
    use tw_types::{Parameter, ParameterValue};

    fn sample_experiment() -> Experiment {
        let mut exp = Experiment::new("tuning", "default");
        exp.parameters = vec![
            Parameter::int("cpu", 100, 1000),
            Parameter::int("workers", 4, 4), // constant
        ];
        exp
    }

    fn suggestion(cpu: f64, report_url: &str) -> TrialSuggestion {
        TrialSuggestion {
            assignments: TrialAssignments {
                assignments: vec![WireAssignment {
                    name: "cpu".into(),
                    value: WireValue::Number(cpu),
                }],
                labels: BTreeMap::new(),
            },
            report_url: report_url.to_string(),
        }
    }

    #[tokio::test]
    async fn defaults_to_experiment_namespace() {
        let workspace = MemoryWorkspace::new();
        let experiment = sample_experiment();
        let namespace = choose_namespace(&workspace, &experiment, &[])
            .await
            .unwrap();
        assert_eq!(namespace.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn explicit_template_namespace_wins() {
        let workspace = MemoryWorkspace::new();
        let mut experiment = sample_experiment();
        experiment.trial_template.metadata.namespace = "workloads".into();
        experiment.namespace_selector =
            Some([("team".to_string(), "perf".to_string())].into_iter().collect());
        let namespace = choose_namespace(&workspace, &experiment, &[])
            .await
            .unwrap();
        assert_eq!(namespace.as_deref(), Some("workloads"));
    }

    #[tokio::test]
    async fn selector_skips_busy_namespaces() {
        let workspace = MemoryWorkspace::new();
        let selector: BTreeMap<String, String> =
            [("team".to_string(), "perf".to_string())].into_iter().collect();
        workspace.add_namespace("perf-1", selector.clone());
        workspace.add_namespace("perf-2", selector.clone());

        let mut experiment = sample_experiment();
        experiment.namespace_selector = Some(selector);

        let busy = Trial::new("running", "perf-1");
        let namespace = choose_namespace(&workspace, &experiment, &[busy])
            .await
            .unwrap();
        assert_eq!(namespace.as_deref(), Some("perf-2"));
    }

    #[tokio::test]
    async fn all_busy_without_template_yields_none() {
        let workspace = MemoryWorkspace::new();
        let selector: BTreeMap<String, String> =
            [("team".to_string(), "perf".to_string())].into_iter().collect();
        workspace.add_namespace("perf-1", selector.clone());

        let mut experiment = sample_experiment();
        experiment.namespace_selector = Some(selector);

        let busy = Trial::new("running", "perf-1");
        let namespace = choose_namespace(&workspace, &experiment, &[busy])
            .await
            .unwrap();
        assert_eq!(namespace, None);
    }

    #[tokio::test]
    async fn template_creates_namespace_and_ignores_role_denial() {
        let workspace = MemoryWorkspace::new();
        workspace.forbid_kind("Role");

        let mut experiment = sample_experiment();
        experiment.namespace_template = Some(serde_json::json!({
            "metadata": {"labels": {"team": "perf"}}
        }));
        experiment.namespace_roles = vec![serde_json::json!({
            "kind": "Role",
            "metadata": {"name": "setup"}
        })];

        let namespace = choose_namespace(&workspace, &experiment, &[])
            .await
            .unwrap()
            .unwrap();
        assert!(namespace.starts_with("tuning-"));
        assert_eq!(
            workspace.namespace_labels(&namespace).unwrap().get("team"),
            Some(&"perf".to_string())
        );
    }

    #[tokio::test]
    async fn namespace_creation_denial_aborts() {
        let workspace = MemoryWorkspace::new();
        workspace.forbid_kind("Namespace");

        let mut experiment = sample_experiment();
        experiment.namespace_template = Some(serde_json::json!({"metadata": {}}));

        let result = choose_namespace(&workspace, &experiment, &[]).await;
        assert!(matches!(result, Err(WorkspaceError::Forbidden(_))));
    }

    #[test]
    fn bootstrap_merges_constants_and_clamps() {
        let experiment = sample_experiment();
        let big = suggestion((1u64 << 62) as f64, "fake:/experiments/tuning/trials/7");
        let trial = bootstrap_trial(&experiment, &big, "default");

        assert_eq!(trial.metadata.name, "tuning-007");
        assert_eq!(
            trial.metadata.label(LABEL_EXPERIMENT),
            Some("tuning")
        );
        assert!(trial.metadata.has_finalizer(FINALIZER_SERVER_SYNC));
        assert_eq!(
            trial.metadata.annotation(ANNOTATION_REPORT_TRIAL_URL),
            Some("fake:/experiments/tuning/trials/7")
        );

        let workers = trial.assignments.iter().find(|a| a.name == "workers").unwrap();
        assert_eq!(workers.value, ParameterValue::Int(4));
        let cpu = trial.assignments.iter().find(|a| a.name == "cpu").unwrap();
        // 2^62 clamps to the 32-bit bound; the summary reflects the clamp.
        assert_eq!(cpu.value, ParameterValue::Int(i64::from(i32::MAX)));
        assert!(trial
            .status
            .assignment_summary
            .contains(&i32::MAX.to_string()));
    }

    #[test]
    fn bootstrap_without_ordinal_uses_generate_name() {
        let experiment = sample_experiment();
        let trial = bootstrap_trial(&experiment, &suggestion(250.0, ""), "default");
        assert!(trial.metadata.name.is_empty());
        assert_eq!(trial.metadata.generate_name.as_deref(), Some("tuning-"));
        // No report URL, no finalizer to hold.
        assert!(!trial.metadata.has_finalizer(FINALIZER_SERVER_SYNC));
    }
}
