//! Trial-run job management: building the job object from the trial's
//! template (with the deferred trial-job patch folded in) and reading its
//! observed status back.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::workspace::{merge_json, WorkspaceObject};
use tw_types::{
    ObjectRef, PatchKind, Trial, LABEL_EXPERIMENT, LABEL_TRIAL, LABEL_TRIAL_ROLE, TRIAL_ROLE_RUN,
};

/// Reference to a trial's run job. The job shares the trial's name.
pub fn job_ref(trial: &Trial) -> ObjectRef {
    ObjectRef::new("Job", &trial.metadata.name, &trial.metadata.namespace)
}

/// Whether a rendered patch operation addresses the trial's own run job.
pub fn is_trial_job_target(target: &ObjectRef, trial: &Trial) -> bool {
    target.kind == "Job"
        && (target.name.is_empty() || target.name == trial.metadata.name)
        && (target.namespace.is_empty() || target.namespace == trial.metadata.namespace)
}

/// Build the trial-run job object. Deferred strategic patches targeting the
/// job are applied here, at submission time.
pub fn build_job(trial: &Trial) -> WorkspaceObject {
    let mut data = trial.job_template.clone().unwrap_or_else(|| {
        serde_json::json!({"spec": {"template": {"spec": {"restartPolicy": "Never"}}}})
    });

    for operation in &trial.patch_operations {
        if operation.patch_kind != PatchKind::Strategic
            || !is_trial_job_target(&operation.target_ref, trial)
        {
            continue;
        }
        if let Ok(patch) = serde_json::from_str::<Value>(&operation.data) {
            merge_json(&mut data, &patch);
        }
    }

    let mut job = WorkspaceObject::new(job_ref(trial))
        .with_data(data)
        .with_label(LABEL_TRIAL, &trial.metadata.name)
        .with_label(LABEL_TRIAL_ROLE, TRIAL_ROLE_RUN);
    if let Some(experiment) = trial.metadata.label(LABEL_EXPERIMENT) {
        job.labels
            .insert(LABEL_EXPERIMENT.to_string(), experiment.to_string());
    }
    job
}

/// Observed state of a trial-run job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStatus {
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub succeeded: bool,
    pub failed: bool,
}

/// Read the status the workspace reports for a job object.
pub fn parse_job_status(object: &WorkspaceObject) -> JobStatus {
    let time = |field: &str| {
        object
            .status
            .get(field)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    };
    let count = |field: &str| {
        object
            .status
            .get(field)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    JobStatus {
        start_time: time("startTime"),
        completion_time: time("completionTime"),
        succeeded: count("succeeded") > 0,
        failed: count("failed") > 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tw_types::PatchOperation;

    #[test]
    fn job_shares_trial_name_and_labels() {
        let mut trial = Trial::new("tuning-001", "default");
        trial
            .metadata
            .set_label(LABEL_EXPERIMENT, "tuning");
        let job = build_job(&trial);
        assert_eq!(job.reference.name, "tuning-001");
        assert_eq!(job.labels.get(LABEL_TRIAL_ROLE).unwrap(), TRIAL_ROLE_RUN);
        assert_eq!(job.labels.get(LABEL_EXPERIMENT).unwrap(), "tuning");
    }

    #[test]
    fn deferred_job_patch_is_applied_at_submission() {
        let mut trial = Trial::new("tuning-001", "default");
        trial.job_template = Some(json!({"spec": {"backoffLimit": 0}}));
        trial.patch_operations = vec![PatchOperation {
            target_ref: ObjectRef {
                kind: "Job".into(),
                ..Default::default()
            },
            patch_kind: PatchKind::Strategic,
            data: r#"{"spec": {"activeDeadlineSeconds": 300}}"#.into(),
            attempts_remaining: 0,
        }];

        let job = build_job(&trial);
        assert_eq!(
            job.data.pointer("/spec/activeDeadlineSeconds"),
            Some(&json!(300))
        );
        assert_eq!(job.data.pointer("/spec/backoffLimit"), Some(&json!(0)));
    }

    #[test]
    fn trial_job_target_detection() {
        let trial = Trial::new("tuning-001", "default");

        let anonymous = ObjectRef {
            kind: "Job".into(),
            ..Default::default()
        };
        assert!(is_trial_job_target(&anonymous, &trial));

        let named = ObjectRef::new("Job", "tuning-001", "default");
        assert!(is_trial_job_target(&named, &trial));

        let other = ObjectRef::new("Job", "somebody-else", "default");
        assert!(!is_trial_job_target(&other, &trial));

        let deployment = ObjectRef::new("Deployment", "tuning-001", "default");
        assert!(!is_trial_job_target(&deployment, &trial));
    }

    #[test]
    fn job_status_parsing() {
        let mut object = WorkspaceObject::new(ObjectRef::new("Job", "t", "default"));
        object.status = json!({
            "startTime": "2024-05-01T12:00:00Z",
            "completionTime": "2024-05-01T12:00:05Z",
            "succeeded": 1
        });
        let status = parse_job_status(&object);
        assert!(status.succeeded);
        assert!(!status.failed);
        assert_eq!(
            (status.completion_time.unwrap() - status.start_time.unwrap()).num_seconds(),
            5
        );
    }

    #[test]
    fn empty_status_parses_to_default() {
        let object = WorkspaceObject::new(ObjectRef::new("Job", "t", "default"));
        assert_eq!(parse_job_status(&object), JobStatus::default());
    }
}
