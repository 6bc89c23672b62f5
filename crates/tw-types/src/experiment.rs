//! Experiment records: the declarative description of a tuning campaign.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::conditions::{Condition, ExperimentConditionType};
use crate::errors::{AssignmentError, ValidationError};
use crate::meta::{ObjectMeta, ServerSyncPolicy, ANNOTATION_SERVER_SYNC};
use crate::metric::Metric;
use crate::params::{Assignment, Constraint, Parameter};
use crate::patch::{PatchKind, PatchTemplate};
use crate::trial::TrialTemplate;

/// Opaque tuning knob forwarded to the remote optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

/// Observed status of an experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(default)]
    pub active_trials: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition<ExperimentConditionType>>,
}

/// Declarative description of an optimization campaign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub metadata: ObjectMeta,
    /// Intended parallel trial count. Unset means 1; zero pauses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optimization: Vec<NameValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PatchTemplate>,
    /// Label selector locating candidate trial namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<BTreeMap<String, String>>,
    /// Template for creating trial namespaces when none are available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_template: Option<serde_json::Value>,
    /// Supporting role / role-binding objects applied to created namespaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_roles: Vec<serde_json::Value>,
    #[serde(default)]
    pub trial_template: TrialTemplate,
    #[serde(default)]
    pub status: ExperimentStatus,
}

impl Experiment {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name, namespace),
            ..Default::default()
        }
    }

    /// Effective replica count: defaulted to 1, never negative.
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1).max(0)
    }

    pub fn server_sync(&self) -> ServerSyncPolicy {
        ServerSyncPolicy::from_annotation(self.metadata.annotation(ANNOTATION_SERVER_SYNC))
    }

    /// Whether trial namespaces are governed by a selector or template rather
    /// than defaulting to the experiment's own namespace.
    pub fn has_workspace_policy(&self) -> bool {
        self.namespace_selector.is_some() || self.namespace_template.is_some()
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Parameters that actually vary; only these are sent to the remote
    /// optimizer.
    pub fn non_constant_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(|p| !p.is_constant())
    }

    /// Assignments injected into every trial from degenerate domains.
    pub fn constant_assignments(&self) -> Vec<Assignment> {
        self.parameters
            .iter()
            .filter_map(|p| {
                p.domain.constant_value().map(|value| Assignment {
                    name: p.name.clone(),
                    value,
                })
            })
            .collect()
    }

    /// The synthetic baseline trial request, covering all non-constant
    /// parameters, or `None` when no baselines are declared.
    ///
    /// Baselines must be declared on all or none of the non-constant
    /// parameters, lie in their domains, and satisfy the constraints.
    pub fn baseline_assignments(&self) -> Result<Option<Vec<Assignment>>, ValidationError> {
        let mut baseline = Vec::new();
        let mut missing = 0usize;
        for p in self.non_constant_parameters() {
            match &p.baseline {
                Some(value) => {
                    if !p.domain.contains(value) {
                        return Err(ValidationError::BaselineOutOfDomain {
                            name: p.name.clone(),
                        });
                    }
                    baseline.push(Assignment {
                        name: p.name.clone(),
                        value: value.clone(),
                    });
                }
                None => missing += 1,
            }
        }

        if baseline.is_empty() {
            return Ok(None);
        }
        if missing > 0 {
            return Err(ValidationError::PartialBaseline);
        }

        // Constraints are evaluated over the full assignment set.
        let mut full = baseline.clone();
        full.extend(self.constant_assignments());
        for constraint in &self.constraints {
            constraint
                .check(&full)
                .map_err(|e| ValidationError::BaselineConstraint {
                    detail: e.to_string(),
                })?;
        }

        Ok(Some(baseline))
    }

    /// Structural validation, performed before the experiment is synchronized
    /// to the remote optimizer.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.replicas.map(|r| r < 0).unwrap_or(false) {
            return Err(ValidationError::NegativeReplicas);
        }

        let mut names = HashSet::new();
        for p in &self.parameters {
            if !names.insert(p.name.as_str()) {
                return Err(ValidationError::DuplicateParameter {
                    name: p.name.clone(),
                });
            }
        }

        if self.metrics.is_empty() {
            return Err(ValidationError::NoMetrics);
        }
        let mut metric_names = HashSet::new();
        for m in &self.metrics {
            if !metric_names.insert(m.name.as_str()) {
                return Err(ValidationError::DuplicateMetric {
                    name: m.name.clone(),
                });
            }
        }

        // A patch addressing the trial's own run job must be a strategic
        // merge patch; it is deferred to job-submission time.
        for (index, patch) in self.patches.iter().enumerate() {
            if patch.targets_trial_job() && patch.kind != PatchKind::Strategic {
                return Err(ValidationError::TrialJobPatchKind { index });
            }
        }

        self.baseline_assignments().map(|_| ())
    }

    /// Validate a trial's assignments against this experiment: exactly one
    /// assignment per parameter (constants included), every value in its
    /// domain, all constraints satisfied.
    pub fn validate_assignments(&self, assignments: &[Assignment]) -> Result<(), AssignmentError> {
        let mut seen = HashSet::new();
        for a in assignments {
            if !seen.insert(a.name.as_str()) {
                return Err(AssignmentError::Duplicate {
                    name: a.name.clone(),
                });
            }
            let parameter = self
                .parameter(&a.name)
                .ok_or_else(|| AssignmentError::Unknown {
                    name: a.name.clone(),
                })?;
            if !parameter.domain.contains(&a.value) {
                return Err(AssignmentError::OutOfDomain {
                    name: a.name.clone(),
                    value: a.value.to_string(),
                });
            }
        }

        for p in &self.parameters {
            if !seen.contains(p.name.as_str()) {
                return Err(AssignmentError::Missing {
                    name: p.name.clone(),
                });
            }
        }

        for constraint in &self.constraints {
            constraint.check(assignments)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;
    use crate::params::{ParameterDomain, ParameterValue};
    use crate::patch::ObjectRef;

    fn sample_experiment() -> Experiment {
        let mut exp = Experiment::new("tuning", "default");
        exp.parameters = vec![
            Parameter::int("cpu", 100, 1000),
            Parameter::categorical("mode", vec!["fast".into(), "safe".into()]),
            Parameter::int("workers", 4, 4), // constant
        ];
        exp.metrics = vec![Metric::new(
            "duration",
            MetricKind::Kubernetes,
            "{{duration .StartTime .CompletionTime}}",
        )];
        exp
    }

    #[test]
    fn replicas_defaulting() {
        let mut exp = sample_experiment();
        assert_eq!(exp.replicas(), 1);
        exp.replicas = Some(0);
        assert_eq!(exp.replicas(), 0);
        exp.replicas = Some(3);
        assert_eq!(exp.replicas(), 3);
    }

    #[test]
    fn constant_assignments_from_degenerate_domains() {
        let exp = sample_experiment();
        let constants = exp.constant_assignments();
        assert_eq!(constants.len(), 1);
        assert_eq!(constants[0].name, "workers");
        assert_eq!(constants[0].value, ParameterValue::Int(4));
    }

    #[test]
    fn assignment_validation_full_coverage() {
        let exp = sample_experiment();
        let ok = vec![
            Assignment::new("cpu", 250),
            Assignment::new("mode", "fast"),
            Assignment::new("workers", 4),
        ];
        assert!(exp.validate_assignments(&ok).is_ok());

        let missing = vec![Assignment::new("cpu", 250), Assignment::new("workers", 4)];
        assert!(matches!(
            exp.validate_assignments(&missing),
            Err(AssignmentError::Missing { .. })
        ));

        let out_of_domain = vec![
            Assignment::new("cpu", 5000),
            Assignment::new("mode", "fast"),
            Assignment::new("workers", 4),
        ];
        assert!(matches!(
            exp.validate_assignments(&out_of_domain),
            Err(AssignmentError::OutOfDomain { .. })
        ));

        let duplicate = vec![
            Assignment::new("cpu", 250),
            Assignment::new("cpu", 300),
            Assignment::new("mode", "fast"),
            Assignment::new("workers", 4),
        ];
        assert!(matches!(
            exp.validate_assignments(&duplicate),
            Err(AssignmentError::Duplicate { .. })
        ));

        let unknown = vec![
            Assignment::new("cpu", 250),
            Assignment::new("mode", "fast"),
            Assignment::new("workers", 4),
            Assignment::new("mystery", 1),
        ];
        assert!(matches!(
            exp.validate_assignments(&unknown),
            Err(AssignmentError::Unknown { .. })
        ));
    }

    #[test]
    fn baseline_all_or_none() {
        let mut exp = sample_experiment();
        exp.parameters[0] = Parameter::int("cpu", 100, 1000).with_baseline(200);
        // Only one of the two non-constant parameters has a baseline.
        assert_eq!(
            exp.baseline_assignments(),
            Err(ValidationError::PartialBaseline)
        );

        exp.parameters[1] = Parameter::categorical("mode", vec!["fast".into(), "safe".into()])
            .with_baseline("fast");
        let baseline = exp.baseline_assignments().unwrap().unwrap();
        assert_eq!(baseline.len(), 2);

        let mut none = sample_experiment();
        none.parameters = vec![Parameter::int("cpu", 100, 1000)];
        assert_eq!(none.baseline_assignments(), Ok(None));
    }

    #[test]
    fn baseline_domain_and_constraints() {
        let mut exp = sample_experiment();
        exp.parameters = vec![Parameter::int("cpu", 100, 1000).with_baseline(5000)];
        assert!(matches!(
            exp.baseline_assignments(),
            Err(ValidationError::BaselineOutOfDomain { .. })
        ));

        let mut exp = sample_experiment();
        exp.parameters = vec![
            Parameter::int("a", 0, 10).with_baseline(8),
            Parameter::int("b", 0, 10).with_baseline(2),
        ];
        exp.constraints = vec![Constraint::Order {
            lower_parameter: "a".into(),
            upper_parameter: "b".into(),
        }];
        assert!(matches!(
            exp.baseline_assignments(),
            Err(ValidationError::BaselineConstraint { .. })
        ));
    }

    #[test]
    fn trial_job_patch_must_be_strategic() {
        let mut exp = sample_experiment();
        exp.patches = vec![PatchTemplate {
            kind: PatchKind::Merge,
            patch: "{}".into(),
            target_ref: Some(ObjectRef {
                kind: "Job".into(),
                ..Default::default()
            }),
        }];
        assert_eq!(
            exp.validate(),
            Err(ValidationError::TrialJobPatchKind { index: 0 })
        );

        exp.patches[0].kind = PatchKind::Strategic;
        assert!(exp.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicates() {
        let mut exp = sample_experiment();
        exp.parameters.push(Parameter::int("cpu", 0, 1));
        assert!(matches!(
            exp.validate(),
            Err(ValidationError::DuplicateParameter { .. })
        ));

        let mut exp = sample_experiment();
        exp.metrics.push(exp.metrics[0].clone());
        assert!(matches!(
            exp.validate(),
            Err(ValidationError::DuplicateMetric { .. })
        ));
    }

    #[test]
    fn constants_do_not_participate_in_baselines() {
        let mut exp = sample_experiment();
        exp.parameters = vec![
            Parameter::int("cpu", 100, 1000).with_baseline(200),
            Parameter::int("workers", 4, 4), // constant, no baseline required
        ];
        let baseline = exp.baseline_assignments().unwrap().unwrap();
        assert_eq!(baseline.len(), 1);
        assert_eq!(baseline[0].name, "cpu");
    }
}
