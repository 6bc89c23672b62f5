//! Wire representations exchanged with the remote optimizer.
//!
//! Constant parameters never appear on the wire; inbound integer assignments
//! are clamped to the signed 32-bit range.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tw_types::{
    Assignment, Constraint, Experiment, Metric, NameValue, Parameter, ParameterDomain,
    ParameterValue, SumConstraintParameter, Trial,
};

/// Label applied to the synthetic baseline trial request.
pub const LABEL_BASELINE: &str = "baseline";

/// Integer bounds of a numeric parameter, as JSON numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: i64,
    pub max: i64,
}

/// A parameter as the optimizer sees it: bounded integer or categorical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetric {
    pub name: String,
    #[serde(default)]
    pub minimize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "constraintType", rename_all = "lowercase")]
pub enum ServerConstraint {
    #[serde(rename_all = "camelCase")]
    Order {
        lower_parameter: String,
        upper_parameter: String,
    },
    #[serde(rename_all = "camelCase")]
    Sum {
        bound: f64,
        is_upper_bound: bool,
        parameters: Vec<ServerSumParameter>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSumParameter {
    pub name: String,
    pub weight: f64,
}

/// The experiment definition on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerExperiment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optimization: Vec<NameValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ServerParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<ServerConstraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<ServerMetric>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Navigation metadata extracted from response headers (`Link`, `Location`,
/// `Last-Modified`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentLinks {
    pub self_url: Option<String>,
    pub trials_url: Option<String>,
    pub next_trial_url: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Number-or-string assignment value on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Number(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAssignment {
    pub name: String,
    pub value: WireValue,
}

/// A trial request or suggestion: a full set of non-constant assignments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialAssignments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<WireAssignment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// An assignment suggestion returned by *next trial*, together with the
/// opaque URL used to report its values.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSuggestion {
    pub assignments: TrialAssignments,
    pub report_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTrialValue {
    pub metric_name: String,
    pub value: f64,
    #[serde(default)]
    pub error: f64,
}

/// The observation report posted back for a trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialValues {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<WireTrialValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

/// One trial in a list response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<WireAssignment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<WireTrialValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Relation → URL map, same shape as the `Link` header relations.
    #[serde(default, rename = "_links", skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialList {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trials: Vec<TrialItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentItem {
    pub name: String,
    #[serde(flatten)]
    pub experiment: ServerExperiment,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentList {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experiments: Vec<ExperimentItem>,
    /// Page links: `next` / `prev` relations from the response.
    #[serde(skip)]
    pub links: BTreeMap<String, String>,
}

/// Query parameters accepted by trial listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialListQuery {
    /// Comma-joined into the `status` query parameter.
    pub status: Vec<String>,
    /// Comma-joined `k=v` pairs into the `labelSelector` query parameter.
    pub label_selector: BTreeMap<String, String>,
}

impl TrialListQuery {
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if !self.status.is_empty() {
            pairs.push(("status", self.status.join(",")));
        }
        if !self.label_selector.is_empty() {
            let selector = self
                .label_selector
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("labelSelector", selector));
        }
        pairs
    }
}

// -- conversions ------------------------------------------------------------

/// Project the cluster experiment onto its wire representation. Constant
/// parameters are dropped.
pub fn to_server_experiment(experiment: &Experiment) -> ServerExperiment {
    ServerExperiment {
        optimization: experiment.optimization.clone(),
        parameters: experiment
            .non_constant_parameters()
            .map(|p| match &p.domain {
                ParameterDomain::Int { min, max } => ServerParameter {
                    name: p.name.clone(),
                    bounds: Some(Bounds {
                        min: *min,
                        max: *max,
                    }),
                    values: Vec::new(),
                },
                ParameterDomain::Categorical { values } => ServerParameter {
                    name: p.name.clone(),
                    bounds: None,
                    values: values.clone(),
                },
            })
            .collect(),
        constraints: experiment
            .constraints
            .iter()
            .map(|c| match c {
                Constraint::Order {
                    lower_parameter,
                    upper_parameter,
                } => ServerConstraint::Order {
                    lower_parameter: lower_parameter.clone(),
                    upper_parameter: upper_parameter.clone(),
                },
                Constraint::Sum {
                    bound,
                    is_upper_bound,
                    parameters,
                } => ServerConstraint::Sum {
                    bound: *bound,
                    is_upper_bound: *is_upper_bound,
                    parameters: parameters
                        .iter()
                        .map(|p| ServerSumParameter {
                            name: p.name.clone(),
                            weight: p.weight,
                        })
                        .collect(),
                },
            })
            .collect(),
        metrics: experiment
            .metrics
            .iter()
            .map(|m| ServerMetric {
                name: m.name.clone(),
                minimize: m.minimize,
                optimize: m.optimize,
            })
            .collect(),
        labels: BTreeMap::new(),
    }
}

/// Rebuild the optimizer-relevant projection of an experiment from its wire
/// form.
pub fn from_server_experiment(name: &str, server: &ServerExperiment) -> Experiment {
    let mut experiment = Experiment::new(name, "");
    experiment.optimization = server.optimization.clone();
    experiment.parameters = server
        .parameters
        .iter()
        .map(|p| Parameter {
            name: p.name.clone(),
            domain: match &p.bounds {
                Some(bounds) => ParameterDomain::Int {
                    min: bounds.min,
                    max: bounds.max,
                },
                None => ParameterDomain::Categorical {
                    values: p.values.clone(),
                },
            },
            baseline: None,
        })
        .collect();
    experiment.constraints = server
        .constraints
        .iter()
        .map(|c| match c {
            ServerConstraint::Order {
                lower_parameter,
                upper_parameter,
            } => Constraint::Order {
                lower_parameter: lower_parameter.clone(),
                upper_parameter: upper_parameter.clone(),
            },
            ServerConstraint::Sum {
                bound,
                is_upper_bound,
                parameters,
            } => Constraint::Sum {
                bound: *bound,
                is_upper_bound: *is_upper_bound,
                parameters: parameters
                    .iter()
                    .map(|p| SumConstraintParameter {
                        name: p.name.clone(),
                        weight: p.weight,
                    })
                    .collect(),
            },
        })
        .collect();
    experiment.metrics = server
        .metrics
        .iter()
        .map(|m| {
            let mut metric = Metric::new(&m.name, tw_types::MetricKind::Kubernetes, "");
            metric.minimize = m.minimize;
            metric.optimize = m.optimize;
            metric
        })
        .collect();
    experiment
}

/// Convert an inbound wire assignment to the cluster form. Numbers are
/// rounded to integers and clamped to the signed 32-bit range.
pub fn assignment_from_wire(wire: &WireAssignment) -> Assignment {
    let value = match &wire.value {
        WireValue::Number(n) => {
            let rounded = n.round();
            let clamped = rounded.clamp(f64::from(i32::MIN), f64::from(i32::MAX));
            ParameterValue::Int(clamped as i64)
        }
        WireValue::String(s) => ParameterValue::String(s.clone()),
    };
    Assignment {
        name: wire.name.clone(),
        value,
    }
}

/// Convert cluster assignments to the wire form.
pub fn assignments_to_wire(assignments: &[Assignment]) -> Vec<WireAssignment> {
    assignments
        .iter()
        .map(|a| WireAssignment {
            name: a.name.clone(),
            value: match &a.value {
                ParameterValue::Int(v) => WireValue::Number(*v as f64),
                ParameterValue::String(s) => WireValue::String(s.clone()),
            },
        })
        .collect()
}

/// Build the observation report for a finished trial. A failed trial reports
/// `failed = true` and omits numeric values.
pub fn trial_values_from(trial: &Trial) -> TrialValues {
    if trial.is_failed() {
        return TrialValues {
            values: Vec::new(),
            start_time: trial.status.start_time,
            completion_time: trial.status.completion_time,
            failed: true,
        };
    }
    TrialValues {
        values: trial
            .status
            .values
            .iter()
            .filter(|v| v.is_captured())
            .map(|v| WireTrialValue {
                metric_name: v.name.clone(),
                value: v.value_f64().unwrap_or(f64::NAN),
                error: v.error.parse().unwrap_or(0.0),
            })
            .collect(),
        start_time: trial.status.start_time,
        completion_time: trial.status.completion_time,
        failed: false,
    }
}
