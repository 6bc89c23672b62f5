//! Parameter domains, concrete assignments, and constraints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::AssignmentError;

/// A concrete value assigned to a parameter within a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    String(String),
}

impl ParameterValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::String(_) => None,
        }
    }

    /// Numeric view used by constraint evaluation. Categorical values have no
    /// numeric interpretation.
    pub fn as_f64(&self) -> Option<f64> {
        self.as_i64().map(|v| v as f64)
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// The search range of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterDomain {
    /// Integer range `[min, max]`, inclusive.
    Int { min: i64, max: i64 },
    /// Enumerated set of string values.
    Categorical { values: Vec<String> },
}

impl ParameterDomain {
    /// A degenerate domain produces a constant: the single value it admits.
    pub fn is_constant(&self) -> bool {
        match self {
            Self::Int { min, max } => min == max,
            Self::Categorical { values } => values.len() == 1,
        }
    }

    /// The constant value of a degenerate domain.
    pub fn constant_value(&self) -> Option<ParameterValue> {
        if !self.is_constant() {
            return None;
        }
        match self {
            Self::Int { min, .. } => Some(ParameterValue::Int(*min)),
            Self::Categorical { values } => {
                values.first().cloned().map(ParameterValue::String)
            }
        }
    }

    pub fn contains(&self, value: &ParameterValue) -> bool {
        match (self, value) {
            (Self::Int { min, max }, ParameterValue::Int(v)) => min <= v && v <= max,
            (Self::Categorical { values }, ParameterValue::String(v)) => {
                values.iter().any(|candidate| candidate == v)
            }
            _ => false,
        }
    }
}

/// One tuning knob of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(flatten)]
    pub domain: ParameterDomain,
    /// Seed assignment sent once to the remote optimizer as the baseline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<ParameterValue>,
}

impl Parameter {
    pub fn int(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            domain: ParameterDomain::Int { min, max },
            baseline: None,
        }
    }

    pub fn categorical(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            domain: ParameterDomain::Categorical { values },
            baseline: None,
        }
    }

    pub fn with_baseline(mut self, value: impl Into<ParameterValue>) -> Self {
        self.baseline = Some(value.into());
        self
    }

    pub fn is_constant(&self) -> bool {
        self.domain.is_constant()
    }
}

/// A concrete `{name, value}` pair on a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    pub value: ParameterValue,
}

impl Assignment {
    pub fn new(name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One weighted term of a sum constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumConstraintParameter {
    pub name: String,
    pub weight: f64,
}

/// A relationship that every trial's assignments must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Constraint {
    /// `lower ≤ upper` over the named numeric parameters.
    Order {
        lower_parameter: String,
        upper_parameter: String,
    },
    /// `Σ wᵢ·xᵢ ≤ bound` (or `≥` when `is_upper_bound` is false).
    Sum {
        bound: f64,
        is_upper_bound: bool,
        parameters: Vec<SumConstraintParameter>,
    },
}

impl Constraint {
    /// Evaluate this constraint against a set of assignments. Missing or
    /// non-numeric assignments fail the constraint.
    pub fn check(&self, assignments: &[Assignment]) -> Result<(), AssignmentError> {
        let by_name: HashMap<&str, &ParameterValue> = assignments
            .iter()
            .map(|a| (a.name.as_str(), &a.value))
            .collect();

        let numeric = |name: &str| -> Result<f64, AssignmentError> {
            by_name
                .get(name)
                .and_then(|v| v.as_f64())
                .ok_or_else(|| AssignmentError::Missing {
                    name: name.to_string(),
                })
        };

        match self {
            Self::Order {
                lower_parameter,
                upper_parameter,
            } => {
                let lower = numeric(lower_parameter)?;
                let upper = numeric(upper_parameter)?;
                if lower <= upper {
                    Ok(())
                } else {
                    Err(AssignmentError::ConstraintViolated {
                        detail: format!(
                            "{lower_parameter} = {lower} exceeds {upper_parameter} = {upper}"
                        ),
                    })
                }
            }
            Self::Sum {
                bound,
                is_upper_bound,
                parameters,
            } => {
                let mut total = 0.0;
                for p in parameters {
                    total += p.weight * numeric(&p.name)?;
                }
                let ok = if *is_upper_bound {
                    total <= *bound
                } else {
                    total >= *bound
                };
                if ok {
                    Ok(())
                } else {
                    let op = if *is_upper_bound { "≤" } else { "≥" };
                    Err(AssignmentError::ConstraintViolated {
                        detail: format!("weighted sum {total} is not {op} {bound}"),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_domain_membership() {
        let domain = ParameterDomain::Int { min: 100, max: 1000 };
        assert!(domain.contains(&ParameterValue::Int(100)));
        assert!(domain.contains(&ParameterValue::Int(1000)));
        assert!(!domain.contains(&ParameterValue::Int(99)));
        assert!(!domain.contains(&ParameterValue::String("250".into())));
    }

    #[test]
    fn categorical_domain_membership() {
        let domain = ParameterDomain::Categorical {
            values: vec!["small".into(), "large".into()],
        };
        assert!(domain.contains(&ParameterValue::String("small".into())));
        assert!(!domain.contains(&ParameterValue::String("medium".into())));
        assert!(!domain.contains(&ParameterValue::Int(1)));
    }

    #[test]
    fn degenerate_domains_are_constants() {
        let int = ParameterDomain::Int { min: 4, max: 4 };
        assert!(int.is_constant());
        assert_eq!(int.constant_value(), Some(ParameterValue::Int(4)));

        let cat = ParameterDomain::Categorical {
            values: vec!["only".into()],
        };
        assert!(cat.is_constant());
        assert_eq!(
            cat.constant_value(),
            Some(ParameterValue::String("only".into()))
        );

        let open = ParameterDomain::Int { min: 1, max: 2 };
        assert!(!open.is_constant());
        assert_eq!(open.constant_value(), None);
    }

    #[test]
    fn order_constraint() {
        let constraint = Constraint::Order {
            lower_parameter: "a".into(),
            upper_parameter: "b".into(),
        };

        let ok = vec![Assignment::new("a", 1), Assignment::new("b", 2)];
        assert!(constraint.check(&ok).is_ok());

        let equal = vec![Assignment::new("a", 2), Assignment::new("b", 2)];
        assert!(constraint.check(&equal).is_ok());

        let bad = vec![Assignment::new("a", 3), Assignment::new("b", 2)];
        assert!(matches!(
            constraint.check(&bad),
            Err(AssignmentError::ConstraintViolated { .. })
        ));
    }

    #[test]
    fn sum_constraint_bounds() {
        let constraint = Constraint::Sum {
            bound: 10.0,
            is_upper_bound: true,
            parameters: vec![
                SumConstraintParameter {
                    name: "x".into(),
                    weight: 1.0,
                },
                SumConstraintParameter {
                    name: "y".into(),
                    weight: 2.0,
                },
            ],
        };

        let ok = vec![Assignment::new("x", 2), Assignment::new("y", 4)];
        assert!(constraint.check(&ok).is_ok());

        let bad = vec![Assignment::new("x", 3), Assignment::new("y", 4)];
        assert!(constraint.check(&bad).is_err());
    }

    #[test]
    fn sum_constraint_missing_parameter() {
        let constraint = Constraint::Sum {
            bound: 1.0,
            is_upper_bound: false,
            parameters: vec![SumConstraintParameter {
                name: "missing".into(),
                weight: 1.0,
            }],
        };
        assert!(matches!(
            constraint.check(&[]),
            Err(AssignmentError::Missing { .. })
        ));
    }

    #[test]
    fn parameter_value_display() {
        assert_eq!(ParameterValue::Int(250).to_string(), "250");
        assert_eq!(
            ParameterValue::String("large".into()).to_string(),
            "large"
        );
    }

    #[test]
    fn untagged_value_serde() {
        let int: ParameterValue = serde_json::from_str("42").unwrap();
        assert_eq!(int, ParameterValue::Int(42));

        let string: ParameterValue = serde_json::from_str("\"fast\"").unwrap();
        assert_eq!(string, ParameterValue::String("fast".into()));
    }
}
