use thiserror::Error;

/// Main error type for the Tunewise system.
#[derive(Error, Debug)]
pub enum TwError {
    #[error("Assignment error: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while validating a trial's assignments against its
/// experiment's parameters and constraints.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssignmentError {
    #[error("missing assignment for parameter {name}")]
    Missing { name: String },

    #[error("duplicate assignment for parameter {name}")]
    Duplicate { name: String },

    #[error("assignment for unknown parameter {name}")]
    Unknown { name: String },

    #[error("value {value} is outside the domain of parameter {name}")]
    OutOfDomain { name: String, value: String },

    #[error("constraint violated: {detail}")]
    ConstraintViolated { detail: String },
}

/// Errors raised while validating an experiment definition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("duplicate parameter name: {name}")]
    DuplicateParameter { name: String },

    #[error("duplicate metric name: {name}")]
    DuplicateMetric { name: String },

    #[error("experiment declares no metrics")]
    NoMetrics,

    #[error("baseline must be specified on all or none of the parameters")]
    PartialBaseline,

    #[error("baseline for parameter {name} is outside its domain")]
    BaselineOutOfDomain { name: String },

    #[error("baseline violates constraint: {detail}")]
    BaselineConstraint { detail: String },

    #[error("patch {index} targets the trial run job but is not a strategic merge patch")]
    TrialJobPatchKind { index: usize },

    #[error("replicas must not be negative")]
    NegativeReplicas,
}

/// Result type alias for Tunewise operations.
pub type TwResult<T> = Result<T, TwError>;
