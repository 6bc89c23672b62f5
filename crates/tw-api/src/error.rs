//! Error taxonomy for the remote optimizer binding.

use std::time::Duration;
use thiserror::Error;

/// Lower clamp bound for `Retry-After` hints.
pub const RETRY_AFTER_MIN: Duration = Duration::from_secs(5);
/// Upper clamp bound for `Retry-After` hints.
pub const RETRY_AFTER_MAX: Duration = Duration::from_secs(120);

/// Errors surfaced by optimizer operations.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("experiment not found")]
    ExperimentNotFound,

    #[error("experiment name is invalid")]
    NameInvalid,

    #[error("experiment name conflicts with an existing experiment")]
    NameConflict,

    /// The optimizer has no further assignments for this experiment.
    #[error("experiment stopped")]
    ExperimentStopped,

    /// No assignment is available right now; retry after the given delay.
    #[error("trial unavailable, retry after {retry_after:?}")]
    TrialUnavailable { retry_after: Duration },

    #[error("trial not found")]
    TrialNotFound,

    /// Values for this trial were already accepted.
    #[error("trial already reported")]
    AlreadyReported,

    #[error("request rejected: {message}")]
    InvalidRequest { message: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: status {status}: {message}")]
    Unexpected { status: u16, message: String },
}

impl ApiError {
    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TrialUnavailable { .. } | Self::Transport(_)
        )
    }
}

/// Clamp a parsed `Retry-After` delta to the accepted window. Absent or
/// unparseable values get the lower bound.
pub fn clamp_retry_after(seconds: Option<u64>) -> Duration {
    let requested = Duration::from_secs(seconds.unwrap_or(0));
    requested.clamp(RETRY_AFTER_MIN, RETRY_AFTER_MAX)
}
