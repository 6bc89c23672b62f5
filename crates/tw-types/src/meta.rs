//! Object metadata and the well-known Tunewise annotation/label keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Namespace prefix for all Tunewise-owned annotations, labels, and synthetic
/// condition types.
pub const VENDOR_PREFIX: &str = "tunewise.io";

/// Self link of the experiment on the remote optimizer.
pub const ANNOTATION_EXPERIMENT_URL: &str = "tunewise.io/experiment-url";
/// Link used to request the next assignment from the remote optimizer.
pub const ANNOTATION_NEXT_TRIAL_URL: &str = "tunewise.io/next-trial-url";
/// Link used to report a trial's values back to the remote optimizer.
pub const ANNOTATION_REPORT_TRIAL_URL: &str = "tunewise.io/report-trial-url";
/// Controls synchronization with the remote optimizer (see [`ServerSyncPolicy`]).
pub const ANNOTATION_SERVER_SYNC: &str = "tunewise.io/server-sync";
/// Comma-separated initializers blocking trial start; empty means unblocked.
pub const ANNOTATION_INITIALIZER: &str = "tunewise.io/initializer";

/// Label identifying the experiment a trial (or owned object) belongs to.
pub const LABEL_EXPERIMENT: &str = "tunewise.io/experiment";
/// Label identifying the trial an owned object belongs to.
pub const LABEL_TRIAL: &str = "tunewise.io/trial";
/// Label identifying the role of an object owned by a trial.
pub const LABEL_TRIAL_ROLE: &str = "tunewise.io/trial-role";

/// Role value for the trial-run job.
pub const TRIAL_ROLE_RUN: &str = "trialRun";
/// Role value for setup task objects.
pub const TRIAL_ROLE_SETUP: &str = "trialSetup";

/// Finalizer held while the remote optimizer has not observed terminal state.
pub const FINALIZER_SERVER_SYNC: &str = "serverSync.tunewise.io";

/// Metadata envelope carried by experiments, trials, and workspace objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Prefix used to generate a unique name when `name` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Optimistic concurrency token maintained by the workspace store.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.annotations.insert(key.to_string(), value.into());
    }

    pub fn remove_annotation(&mut self, key: &str) {
        self.annotations.remove(key);
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: impl Into<String>) {
        self.labels.insert(key.to_string(), value.into());
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }

    /// Whether a delete has been requested for this object.
    pub fn is_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Whether the `tunewise.io/initializer` annotation still names pending
    /// initializers. An absent or empty annotation does not block.
    pub fn has_pending_initializers(&self) -> bool {
        self.annotation(ANNOTATION_INITIALIZER)
            .map(|v| v.split(',').any(|i| !i.trim().is_empty()))
            .unwrap_or(false)
    }
}

/// How an experiment synchronizes with the remote optimizer, derived from the
/// `tunewise.io/server-sync` annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerSyncPolicy {
    /// Skip remote synchronization entirely.
    Disabled,
    /// Sync, and delete the remote experiment when the local one is deleted.
    DeleteCompleted,
    /// Sync, preserving remote data on teardown (the default).
    Enabled,
}

impl ServerSyncPolicy {
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("disabled") | Some("false") => Self::Disabled,
            Some("delete-completed") | Some("delete") => Self::DeleteCompleted,
            _ => Self::Enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}
