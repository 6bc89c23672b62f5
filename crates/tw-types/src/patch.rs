//! Patch templates and the rendered, target-bound operations derived from
//! them.

use serde::{Deserialize, Serialize};

/// Default attempt budget for a freshly rendered patch operation.
pub const DEFAULT_PATCH_ATTEMPTS: u32 = 3;

/// How a patch body is applied to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    /// Strategic merge patch (the default).
    Strategic,
    /// JSON merge patch (RFC 7386).
    Merge,
    /// JSON patch (RFC 6902).
    Json,
}

impl Default for PatchKind {
    fn default() -> Self {
        Self::Strategic
    }
}

/// Reference to an object in the workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl ObjectRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_version: String::new(),
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() && self.name.is_empty()
    }

    /// Extract a reference from a rendered patch body carrying standard
    /// `apiVersion`/`kind`/`metadata` fields. Only strategic and merge
    /// patches embed their target this way.
    pub fn from_patch_body(body: &serde_json::Value) -> Option<Self> {
        let kind = body.get("kind")?.as_str()?.to_string();
        let metadata = body.get("metadata")?;
        let name = metadata.get("name")?.as_str()?.to_string();
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            api_version: body
                .get("apiVersion")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            kind,
            name,
            namespace: metadata
                .get("namespace")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{} in {}", self.kind, self.name, self.namespace)
        }
    }
}

/// A declarative patch recipe on the experiment. The body is a template
/// rendered against each trial's assignments by the external renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchTemplate {
    #[serde(default)]
    pub kind: PatchKind,
    /// Template producing the patch body.
    pub patch: String,
    /// Explicit target; when absent the target is extracted from the rendered
    /// body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<ObjectRef>,
}

impl PatchTemplate {
    pub fn strategic(patch: impl Into<String>, target_ref: Option<ObjectRef>) -> Self {
        Self {
            kind: PatchKind::Strategic,
            patch: patch.into(),
            target_ref,
        }
    }

    /// Whether this template addresses the trial's own run job. The trial job
    /// is referenced by kind with an empty name; the concrete job name only
    /// exists once a trial does.
    pub fn targets_trial_job(&self) -> bool {
        self.target_ref
            .as_ref()
            .map(|r| r.kind == "Job" && r.name.is_empty())
            .unwrap_or(false)
    }
}

/// A rendered, ready-to-apply change to the workspace, owned by a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub target_ref: ObjectRef,
    pub patch_kind: PatchKind,
    /// Rendered patch body.
    pub data: String,
    /// Remaining apply attempts; zero means applied (or deferred to
    /// job-submission time for the trial-job patch).
    pub attempts_remaining: u32,
}

impl PatchOperation {
    pub fn is_applied(&self) -> bool {
        self.attempts_remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_extraction_from_body() {
        let body = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "app", "namespace": "default"},
            "spec": {}
        });
        let target = ObjectRef::from_patch_body(&body).unwrap();
        assert_eq!(target.kind, "Deployment");
        assert_eq!(target.name, "app");
        assert_eq!(target.namespace, "default");
        assert_eq!(target.api_version, "apps/v1");
    }

    #[test]
    fn target_extraction_requires_kind_and_name() {
        let no_name = json!({"kind": "Deployment", "metadata": {}});
        assert!(ObjectRef::from_patch_body(&no_name).is_none());

        let no_kind = json!({"metadata": {"name": "app"}});
        assert!(ObjectRef::from_patch_body(&no_kind).is_none());
    }

    #[test]
    fn trial_job_template_detection() {
        let own_job = PatchTemplate {
            kind: PatchKind::Strategic,
            patch: "{}".into(),
            target_ref: Some(ObjectRef {
                kind: "Job".into(),
                ..Default::default()
            }),
        };
        assert!(own_job.targets_trial_job());

        let named_job = PatchTemplate {
            kind: PatchKind::Strategic,
            patch: "{}".into(),
            target_ref: Some(ObjectRef::new("Job", "other", "default")),
        };
        assert!(!named_job.targets_trial_job());

        let extracted = PatchTemplate::strategic("{}", None);
        assert!(!extracted.targets_trial_job());
    }

    #[test]
    fn patch_kind_serde() {
        assert_eq!(
            serde_json::to_string(&PatchKind::Strategic).unwrap(),
            "\"strategic\""
        );
        let kind: PatchKind = serde_json::from_str("\"merge\"").unwrap();
        assert_eq!(kind, PatchKind::Merge);
    }
}
