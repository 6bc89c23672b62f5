//! Workspace client abstraction.
//!
//! The cluster object store is an external collaborator; the engine and the
//! experiment controller program against [`WorkspaceClient`]. The in-process
//! [`MemoryWorkspace`] simulates it for development and integration tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use tw_collect::{ServiceEndpoint, ServicePort};
use tw_types::{Experiment, ObjectRef, PatchKind, Trial};

/// Errors surfaced by workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency failure: the caller's copy is stale.
    #[error("conflicting write: {0}")]
    Conflict(String),

    /// RBAC denied the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    /// Transient store failure; safe to retry.
    #[error("workspace unavailable: {0}")]
    Unavailable(String),
}

impl WorkspaceError {
    /// Transient errors are retried locally without touching attempt budgets.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }
}

/// A loosely-typed object living in the workspace (deployments, jobs,
/// services, setup objects). `status` carries whatever the object reports,
/// including a `conditions` array for readiness checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceObject {
    pub reference: ObjectRef,
    pub labels: BTreeMap<String, String>,
    pub data: Value,
    pub status: Value,
}

impl WorkspaceObject {
    pub fn new(reference: ObjectRef) -> Self {
        Self {
            reference,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Status condition lookup: `status.conditions[].{type,status}`.
    pub fn condition_status(&self, condition_type: &str) -> Option<String> {
        self.status
            .get("conditions")?
            .as_array()?
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
            .and_then(|c| c.get("status"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Access to the shared cluster store. Every call is a suspension point and
/// honours task cancellation by being droppable mid-flight; writes are whole
/// objects guarded by `resource_version`.
#[async_trait]
pub trait WorkspaceClient: Send + Sync {
    // -- experiments --------------------------------------------------------

    async fn get_experiment(&self, namespace: &str, name: &str)
        -> Result<Experiment, WorkspaceError>;

    async fn update_experiment(&self, experiment: &Experiment)
        -> Result<Experiment, WorkspaceError>;

    async fn list_experiments(&self) -> Result<Vec<Experiment>, WorkspaceError>;

    async fn delete_experiment(&self, namespace: &str, name: &str) -> Result<(), WorkspaceError>;

    // -- trials -------------------------------------------------------------

    async fn get_trial(&self, namespace: &str, name: &str) -> Result<Trial, WorkspaceError>;

    /// Create a trial; a `generate_name` prefix is expanded to a unique name.
    async fn create_trial(&self, trial: &Trial) -> Result<Trial, WorkspaceError>;

    async fn update_trial(&self, trial: &Trial) -> Result<Trial, WorkspaceError>;

    async fn delete_trial(&self, namespace: &str, name: &str) -> Result<(), WorkspaceError>;

    /// Trials carrying `label=value`, across all namespaces.
    async fn list_trials(&self, label: &str, value: &str) -> Result<Vec<Trial>, WorkspaceError>;

    // -- loosely-typed objects ----------------------------------------------

    async fn get_object(&self, reference: &ObjectRef)
        -> Result<WorkspaceObject, WorkspaceError>;

    async fn create_object(&self, object: &WorkspaceObject) -> Result<(), WorkspaceError>;

    async fn delete_object(&self, reference: &ObjectRef) -> Result<(), WorkspaceError>;

    /// Delete every object carrying `label=value` in `namespace`.
    async fn delete_labeled(
        &self,
        namespace: &str,
        label: &str,
        value: &str,
    ) -> Result<(), WorkspaceError>;

    /// Apply a patch of the given kind to the target object.
    async fn apply_patch(
        &self,
        target: &ObjectRef,
        kind: PatchKind,
        data: &str,
    ) -> Result<(), WorkspaceError>;

    // -- namespaces and services --------------------------------------------

    async fn list_namespaces(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, WorkspaceError>;

    async fn create_namespace(
        &self,
        generate_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, WorkspaceError>;

    /// Services in `namespace` matching the selector, as reachable endpoints.
    async fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ServiceEndpoint>, WorkspaceError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

type NamespacedKey = (String, String);
type ObjectKey = (String, String, String);

/// A fully in-process workspace. Useful for engine development, integration
/// testing, and validating reconcile behaviour before pointing the
/// controllers at a real cluster.
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    experiments: DashMap<NamespacedKey, Experiment>,
    trials: DashMap<NamespacedKey, Trial>,
    objects: DashMap<ObjectKey, WorkspaceObject>,
    namespaces: DashMap<String, BTreeMap<String, String>>,
    /// Kinds whose create/patch calls answer `Forbidden`; scripted by tests.
    forbidden_kinds: Mutex<HashSet<String>>,
}

/// Five-character suffix expanding a `generate_name` prefix, the way the
/// real object store does it.
fn random_suffix() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    fn object_key(reference: &ObjectRef) -> ObjectKey {
        (
            reference.namespace.clone(),
            reference.kind.clone(),
            reference.name.clone(),
        )
    }

    fn check_permission(&self, kind: &str) -> Result<(), WorkspaceError> {
        if self.forbidden_kinds.lock().contains(kind) {
            return Err(WorkspaceError::Forbidden(format!(
                "not permitted to write {kind} objects"
            )));
        }
        Ok(())
    }

    fn matches(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }

    // -- test scripting -----------------------------------------------------

    /// Make writes of the given kind fail with `Forbidden`.
    pub fn forbid_kind(&self, kind: &str) {
        self.forbidden_kinds.lock().insert(kind.to_string());
    }

    /// Seed a namespace with labels.
    pub fn add_namespace(&self, name: &str, labels: BTreeMap<String, String>) {
        self.namespaces.insert(name.to_string(), labels);
    }

    /// Seed or replace a loosely-typed object, bypassing permission checks.
    pub fn put_object(&self, object: WorkspaceObject) {
        self.objects
            .insert(Self::object_key(&object.reference), object);
    }

    /// Overwrite an object's reported status (e.g. simulate a job finishing).
    pub fn put_object_status(&self, reference: &ObjectRef, status: Value) {
        if let Some(mut entry) = self.objects.get_mut(&Self::object_key(reference)) {
            entry.status = status;
        }
    }

    pub fn object(&self, reference: &ObjectRef) -> Option<WorkspaceObject> {
        self.objects
            .get(&Self::object_key(reference))
            .map(|o| o.clone())
    }

    /// Seed an experiment without version checking.
    pub fn put_experiment(&self, experiment: Experiment) {
        let key = (
            experiment.metadata.namespace.clone(),
            experiment.metadata.name.clone(),
        );
        self.experiments.insert(key, experiment);
    }

    /// Seed a trial without version checking.
    pub fn put_trial(&self, trial: Trial) {
        let key = (trial.metadata.namespace.clone(), trial.metadata.name.clone());
        self.trials.insert(key, trial);
    }

    pub fn namespace_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.namespaces.get(name).map(|l| l.clone())
    }
}

#[async_trait]
impl WorkspaceClient for MemoryWorkspace {
    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Experiment, WorkspaceError> {
        self.experiments
            .get(&(namespace.to_string(), name.to_string()))
            .map(|e| e.clone())
            .ok_or_else(|| WorkspaceError::NotFound(format!("Experiment/{name} in {namespace}")))
    }

    async fn update_experiment(
        &self,
        experiment: &Experiment,
    ) -> Result<Experiment, WorkspaceError> {
        let key = (
            experiment.metadata.namespace.clone(),
            experiment.metadata.name.clone(),
        );
        let mut entry = self.experiments.get_mut(&key).ok_or_else(|| {
            WorkspaceError::NotFound(format!("Experiment/{}", experiment.metadata.name))
        })?;
        if entry.metadata.resource_version != experiment.metadata.resource_version {
            return Err(WorkspaceError::Conflict(format!(
                "Experiment/{} was modified concurrently",
                experiment.metadata.name
            )));
        }
        let mut updated = experiment.clone();
        updated.metadata.resource_version += 1;
        *entry = updated.clone();
        Ok(updated)
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>, WorkspaceError> {
        Ok(self.experiments.iter().map(|e| e.clone()).collect())
    }

    async fn delete_experiment(&self, namespace: &str, name: &str) -> Result<(), WorkspaceError> {
        self.experiments
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| WorkspaceError::NotFound(format!("Experiment/{name}")))
    }

    async fn get_trial(&self, namespace: &str, name: &str) -> Result<Trial, WorkspaceError> {
        self.trials
            .get(&(namespace.to_string(), name.to_string()))
            .map(|t| t.clone())
            .ok_or_else(|| WorkspaceError::NotFound(format!("Trial/{name} in {namespace}")))
    }

    async fn create_trial(&self, trial: &Trial) -> Result<Trial, WorkspaceError> {
        let mut created = trial.clone();
        if created.metadata.name.is_empty() {
            let prefix = created
                .metadata
                .generate_name
                .clone()
                .unwrap_or_else(|| "trial-".to_string());
            created.metadata.name = format!("{prefix}{}", random_suffix());
        }
        created.metadata.resource_version = 1;
        let key = (
            created.metadata.namespace.clone(),
            created.metadata.name.clone(),
        );
        if self.trials.contains_key(&key) {
            return Err(WorkspaceError::Conflict(format!(
                "Trial/{} already exists",
                created.metadata.name
            )));
        }
        self.trials.insert(key, created.clone());
        Ok(created)
    }

    async fn update_trial(&self, trial: &Trial) -> Result<Trial, WorkspaceError> {
        let key = (trial.metadata.namespace.clone(), trial.metadata.name.clone());
        let mut entry = self
            .trials
            .get_mut(&key)
            .ok_or_else(|| WorkspaceError::NotFound(format!("Trial/{}", trial.metadata.name)))?;
        if entry.metadata.resource_version != trial.metadata.resource_version {
            return Err(WorkspaceError::Conflict(format!(
                "Trial/{} was modified concurrently",
                trial.metadata.name
            )));
        }
        let mut updated = trial.clone();
        updated.metadata.resource_version += 1;
        *entry = updated.clone();
        Ok(updated)
    }

    async fn delete_trial(&self, namespace: &str, name: &str) -> Result<(), WorkspaceError> {
        self.trials
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| WorkspaceError::NotFound(format!("Trial/{name}")))
    }

    async fn list_trials(&self, label: &str, value: &str) -> Result<Vec<Trial>, WorkspaceError> {
        Ok(self
            .trials
            .iter()
            .filter(|t| t.metadata.label(label) == Some(value))
            .map(|t| t.clone())
            .collect())
    }

    async fn get_object(
        &self,
        reference: &ObjectRef,
    ) -> Result<WorkspaceObject, WorkspaceError> {
        self.objects
            .get(&Self::object_key(reference))
            .map(|o| o.clone())
            .ok_or_else(|| WorkspaceError::NotFound(reference.to_string()))
    }

    async fn create_object(&self, object: &WorkspaceObject) -> Result<(), WorkspaceError> {
        self.check_permission(&object.reference.kind)?;
        let key = Self::object_key(&object.reference);
        if self.objects.contains_key(&key) {
            return Err(WorkspaceError::Conflict(format!(
                "{} already exists",
                object.reference
            )));
        }
        self.objects.insert(key, object.clone());
        Ok(())
    }

    async fn delete_object(&self, reference: &ObjectRef) -> Result<(), WorkspaceError> {
        self.check_permission(&reference.kind)?;
        self.objects
            .remove(&Self::object_key(reference))
            .map(|_| ())
            .ok_or_else(|| WorkspaceError::NotFound(reference.to_string()))
    }

    async fn delete_labeled(
        &self,
        namespace: &str,
        label: &str,
        value: &str,
    ) -> Result<(), WorkspaceError> {
        let doomed: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|o| {
                o.reference.namespace == namespace
                    && o.labels.get(label).map(String::as_str) == Some(value)
            })
            .map(|o| Self::object_key(&o.reference))
            .collect();
        for key in doomed {
            self.objects.remove(&key);
        }
        Ok(())
    }

    async fn apply_patch(
        &self,
        target: &ObjectRef,
        kind: PatchKind,
        data: &str,
    ) -> Result<(), WorkspaceError> {
        self.check_permission(&target.kind)?;
        let patch: Value = serde_json::from_str(data)
            .map_err(|e| WorkspaceError::Invalid(format!("patch is not valid JSON: {e}")))?;
        let mut entry = self
            .objects
            .get_mut(&Self::object_key(target))
            .ok_or_else(|| WorkspaceError::NotFound(target.to_string()))?;
        match kind {
            PatchKind::Strategic | PatchKind::Merge => {
                merge_json(&mut entry.data, &patch);
            }
            PatchKind::Json => {
                apply_json_patch(&mut entry.data, &patch)?;
            }
        }
        Ok(())
    }

    async fn list_namespaces(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, WorkspaceError> {
        let mut names: Vec<String> = self
            .namespaces
            .iter()
            .filter(|entry| Self::matches(entry.value(), selector))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_namespace(
        &self,
        generate_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, WorkspaceError> {
        self.check_permission("Namespace")?;
        let name = format!("{generate_name}{}", random_suffix());
        self.namespaces.insert(name.clone(), labels.clone());
        Ok(name)
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ServiceEndpoint>, WorkspaceError> {
        let mut endpoints = Vec::new();
        for object in self.objects.iter() {
            if object.reference.kind != "Service"
                || object.reference.namespace != namespace
                || !Self::matches(&object.labels, selector)
            {
                continue;
            }
            let spec = object.data.get("spec").cloned().unwrap_or_default();
            let cluster_address = spec
                .get("clusterIP")
                .and_then(Value::as_str)
                .unwrap_or(&object.reference.name)
                .to_string();
            let ports = spec
                .get("ports")
                .and_then(Value::as_array)
                .map(|ports| {
                    ports
                        .iter()
                        .filter_map(|p| {
                            Some(ServicePort {
                                name: p
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                port: p.get("port").and_then(Value::as_u64)? as u16,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            endpoints.push(ServiceEndpoint {
                cluster_address,
                ports,
            });
        }
        Ok(endpoints)
    }
}

/// JSON merge: objects merge recursively, `null` removes, everything else
/// replaces.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    base_map.remove(key);
                } else {
                    merge_json(
                        base_map.entry(key.clone()).or_insert(Value::Null),
                        patch_value,
                    );
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Minimal RFC-6902 support: `add`, `replace`, and `remove` with simple
/// pointer paths.
fn apply_json_patch(base: &mut Value, patch: &Value) -> Result<(), WorkspaceError> {
    let operations = patch
        .as_array()
        .ok_or_else(|| WorkspaceError::Invalid("JSON patch must be an array".into()))?;
    for operation in operations {
        let op = operation.get("op").and_then(Value::as_str).unwrap_or("");
        let path = operation.get("path").and_then(Value::as_str).unwrap_or("");
        match op {
            "add" | "replace" => {
                let value = operation.get("value").cloned().unwrap_or(Value::Null);
                let Some((parent, key)) = pointer_parent(base, path) else {
                    return Err(WorkspaceError::Invalid(format!("bad patch path {path}")));
                };
                match parent {
                    Value::Object(map) => {
                        map.insert(key, value);
                    }
                    _ => {
                        return Err(WorkspaceError::Invalid(format!(
                            "patch path {path} does not address an object"
                        )))
                    }
                }
            }
            "remove" => {
                if let Some((Value::Object(map), key)) = pointer_parent(base, path) {
                    map.remove(&key);
                }
            }
            other => {
                return Err(WorkspaceError::Invalid(format!(
                    "unsupported patch op {other:?}"
                )))
            }
        }
    }
    Ok(())
}

fn pointer_parent<'a>(base: &'a mut Value, path: &str) -> Option<(&'a mut Value, String)> {
    let (parent_path, key) = path.rsplit_once('/')?;
    let parent = if parent_path.is_empty() {
        base
    } else {
        base.pointer_mut(parent_path)?
    };
    Some((parent, key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn trial_optimistic_concurrency() {
        let workspace = MemoryWorkspace::new();
        let trial = Trial::new("t-1", "default");
        let created = workspace.create_trial(&trial).await.unwrap();
        assert_eq!(created.metadata.resource_version, 1);

        let updated = workspace.update_trial(&created).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);

        // Writing the stale copy conflicts.
        let stale = workspace.update_trial(&created).await;
        assert!(matches!(stale, Err(WorkspaceError::Conflict(_))));
    }

    #[tokio::test]
    async fn generate_name_expansion() {
        let workspace = MemoryWorkspace::new();
        let mut trial = Trial::new("", "default");
        trial.metadata.generate_name = Some("tuning-".into());
        let created = workspace.create_trial(&trial).await.unwrap();
        assert!(created.metadata.name.starts_with("tuning-"));
    }

    #[tokio::test]
    async fn patch_application_merge() {
        let workspace = MemoryWorkspace::new();
        let reference = ObjectRef::new("Deployment", "app", "default");
        workspace.put_object(
            WorkspaceObject::new(reference.clone()).with_data(json!({
                "spec": {"replicas": 1, "template": {"spec": {"cpu": "100m"}}}
            })),
        );

        workspace
            .apply_patch(
                &reference,
                PatchKind::Strategic,
                r#"{"spec": {"template": {"spec": {"cpu": "250m"}}}}"#,
            )
            .await
            .unwrap();

        let object = workspace.object(&reference).unwrap();
        assert_eq!(
            object.data.pointer("/spec/template/spec/cpu"),
            Some(&json!("250m"))
        );
        // Untouched siblings survive the merge.
        assert_eq!(object.data.pointer("/spec/replicas"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn patch_missing_target_is_not_found() {
        let workspace = MemoryWorkspace::new();
        let reference = ObjectRef::new("Deployment", "ghost", "default");
        let result = workspace
            .apply_patch(&reference, PatchKind::Strategic, "{}")
            .await;
        assert!(matches!(result, Err(WorkspaceError::NotFound(_))));
    }

    #[tokio::test]
    async fn json_patch_operations() {
        let workspace = MemoryWorkspace::new();
        let reference = ObjectRef::new("ConfigMap", "cm", "default");
        workspace.put_object(
            WorkspaceObject::new(reference.clone()).with_data(json!({"data": {"a": "1"}})),
        );

        workspace
            .apply_patch(
                &reference,
                PatchKind::Json,
                r#"[{"op": "replace", "path": "/data/a", "value": "2"},
                    {"op": "add", "path": "/data/b", "value": "3"}]"#,
            )
            .await
            .unwrap();

        let object = workspace.object(&reference).unwrap();
        assert_eq!(object.data.pointer("/data/a"), Some(&json!("2")));
        assert_eq!(object.data.pointer("/data/b"), Some(&json!("3")));
    }

    #[tokio::test]
    async fn forbidden_kinds_are_scripted() {
        let workspace = MemoryWorkspace::new();
        workspace.forbid_kind("Role");
        let role = WorkspaceObject::new(ObjectRef::new("Role", "setup", "default"));
        assert!(matches!(
            workspace.create_object(&role).await,
            Err(WorkspaceError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn namespace_listing_by_selector() {
        let workspace = MemoryWorkspace::new();
        let team: BTreeMap<String, String> =
            [("team".to_string(), "perf".to_string())].into_iter().collect();
        workspace.add_namespace("perf-1", team.clone());
        workspace.add_namespace("perf-2", team.clone());
        workspace.add_namespace("other", BTreeMap::new());

        let names = workspace.list_namespaces(&team).await.unwrap();
        assert_eq!(names, vec!["perf-1", "perf-2"]);
    }

    #[tokio::test]
    async fn service_listing_parses_endpoints() {
        let workspace = MemoryWorkspace::new();
        let labels: BTreeMap<String, String> =
            [("app".to_string(), "prom".to_string())].into_iter().collect();
        let mut service = WorkspaceObject::new(ObjectRef::new("Service", "prom", "monitoring"))
            .with_data(json!({
                "spec": {
                    "clusterIP": "10.0.0.5",
                    "ports": [{"name": "web", "port": 9090}]
                }
            }));
        service.labels = labels.clone();
        workspace.put_object(service);

        let endpoints = workspace.list_services("monitoring", &labels).await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].cluster_address, "10.0.0.5");
        assert_eq!(endpoints[0].ports[0].port, 9090);
    }

    #[test]
    fn merge_json_null_removes() {
        let mut base = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_json(&mut base, &json!({"b": {"c": null}, "a": 9}));
        assert_eq!(base, json!({"a": 9, "b": {"d": 3}}));
    }
}
