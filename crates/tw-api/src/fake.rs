//! A fully in-process optimizer that simulates the remote service.
//!
//! Useful for controller development, integration testing, and validating
//! reconcile behaviour without network access. Tests script it by queueing
//! suggestions and toggling availability.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::client::Optimizer;
use crate::error::{clamp_retry_after, ApiError};
use crate::model::{
    ExperimentItem, ExperimentLinks, ExperimentList, ServerExperiment, TrialAssignments,
    TrialItem, TrialList, TrialListQuery, TrialSuggestion, TrialValues,
};

#[derive(Debug, Default)]
struct FakeState {
    experiments: HashMap<String, ServerExperiment>,
    suggestions: VecDeque<TrialAssignments>,
    /// When set, the next `next_trial` call answers 503 with this delay.
    unavailable: Option<Duration>,
    stopped: bool,
    reports: HashMap<String, TrialValues>,
    abandoned: Vec<String>,
    created_trials: Vec<TrialAssignments>,
    deleted_experiments: Vec<String>,
    experiment_labels: HashMap<String, BTreeMap<String, String>>,
    trial_labels: HashMap<String, BTreeMap<String, String>>,
    trial_counter: u64,
}

/// In-memory [`Optimizer`] double.
#[derive(Debug, Default)]
pub struct FakeOptimizer {
    state: Mutex<FakeState>,
}

impl FakeOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an assignment set to hand out on the next `next_trial` call.
    pub fn push_suggestion(&self, assignments: TrialAssignments) {
        self.state.lock().suggestions.push_back(assignments);
    }

    /// Make the next `next_trial` call answer "unavailable, retry later".
    pub fn set_unavailable(&self, retry_after: Duration) {
        self.state.lock().unavailable = Some(retry_after);
    }

    /// Stop the experiment: further suggestions answer `experiment-stopped`.
    pub fn stop_experiment(&self) {
        self.state.lock().stopped = true;
    }

    // -- inspection ---------------------------------------------------------

    pub fn reports(&self) -> Vec<(String, TrialValues)> {
        self.state
            .lock()
            .reports
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn report_for(&self, url: &str) -> Option<TrialValues> {
        self.state.lock().reports.get(url).cloned()
    }

    pub fn abandoned(&self) -> Vec<String> {
        self.state.lock().abandoned.clone()
    }

    pub fn created_trials(&self) -> Vec<TrialAssignments> {
        self.state.lock().created_trials.clone()
    }

    pub fn was_deleted(&self, name: &str) -> bool {
        self.state
            .lock()
            .deleted_experiments
            .iter()
            .any(|n| n == name)
    }

    fn links_for(name: &str) -> ExperimentLinks {
        ExperimentLinks {
            self_url: Some(format!("fake:/experiments/{name}")),
            trials_url: Some(format!("fake:/experiments/{name}/trials")),
            next_trial_url: Some(format!("fake:/experiments/{name}/nextTrial")),
            last_modified: None,
        }
    }

    fn name_from_url(url: &str) -> &str {
        url.trim_start_matches("fake:/experiments/")
            .split('/')
            .next()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Optimizer for FakeOptimizer {
    async fn create_experiment(
        &self,
        name: &str,
        experiment: &ServerExperiment,
    ) -> Result<(ServerExperiment, ExperimentLinks), ApiError> {
        let mut state = self.state.lock();
        state
            .experiments
            .insert(name.to_string(), experiment.clone());
        Ok((experiment.clone(), Self::links_for(name)))
    }

    async fn get_experiment(
        &self,
        url: &str,
    ) -> Result<(ServerExperiment, ExperimentLinks), ApiError> {
        let name = Self::name_from_url(url);
        let state = self.state.lock();
        state
            .experiments
            .get(name)
            .cloned()
            .map(|e| (e, Self::links_for(name)))
            .ok_or(ApiError::ExperimentNotFound)
    }

    async fn list_experiments(&self, _page_url: Option<&str>) -> Result<ExperimentList, ApiError> {
        let state = self.state.lock();
        Ok(ExperimentList {
            experiments: state
                .experiments
                .iter()
                .map(|(name, experiment)| ExperimentItem {
                    name: name.clone(),
                    experiment: experiment.clone(),
                })
                .collect(),
            links: BTreeMap::new(),
        })
    }

    async fn delete_experiment(&self, url: &str) -> Result<(), ApiError> {
        let name = Self::name_from_url(url).to_string();
        let mut state = self.state.lock();
        if state.experiments.remove(&name).is_none() {
            return Err(ApiError::ExperimentNotFound);
        }
        state.deleted_experiments.push(name);
        Ok(())
    }

    async fn list_trials(
        &self,
        _url: &str,
        query: &TrialListQuery,
    ) -> Result<TrialList, ApiError> {
        let state = self.state.lock();
        let trials = state
            .reports
            .iter()
            .map(|(url, values)| TrialItem {
                number: None,
                status: if values.failed {
                    "failed".to_string()
                } else {
                    "completed".to_string()
                },
                assignments: Vec::new(),
                values: values.values.clone(),
                labels: state.trial_labels.get(url).cloned().unwrap_or_default(),
                links: [("self".to_string(), url.clone())].into_iter().collect(),
            })
            .filter(|t| query.status.is_empty() || query.status.contains(&t.status))
            .collect();
        Ok(TrialList { trials })
    }

    async fn create_trial(
        &self,
        url: &str,
        assignments: &TrialAssignments,
    ) -> Result<String, ApiError> {
        let name = Self::name_from_url(url).to_string();
        let mut state = self.state.lock();
        if state.stopped {
            return Err(ApiError::ExperimentStopped);
        }
        state.created_trials.push(assignments.clone());
        state.trial_counter += 1;
        let counter = state.trial_counter;
        Ok(format!("fake:/experiments/{name}/trials/{counter}"))
    }

    async fn next_trial(&self, url: &str) -> Result<TrialSuggestion, ApiError> {
        let name = Self::name_from_url(url).to_string();
        let mut state = self.state.lock();
        if let Some(retry_after) = state.unavailable.take() {
            return Err(ApiError::TrialUnavailable {
                retry_after: clamp_retry_after(Some(retry_after.as_secs())),
            });
        }
        if state.stopped {
            return Err(ApiError::ExperimentStopped);
        }
        let Some(assignments) = state.suggestions.pop_front() else {
            return Err(ApiError::ExperimentStopped);
        };
        state.trial_counter += 1;
        let counter = state.trial_counter;
        Ok(TrialSuggestion {
            assignments,
            report_url: format!("fake:/experiments/{name}/trials/{counter}"),
        })
    }

    async fn report_trial(&self, url: &str, values: &TrialValues) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        if state.reports.contains_key(url) {
            return Err(ApiError::AlreadyReported);
        }
        state.reports.insert(url.to_string(), values.clone());
        Ok(())
    }

    async fn abandon_trial(&self, url: &str) -> Result<(), ApiError> {
        self.state.lock().abandoned.push(url.to_string());
        Ok(())
    }

    async fn label_experiment(
        &self,
        url: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let name = Self::name_from_url(url).to_string();
        self.state
            .lock()
            .experiment_labels
            .entry(name)
            .or_default()
            .extend(labels.clone());
        Ok(())
    }

    async fn label_trial(
        &self,
        url: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        self.state
            .lock()
            .trial_labels
            .entry(url.to_string())
            .or_default()
            .extend(labels.clone());
        Ok(())
    }
}
