//! The optimizer operation seam and its HTTP implementation.
//!
//! [`Optimizer`] is the trait the controllers program against; callers treat
//! every URL as opaque hypermedia and never derive one link from another.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

use crate::error::{clamp_retry_after, ApiError};
use crate::links::{parse_link_headers, REL_NEXT_TRIAL, REL_SELF, REL_TRIALS};
use crate::model::{
    ExperimentLinks, ExperimentList, ServerExperiment, TrialAssignments, TrialList,
    TrialListQuery, TrialSuggestion, TrialValues,
};

/// Connection settings for the remote optimizer, injected at construction.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://api.example.com/v1`.
    pub base_url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// User-agent tag sent with every request.
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            user_agent: format!("tunewise/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Operations exposed by the remote optimizer.
#[async_trait]
pub trait Optimizer: Send + Sync {
    /// Create (or replace) the experiment definition under `name`. Returns
    /// the echoed definition and its navigation links.
    async fn create_experiment(
        &self,
        name: &str,
        experiment: &ServerExperiment,
    ) -> Result<(ServerExperiment, ExperimentLinks), ApiError>;

    /// Fetch an experiment by its self URL.
    async fn get_experiment(
        &self,
        url: &str,
    ) -> Result<(ServerExperiment, ExperimentLinks), ApiError>;

    /// List experiments; `page_url` continues from a previous `next` link.
    async fn list_experiments(&self, page_url: Option<&str>) -> Result<ExperimentList, ApiError>;

    /// Delete the experiment at its self URL.
    async fn delete_experiment(&self, url: &str) -> Result<(), ApiError>;

    /// List trials under the experiment's trials URL.
    async fn list_trials(&self, url: &str, query: &TrialListQuery) -> Result<TrialList, ApiError>;

    /// Create a trial (baseline or manual) under the trials URL. Returns the
    /// location of the created trial.
    async fn create_trial(
        &self,
        url: &str,
        assignments: &TrialAssignments,
    ) -> Result<String, ApiError>;

    /// Request the next suggested assignment set.
    async fn next_trial(&self, url: &str) -> Result<TrialSuggestion, ApiError>;

    /// Report observed values for a trial at its report URL.
    async fn report_trial(&self, url: &str, values: &TrialValues) -> Result<(), ApiError>;

    /// Abandon a running trial without reporting values.
    async fn abandon_trial(&self, url: &str) -> Result<(), ApiError>;

    /// Attach labels to an experiment.
    async fn label_experiment(
        &self,
        url: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ApiError>;

    /// Attach labels to a trial.
    async fn label_trial(
        &self,
        url: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ApiError>;
}

/// reqwest-backed [`Optimizer`].
#[derive(Debug, Clone)]
pub struct HttpOptimizer {
    http: reqwest::Client,
    config: ApiConfig,
}

impl HttpOptimizer {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    /// The canonical URL for an experiment name. Used only for create-by-name;
    /// every other operation follows links.
    pub fn experiment_url(&self, name: &str) -> String {
        format!(
            "{}/experiments/{}",
            self.config.base_url.trim_end_matches('/'),
            name
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn response_links(response: &reqwest::Response) -> HashMap<String, String> {
        parse_link_headers(
            response
                .headers()
                .get_all(reqwest::header::LINK)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        )
    }

    fn experiment_links(response: &reqwest::Response) -> ExperimentLinks {
        let links = Self::response_links(response);
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        ExperimentLinks {
            self_url: links.get(REL_SELF).cloned().or(location),
            trials_url: links
                .get(REL_TRIALS)
                .or_else(|| links.get("trials"))
                .cloned(),
            next_trial_url: links
                .get(REL_NEXT_TRIAL)
                .or_else(|| links.get("next-trial"))
                .cloned(),
            last_modified: response
                .headers()
                .get(reqwest::header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    fn retry_after(response: &reqwest::Response) -> Duration {
        clamp_retry_after(
            response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok()),
        )
    }

    async fn unexpected(response: reqwest::Response) -> ApiError {
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.error)
            .unwrap_or_default();
        ApiError::Unexpected { status, message }
    }

    async fn invalid(response: reqwest::Response) -> ApiError {
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.error)
            .unwrap_or_default();
        ApiError::InvalidRequest { message }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

#[async_trait]
impl Optimizer for HttpOptimizer {
    async fn create_experiment(
        &self,
        name: &str,
        experiment: &ServerExperiment,
    ) -> Result<(ServerExperiment, ExperimentLinks), ApiError> {
        let url = self.experiment_url(name);
        debug!(%url, "creating experiment");
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(experiment)
            .send()
            .await?;
        match response.status().as_u16() {
            200 | 201 => {
                let links = Self::experiment_links(&response);
                Ok((response.json().await?, links))
            }
            400 => Err(ApiError::NameInvalid),
            401 | 402 => Err(ApiError::Unauthorized),
            409 => Err(ApiError::NameConflict),
            422 => Err(Self::invalid(response).await),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn get_experiment(
        &self,
        url: &str,
    ) -> Result<(ServerExperiment, ExperimentLinks), ApiError> {
        let response = self.request(reqwest::Method::GET, url).send().await?;
        match response.status().as_u16() {
            200 => {
                let links = Self::experiment_links(&response);
                Ok((response.json().await?, links))
            }
            401 | 402 => Err(ApiError::Unauthorized),
            404 => Err(ApiError::ExperimentNotFound),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn list_experiments(&self, page_url: Option<&str>) -> Result<ExperimentList, ApiError> {
        let url = match page_url {
            Some(url) => url.to_string(),
            None => format!("{}/experiments", self.config.base_url.trim_end_matches('/')),
        };
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        match response.status().as_u16() {
            200 => {
                let links = Self::response_links(&response);
                let mut list: ExperimentList = response.json().await?;
                list.links = links.into_iter().collect();
                Ok(list)
            }
            401 | 402 => Err(ApiError::Unauthorized),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn delete_experiment(&self, url: &str) -> Result<(), ApiError> {
        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        match response.status().as_u16() {
            204 => Ok(()),
            401 | 402 => Err(ApiError::Unauthorized),
            404 => Err(ApiError::ExperimentNotFound),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn list_trials(&self, url: &str, query: &TrialListQuery) -> Result<TrialList, ApiError> {
        let response = self
            .request(reqwest::Method::GET, url)
            .query(&query.to_query_pairs())
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            401 | 402 => Err(ApiError::Unauthorized),
            404 => Err(ApiError::ExperimentNotFound),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn create_trial(
        &self,
        url: &str,
        assignments: &TrialAssignments,
    ) -> Result<String, ApiError> {
        let response = self
            .request(reqwest::Method::POST, url)
            .json(assignments)
            .send()
            .await?;
        match response.status().as_u16() {
            201 => Ok(response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()),
            401 | 402 => Err(ApiError::Unauthorized),
            409 => Err(ApiError::ExperimentStopped),
            422 => Err(Self::invalid(response).await),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn next_trial(&self, url: &str) -> Result<TrialSuggestion, ApiError> {
        let response = self.request(reqwest::Method::POST, url).send().await?;
        match response.status().as_u16() {
            200 => {
                let links = Self::response_links(&response);
                let report_url = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .or_else(|| links.get(REL_SELF).cloned())
                    .unwrap_or_default();
                Ok(TrialSuggestion {
                    assignments: response.json().await?,
                    report_url,
                })
            }
            401 | 402 => Err(ApiError::Unauthorized),
            404 | 410 => Err(ApiError::ExperimentStopped),
            503 => Err(ApiError::TrialUnavailable {
                retry_after: Self::retry_after(&response),
            }),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn report_trial(&self, url: &str, values: &TrialValues) -> Result<(), ApiError> {
        let response = self
            .request(reqwest::Method::POST, url)
            .json(values)
            .send()
            .await?;
        match response.status().as_u16() {
            200 | 201 => Ok(()),
            401 | 402 => Err(ApiError::Unauthorized),
            404 => Err(ApiError::TrialNotFound),
            409 => Err(ApiError::AlreadyReported),
            422 => Err(Self::invalid(response).await),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn abandon_trial(&self, url: &str) -> Result<(), ApiError> {
        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        match response.status().as_u16() {
            204 => Ok(()),
            401 | 402 => Err(ApiError::Unauthorized),
            404 => Err(ApiError::TrialNotFound),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn label_experiment(
        &self,
        url: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        self.post_labels(url, labels, ApiError::ExperimentNotFound)
            .await
    }

    async fn label_trial(
        &self,
        url: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        self.post_labels(url, labels, ApiError::TrialNotFound).await
    }
}

impl HttpOptimizer {
    async fn post_labels(
        &self,
        url: &str,
        labels: &BTreeMap<String, String>,
        not_found: ApiError,
    ) -> Result<(), ApiError> {
        let body = serde_json::json!({ "labels": labels });
        let labels_url = format!("{}/labels", url.trim_end_matches('/'));
        let response = self
            .request(reqwest::Method::POST, &labels_url)
            .json(&body)
            .send()
            .await?;
        match response.status().as_u16() {
            200 | 201 => Ok(()),
            401 | 402 => Err(ApiError::Unauthorized),
            404 => Err(not_found),
            422 => Err(Self::invalid(response).await),
            _ => Err(Self::unexpected(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experiment_url_joins_cleanly() {
        let client = HttpOptimizer::new(ApiConfig {
            base_url: "https://api.example.com/v1/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.experiment_url("tuning"),
            "https://api.example.com/v1/experiments/tuning"
        );
    }

    #[test]
    fn default_config_carries_user_agent() {
        let config = ApiConfig::default();
        assert!(config.user_agent.starts_with("tunewise/"));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }
}
