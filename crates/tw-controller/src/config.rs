//! Process-wide controller configuration.
//!
//! The service binary reads the environment exactly once, here; everything
//! downstream receives plain structs.

use std::time::Duration;

use tw_api::ApiConfig;
use tw_collect::Credentials;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Remote optimizer connection settings.
    pub api: ApiConfig,
    /// Credentials for the hosted metric backends.
    pub credentials: Credentials,
    pub experiment_workers: usize,
    pub trial_workers: usize,
    /// Address of the health endpoint.
    pub health_addr: String,
    /// Full relist period repairing missed events.
    pub resync_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            credentials: Credentials::default(),
            experiment_workers: 2,
            trial_workers: 4,
            health_addr: "0.0.0.0:8083".to_string(),
            resync_period: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api: ApiConfig {
                base_url: env_var("TUNEWISE_SERVER_URL").unwrap_or_default(),
                token: env_var("TUNEWISE_TOKEN"),
                ..ApiConfig::default()
            },
            credentials: Credentials {
                datadog_api_key: env_var("DATADOG_API_KEY").or_else(|| env_var("DD_API_KEY")),
                datadog_app_key: env_var("DATADOG_APP_KEY").or_else(|| env_var("DD_APP_KEY")),
                new_relic_api_key: env_var("NEW_RELIC_API_KEY"),
                new_relic_account_id: env_var("NEW_RELIC_ACCOUNT_ID"),
            },
            experiment_workers: env_var("TUNEWISE_EXPERIMENT_WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.experiment_workers),
            trial_workers: env_var("TUNEWISE_TRIAL_WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.trial_workers),
            health_addr: env_var("TUNEWISE_HEALTH_ADDR").unwrap_or(defaults.health_addr),
            resync_period: defaults.resync_period,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ControllerConfig::default();
        assert_eq!(config.experiment_workers, 2);
        assert_eq!(config.trial_workers, 4);
        assert!(config.credentials.datadog_api_key.is_none());
    }
}
