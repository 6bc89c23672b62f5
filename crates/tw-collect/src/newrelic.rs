//! New Relic collector: NRQL over the GraphQL API, scoped to the trial
//! window with a `SINCE ... UNTIL ...` clause.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::{CaptureError, CaptureRequest, Collector, Credentials, Observation};
use tw_types::MetricKind;

const API_URL: &str = "https://api.newrelic.com/graphql";

#[derive(Debug)]
pub struct NewRelicCollector {
    http: reqwest::Client,
    credentials: Credentials,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<GraphQlData>,
}

#[derive(Debug, Deserialize)]
struct GraphQlData {
    #[serde(default)]
    actor: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct Actor {
    #[serde(default)]
    account: Option<Account>,
}

#[derive(Debug, Deserialize)]
struct Account {
    #[serde(default)]
    nrql: Option<Nrql>,
}

#[derive(Debug, Deserialize)]
struct Nrql {
    #[serde(default)]
    results: Vec<Value>,
}

/// Append the trial window to an NRQL query.
pub(crate) fn scope_query(query: &str, start: i64, until: i64) -> String {
    format!("{} SINCE {} UNTIL {}", query.trim_end(), start, until)
}

/// Pull the first numeric field out of an NRQL result row.
pub(crate) fn first_number(row: &Value) -> Option<f64> {
    match row {
        Value::Number(n) => n.as_f64(),
        Value::Object(map) => map.values().find_map(first_number),
        _ => None,
    }
}

impl NewRelicCollector {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
        }
    }
}

#[async_trait]
impl Collector for NewRelicCollector {
    fn kind(&self) -> MetricKind {
        MetricKind::NewRelic
    }

    async fn capture(&self, request: &CaptureRequest<'_>) -> Result<Observation, CaptureError> {
        let api_key = self
            .credentials
            .new_relic_api_key
            .as_deref()
            .ok_or_else(|| CaptureError::permanent("new relic API key is not configured"))?;
        let account_id = self
            .credentials
            .new_relic_account_id
            .as_deref()
            .ok_or_else(|| CaptureError::permanent("new relic account id is not configured"))?;

        let nrql = scope_query(
            &request.query,
            request.window.start.timestamp(),
            request.window.completion.timestamp(),
        );
        let graphql = format!(
            "{{ actor {{ account(id: {account_id}) {{ nrql(query: {nrql:?}) {{ results }} }} }} }}"
        );

        let response: GraphQlResponse = self
            .http
            .post(API_URL)
            .header("API-Key", api_key)
            .json(&serde_json::json!({ "query": graphql }))
            .send()
            .await?
            .json()
            .await?;

        let results = response
            .data
            .and_then(|d| d.actor)
            .and_then(|a| a.account)
            .and_then(|a| a.nrql)
            .map(|n| n.results)
            .unwrap_or_default();

        let Some(row) = results.first() else {
            return Err(CaptureError::permanent(format!(
                "metric data not available for {}",
                request.metric.name
            )));
        };
        let value = first_number(row).ok_or_else(|| {
            CaptureError::permanent(format!(
                "NRQL result for {} contains no numeric field",
                request.metric.name
            ))
        })?;

        Ok(Observation { value, error: 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_scoping() {
        let scoped = scope_query(
            "SELECT average(duration) FROM Transaction",
            1714000000,
            1714000300,
        );
        assert_eq!(
            scoped,
            "SELECT average(duration) FROM Transaction SINCE 1714000000 UNTIL 1714000300"
        );
    }

    #[test]
    fn numeric_field_extraction() {
        assert_eq!(
            first_number(&json!({"average.duration": 1.25})),
            Some(1.25)
        );
        assert_eq!(first_number(&json!(3.5)), Some(3.5));
        assert_eq!(first_number(&json!({"facet": "web", "count": 10})), Some(10.0));
        assert_eq!(first_number(&json!({"facet": "web"})), None);
    }

    #[tokio::test]
    async fn missing_credentials_fail_permanently() {
        let collector = NewRelicCollector::new(Credentials::default());
        let metric = tw_types::Metric::new(
            "tps",
            MetricKind::NewRelic,
            "SELECT rate(count(*), 1 second) FROM Transaction",
        );
        let request = CaptureRequest {
            metric: &metric,
            query: metric.query.clone(),
            error_query: None,
            url: None,
            window: crate::ObservationWindow {
                start: chrono::Utc::now(),
                completion: chrono::Utc::now(),
            },
        };
        assert!(matches!(
            collector.capture(&request).await,
            Err(CaptureError::Permanent { .. })
        ));
    }
}
