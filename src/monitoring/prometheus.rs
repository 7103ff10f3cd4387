//! Prometheus HTTP query API client.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::{DEFAULT_REQUEST_TIMEOUT, USER_AGENT};
use crate::error::MuoError;

/// Alerts paged by the operator itself during an upgrade.
pub const PAGING_ALERTS: &[&str] = &[
    "UpgradeConfigValidationFailedSRE",
    "UpgradeClusterCheckFailedSRE",
    "UpgradeControlPlaneUpgradeTimeoutSRE",
    "UpgradeNodeUpgradeTimeoutSRE",
    "UpgradeNodeDrainFailedSRE",
];

/// Response of `/api/v1/query`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: AlertData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertData {
    #[serde(default)]
    pub result: Vec<AlertResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertResult {
    #[serde(default)]
    pub metric: HashMap<String, String>,
}

impl AlertResponse {
    /// Values of `label` across all series, deduplicated in first-seen order.
    pub fn unique_label_values(&self, label: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for value in self.data.result.iter().filter_map(|r| r.metric.get(label)) {
            if !seen.contains(value) {
                seen.push(value.clone());
            }
        }
        seen
    }

    pub fn is_empty(&self) -> bool {
        self.data.result.is_empty()
    }
}

/// Instant query against the metrics backend.
#[async_trait]
pub trait MetricsQuery: Send + Sync {
    async fn query(&self, promql: &str) -> Result<AlertResponse>;
}

/// Prometheus client authenticated with a service account bearer token.
pub struct PrometheusClient {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build Prometheus HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

#[async_trait]
impl MetricsQuery for PrometheusClient {
    async fn query(&self, promql: &str) -> Result<AlertResponse> {
        debug!(query = promql, "Querying Prometheus");
        let mut request = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", promql)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request
            .send()
            .await
            .map_err(|e| MuoError::MetricsQuery(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MuoError::MetricsQuery(format!("Prometheus returned {status}")).into());
        }
        let body: AlertResponse = response
            .json()
            .await
            .map_err(|e| MuoError::MetricsQuery(format!("invalid query response: {e}")))?;
        if body.status != "success" {
            return Err(MuoError::MetricsQuery(format!("query status {}", body.status)).into());
        }
        Ok(body)
    }
}

/// Prometheus duration literal, whole seconds, never zero.
fn prom_duration(d: chrono::Duration) -> String {
    format!("{}s", d.num_seconds().max(1))
}

/// Query for the operator's own paging alerts fired between `start` and `end`.
pub fn upgrade_alerts_query(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format!(
        r#"sum by (alertname) (max_over_time(ALERTS{{alertstate="firing",severity="critical",alertname=~"{}"}}[{}] offset {}))"#,
        PAGING_ALERTS.join("|"),
        prom_duration(end - start),
        prom_duration(now - end),
    )
}

/// Paging alerts that fired while the upgrade ran.
pub async fn alerts_from_upgrade(
    client: &dyn MetricsQuery,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let response = client.query(&upgrade_alerts_query(start, end, now)).await?;
    Ok(response.unique_label_values("alertname"))
}

/// Query for the notification marker gauge.
pub fn notification_marker_query(name: &str, event: &str, version: &str) -> String {
    format!(
        r#"upgradeoperator_upgrade_notification{{upgradeconfig_name="{name}",event="{event}",version="{version}"}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_parse_alert_response() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"alertname": "KubeAPIDown", "namespace": "openshift-kube-apiserver"}, "value": [1, "1"]},
                    {"metric": {"alertname": "EtcdDown"}, "value": [1, "1"]},
                    {"metric": {"alertname": "KubeAPIDown"}, "value": [1, "1"]}
                ]
            }
        }"#;
        let response: AlertResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            response.unique_label_values("alertname"),
            vec!["KubeAPIDown", "EtcdDown"]
        );
        assert!(!response.is_empty());
    }

    #[test]
    fn test_upgrade_alerts_query() {
        let start = Utc.with_ymd_and_hms(2026, 10, 17, 10, 0, 0).unwrap();
        let end = start + Duration::minutes(90);
        let now = end + Duration::minutes(10);
        let query = upgrade_alerts_query(start, end, now);
        assert!(query.starts_with("sum by (alertname) (max_over_time(ALERTS{"));
        assert!(query.contains("UpgradeNodeDrainFailedSRE"));
        assert!(query.contains("[5400s] offset 600s"));
    }

    #[test]
    fn test_notification_marker_query() {
        assert_eq!(
            notification_marker_query("muc", "Started", "4.15.3"),
            r#"upgradeoperator_upgrade_notification{upgradeconfig_name="muc",event="Started",version="4.15.3"}"#
        );
    }
}
