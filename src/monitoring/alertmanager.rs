//! Maintenance windows implemented as Alertmanager silences (API v2).

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{DEFAULT_REQUEST_TIMEOUT, USER_AGENT};
use crate::cluster::Maintenance;
use crate::error::MuoError;

/// `createdBy` of every silence owned by the operator.
pub const SILENCE_CREATOR: &str = "managed-upgrade-operator";

const CONTROL_PLANE_COMMENT_ID: &str = "OSD control plane";
const WORKER_COMMENT_ID: &str = "OSD worker node";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    pub name: String,
    pub value: String,
    pub is_regex: bool,
}

impl Matcher {
    fn regex(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            is_regex: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SilenceStatus {
    pub state: String,
}

/// A silence as returned by `GET /api/v2/silences`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Silence {
    pub id: String,
    #[serde(default)]
    pub status: SilenceStatus,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub created_by: String,
}

impl Silence {
    pub fn is_active(&self) -> bool {
        self.status.state == "active"
    }

    pub fn is_owned(&self) -> bool {
        self.created_by == SILENCE_CREATOR
    }
}

/// Body of `POST /api/v2/silences`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableSilence {
    pub matchers: Vec<Matcher>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_by: String,
    pub comment: String,
}

/// Raw silence operations.
#[async_trait]
pub trait Silencer: Send + Sync {
    async fn list(&self) -> Result<Vec<Silence>>;
    async fn create(&self, silence: &PostableSilence) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// reqwest-backed Alertmanager silence client.
pub struct AlertmanagerSilenceClient {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl AlertmanagerSilenceClient {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build Alertmanager HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/api/v2/{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

async fn check(response: reqwest::Result<reqwest::Response>, what: &str) -> Result<reqwest::Response> {
    let response = response.map_err(|e| MuoError::Maintenance(format!("{what}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(MuoError::Maintenance(format!("{what}: Alertmanager returned {status}")).into());
    }
    Ok(response)
}

#[async_trait]
impl Silencer for AlertmanagerSilenceClient {
    async fn list(&self) -> Result<Vec<Silence>> {
        let response = check(
            self.request(reqwest::Method::GET, "silences").send().await,
            "list silences",
        )
        .await?;
        let silences = response
            .json()
            .await
            .map_err(|e| MuoError::Maintenance(format!("invalid silence list: {e}")))?;
        Ok(silences)
    }

    async fn create(&self, silence: &PostableSilence) -> Result<()> {
        check(
            self.request(reqwest::Method::POST, "silences")
                .json(silence)
                .send()
                .await,
            "create silence",
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        check(
            self.request(reqwest::Method::DELETE, &format!("silence/{id}"))
                .send()
                .await,
            "delete silence",
        )
        .await?;
        Ok(())
    }
}

/// Silences non-critical platform alerts in platform namespaces.
fn default_matchers() -> Vec<Matcher> {
    vec![
        Matcher::regex("severity", "(warning|info)"),
        Matcher::regex("namespace", "(^openshift.*|^kube.*|^redhat.*|^default$)"),
    ]
}

fn control_plane_comment(version: &str) -> String {
    format!("Silence for {CONTROL_PLANE_COMMENT_ID} upgrade to version {version}")
}

fn critical_alerts_comment(version: &str) -> String {
    format!("Silence for critical alerts during {CONTROL_PLANE_COMMENT_ID} upgrade to version {version}")
}

fn worker_comment(version: &str) -> String {
    format!("Silence for {WORKER_COMMENT_ID} upgrade to version {version}")
}

/// Maintenance windows on top of a [`Silencer`].
pub struct AlertmanagerMaintenance {
    silencer: Arc<dyn Silencer>,
}

impl AlertmanagerMaintenance {
    pub fn new(silencer: Arc<dyn Silencer>) -> Self {
        Self { silencer }
    }

    async fn create(&self, matchers: Vec<Matcher>, ends_at: DateTime<Utc>, comment: String) -> Result<()> {
        info!(comment = comment.as_str(), ends_at = %ends_at, "Creating maintenance silence");
        self.silencer
            .create(&PostableSilence {
                matchers,
                starts_at: Utc::now(),
                ends_at,
                created_by: SILENCE_CREATOR.to_string(),
                comment,
            })
            .await
    }

    /// Delete every active operator-owned silence whose comment contains `id`.
    ///
    /// All deletions are attempted; the first failure is returned.
    async fn end_silences(&self, id: &str) -> Result<()> {
        let silences = self.silencer.list().await?;
        let mut first_error = None;
        for silence in silences
            .iter()
            .filter(|s| s.is_owned() && s.is_active() && s.comment.contains(id))
        {
            debug!(id = silence.id.as_str(), "Removing maintenance silence");
            if let Err(e) = self.silencer.delete(&silence.id).await {
                warn!(id = silence.id.as_str(), error = %e, "Failed to remove silence");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Maintenance for AlertmanagerMaintenance {
    async fn start_control_plane(
        &self,
        ends_at: DateTime<Utc>,
        version: &str,
        ignored_critical_alerts: &[String],
    ) -> Result<()> {
        let default_comment = control_plane_comment(version);
        let critical_comment = critical_alerts_comment(version);
        let silences = self.silencer.list().await?;
        let exists = |comment: &str| silences.iter().any(|s| s.is_owned() && s.comment == comment);

        if !exists(&default_comment) {
            self.create(default_matchers(), ends_at, default_comment).await?;
        }
        if !exists(&critical_comment) && !ignored_critical_alerts.is_empty() {
            let regex = format!("({})", ignored_critical_alerts.join("|"));
            self.create(vec![Matcher::regex("alertname", regex)], ends_at, critical_comment)
                .await?;
        }
        Ok(())
    }

    /// The comment carries the remaining node count, so a changed count
    /// replaces the previous worker silence with a fresh window.
    async fn set_worker(&self, ends_at: DateTime<Utc>, version: &str, pending: i64) -> Result<()> {
        let comment = worker_comment(version);
        let full_comment = format!("{comment} with remaining {pending} nodes");
        let silences = self.silencer.list().await?;
        let mut owned = silences.iter().filter(|s| s.is_owned());
        if owned.clone().any(|s| s.comment == full_comment) {
            return Ok(());
        }
        if let Some(old) = owned.find(|s| s.is_active() && s.comment.contains(&comment))
        {
            self.silencer.delete(&old.id).await?;
        }
        self.create(default_matchers(), ends_at, full_comment).await
    }

    async fn end_control_plane(&self) -> Result<()> {
        self.end_silences(CONTROL_PLANE_COMMENT_ID).await
    }

    async fn end_worker(&self) -> Result<()> {
        self.end_silences(WORKER_COMMENT_ID).await
    }

    async fn is_active(&self) -> Result<bool> {
        let silences = self.silencer.list().await?;
        Ok(silences.iter().any(|s| s.is_owned() && s.is_active()))
    }
}
