//! Slack notification support via Incoming Webhooks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::info;

use super::{Notification, NotificationSink, NotifyState};
use crate::error::MuoError;
use crate::monitoring::{DEFAULT_REQUEST_TIMEOUT, USER_AGENT};

/// Structured Slack message for Block Kit rendering.
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    pub context: String,
}

impl SlackMessage {
    /// Block Kit message for a lifecycle notification.
    pub fn from_notification(n: &Notification) -> Self {
        let header = match n.state {
            NotifyState::Pending => "Cluster Upgrade Pending",
            NotifyState::Scheduled => "Cluster Upgrade Scheduled",
            NotifyState::Started => "Cluster Upgrade Started",
            NotifyState::Delayed => "Cluster Upgrade Delayed",
            NotifyState::Completed => "Cluster Upgrade Completed",
            NotifyState::Failed => "Cluster Upgrade Failed",
        };
        Self {
            header: header.to_string(),
            fields: vec![
                ("UpgradeConfig".to_string(), n.upgrade_config.clone()),
                ("Target Version".to_string(), n.version.clone()),
                ("State".to_string(), n.state.to_string()),
                ("Description".to_string(), n.description.clone()),
            ],
            context: format!("Sent by muo via UpgradeConfig/{}", n.upgrade_config),
        }
    }
}

/// Slack webhook sink.
pub struct SlackSink {
    webhook_url: SecretString,
    client: reqwest::Client,
}

impl SlackSink {
    pub fn new(webhook_url: SecretString) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build Slack HTTP client")?;
        Ok(Self { webhook_url, client })
    }
}

#[async_trait]
impl NotificationSink for SlackSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let message = SlackMessage::from_notification(notification);
        let payload = build_blocks_payload(&message);
        let resp = self
            .client
            .post(self.webhook_url.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(|e| MuoError::Notification(format!("Slack webhook request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(MuoError::Notification(format!(
                "Slack webhook returned non-success status {}",
                resp.status()
            ))
            .into());
        }
        info!(
            upgradeconfig = notification.upgrade_config.as_str(),
            header = message.header.as_str(),
            "Slack notification sent"
        );
        Ok(())
    }
}

/// Build a Slack Block Kit payload from a [`SlackMessage`].
fn build_blocks_payload(message: &SlackMessage) -> Value {
    let mut blocks: Vec<Value> = Vec::new();

    blocks.push(json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": message.header,
            "emoji": true
        }
    }));

    if !message.fields.is_empty() {
        let fields: Vec<Value> = message
            .fields
            .iter()
            .map(|(label, value)| {
                json!({
                    "type": "mrkdwn",
                    "text": format!("*{label}*\n{value}")
                })
            })
            .collect();

        // Slack allows max 10 fields per section
        for chunk in fields.chunks(10) {
            blocks.push(json!({
                "type": "section",
                "fields": chunk
            }));
        }
    }

    blocks.push(json!({"type": "divider"}));

    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": message.context
        }]
    }));

    let fallback = format!("{}\n{}", message.header, message.context);

    json!({
        "text": fallback,
        "blocks": blocks
    })
}
