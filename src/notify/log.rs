//! Notification sink that only writes to the operator log.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{Notification, NotificationSink};

/// Fallback sink when no webhook is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            upgradeconfig = notification.upgrade_config.as_str(),
            version = notification.version.as_str(),
            state = %notification.state,
            description = notification.description.as_str(),
            "Upgrade state notification"
        );
        Ok(())
    }
}
