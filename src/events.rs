//! Deduplicated lifecycle notifications.
//!
//! A notification for (upgrade config, state, version) is sent at most once:
//! the "sent" marker kept by the metrics sink is checked before sending and
//! set after a successful send. The same markers give the last state sent,
//! which is the origin of the transition check.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::crd::{UpgradeConfig, UpgradeHistory};
use crate::error::MuoError;
use crate::notify::{Notification, Notifier, NotifyState};
use crate::status::first_incomplete_condition;
use crate::telemetry::metrics::MetricsSink;
use crate::upgrader::StepName;

/// States whose marker can be set, most advanced first.
const SENT_ORDER: [NotifyState; 4] = [
    NotifyState::Failed,
    NotifyState::Completed,
    NotifyState::Delayed,
    NotifyState::Started,
];

pub fn started_description(version: &str) -> String {
    format!("Cluster is currently being upgraded to version {version}")
}

pub fn delayed_description(version: &str) -> String {
    format!("Cluster upgrade to version {version} is currently delayed")
}

pub fn completed_description(version: &str) -> String {
    format!("Cluster has been successfully upgraded to version {version}")
}

/// Failure description chosen from the first incomplete step of the attempt.
pub fn failure_description(version: &str, history: Option<&UpgradeHistory>) -> String {
    let step = history
        .and_then(first_incomplete_condition)
        .and_then(|c| StepName::from_condition_type(&c.r#type));
    match step {
        Some(StepName::PreHealthCheck) => format!(
            "Cluster upgrade to version {version} was cancelled during the Pre-Health Check step. \
             Health alerts are firing in the cluster which could impact the upgrade's operation, \
             so the upgrade did not proceed."
        ),
        Some(StepName::ExtDepAvailabilityCheck) => format!(
            "Cluster upgrade to version {version} was cancelled during the External Dependency \
             Availability Check step. A required external dependency of the upgrade was \
             unavailable, so the upgrade did not proceed."
        ),
        Some(StepName::ScaleUpExtraNodes) => format!(
            "Cluster upgrade to version {version} was cancelled during the Scale-Up Worker Node \
             step. A temporary additional worker node was unable to be created to temporarily \
             house workloads, so the upgrade did not proceed."
        ),
        _ => format!(
            "Cluster upgrade to version {version} was cancelled as the cluster did not pass its \
             pre-upgrade verification checks. The cluster will be automatically scheduled for \
             upgrade again once the checks pass."
        ),
    }
}

/// Sends each lifecycle notification once per (config, state, version).
#[derive(Clone)]
pub struct EventManager {
    notifier: Notifier,
    metrics: Arc<dyn MetricsSink>,
}

impl EventManager {
    pub fn new(notifier: Notifier, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { notifier, metrics }
    }

    /// Send `state` for the desired version of `uc` unless already sent.
    pub async fn notify(
        &self,
        uc: &UpgradeConfig,
        history: Option<&UpgradeHistory>,
        state: NotifyState,
    ) -> Result<()> {
        let name = uc.name_or_unknown();
        let version = uc.desired_version();

        let description = match state {
            NotifyState::Started => started_description(version),
            NotifyState::Delayed => delayed_description(version),
            NotifyState::Completed => completed_description(version),
            NotifyState::Failed => failure_description(version, history),
            NotifyState::Pending | NotifyState::Scheduled => {
                return Err(MuoError::UnsupportedNotifyState(state.to_string()).into());
            }
        };

        if self.is_sent(name, state, version).await? {
            debug!(upgradeconfig = name, state = %state, "Notification already sent");
            return Ok(());
        }

        let from = self.last_sent(name, version).await?;
        let notification = Notification {
            upgrade_config: name.to_string(),
            version: version.to_string(),
            state,
            description,
        };
        self.notifier.notify_state(from, &notification).await?;
        self.metrics
            .update_notification_event_sent(name, state.as_str(), version);
        info!(upgradeconfig = name, version, state = %state, "Notification sent");
        Ok(())
    }

    async fn is_sent(&self, name: &str, state: NotifyState, version: &str) -> Result<bool> {
        self.metrics
            .is_notification_event_sent(name, state.as_str(), version)
            .await
            .map_err(|e| {
                MuoError::MetricsQuery(format!("can't check cluster metric NotificationSent: {e:#}")).into()
            })
    }

    /// Most advanced state already sent for this version, `Scheduled` if none.
    async fn last_sent(&self, name: &str, version: &str) -> Result<NotifyState> {
        for state in SENT_ORDER {
            if self.is_sent(name, state, version).await? {
                return Ok(state);
            }
        }
        Ok(NotifyState::Scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::upgrade_config;
    use crate::crd::UpgradePhase;
    use crate::notify::tests::RecordingSink;
    use crate::status::{set_condition_complete, set_condition_start};
    use crate::telemetry::metrics::fake::RecordingMetrics;
    use chrono::Utc;
    use std::sync::atomic::Ordering;

    fn manager() -> (EventManager, Arc<RecordingSink>, Arc<RecordingMetrics>) {
        let sink = Arc::new(RecordingSink::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let manager = EventManager::new(Notifier::new(sink.clone()), metrics.clone());
        (manager, sink, metrics)
    }

    #[tokio::test]
    async fn test_single_notification_per_state() {
        let (manager, sink, _) = manager();
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        for _ in 0..3 {
            manager.notify(&uc, None, NotifyState::Started).await.unwrap();
        }
        assert_eq!(sink.states(), vec![NotifyState::Started]);
        assert_eq!(
            sink.sent.lock().unwrap()[0].description,
            "Cluster is currently being upgraded to version 4.15.3"
        );
    }

    #[tokio::test]
    async fn test_marker_left_unset_on_sink_failure() {
        let (manager, sink, metrics) = manager();
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        sink.fail.store(true, Ordering::SeqCst);
        assert!(manager.notify(&uc, None, NotifyState::Started).await.is_err());
        assert!(!metrics.has("notification:StateStarted"));

        sink.fail.store(false, Ordering::SeqCst);
        manager.notify(&uc, None, NotifyState::Started).await.unwrap();
        assert!(metrics.has("notification:StateStarted"));
    }

    #[tokio::test]
    async fn test_delayed_requires_started() {
        let (manager, sink, _) = manager();
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        assert!(manager.notify(&uc, None, NotifyState::Delayed).await.is_err());

        manager.notify(&uc, None, NotifyState::Started).await.unwrap();
        manager.notify(&uc, None, NotifyState::Delayed).await.unwrap();
        manager.notify(&uc, None, NotifyState::Completed).await.unwrap();
        assert_eq!(
            sink.states(),
            vec![NotifyState::Started, NotifyState::Delayed, NotifyState::Completed]
        );
    }

    #[tokio::test]
    async fn test_nothing_after_terminal_state() {
        let (manager, sink, _) = manager();
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        manager.notify(&uc, None, NotifyState::Started).await.unwrap();
        manager.notify(&uc, None, NotifyState::Failed).await.unwrap();
        assert!(manager.notify(&uc, None, NotifyState::Delayed).await.is_err());
        assert_eq!(sink.states(), vec![NotifyState::Started, NotifyState::Failed]);
    }

    #[tokio::test]
    async fn test_marker_lookup_failure_is_error() {
        let (manager, sink, metrics) = manager();
        metrics.fail_marker_lookup.store(true, Ordering::SeqCst);
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        let err = manager.notify(&uc, None, NotifyState::Started).await.unwrap_err();
        assert!(err.to_string().contains("NotificationSent"));
        assert!(sink.states().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_states() {
        let (manager, _, _) = manager();
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        assert!(manager.notify(&uc, None, NotifyState::Pending).await.is_err());
        assert!(manager.notify(&uc, None, NotifyState::Scheduled).await.is_err());
    }

    #[test]
    fn test_failure_description_from_first_incomplete_step() {
        let now = Utc::now();
        let mut history = UpgradeHistory::new("4.15.3", UpgradePhase::Upgrading);
        set_condition_start(&mut history, StepName::SendStartedNotification.as_str(), now);
        set_condition_complete(&mut history, StepName::SendStartedNotification.as_str(), now);
        set_condition_start(&mut history, StepName::ExtDepAvailabilityCheck.as_str(), now);

        let desc = failure_description("4.15.3", Some(&history));
        assert!(desc.contains("External Dependency Availability Check step"));
        assert!(desc.starts_with("Cluster upgrade to version 4.15.3 was cancelled"));
    }

    #[test]
    fn test_failure_description_default() {
        assert!(failure_description("4.15.3", None).contains("pre-upgrade verification checks"));
        let history = UpgradeHistory::new("4.15.3", UpgradePhase::Upgrading);
        assert!(
            failure_description("4.15.3", Some(&history)).contains("pre-upgrade verification checks")
        );
    }
}
