//! Notification state machine for upgrade lifecycle events.
//!
//! States move along a fixed table; a send is only attempted for a legal
//! transition. Delivery goes to a [`NotificationSink`] (Slack webhook or the
//! log fallback).

pub mod log;
pub mod slack;

pub use log::LogSink;
pub use slack::SlackSink;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::MuoError;

/// Lifecycle state reported to the notification sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotifyState {
    Pending,
    Scheduled,
    Started,
    Delayed,
    Completed,
    Failed,
}

impl NotifyState {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Scheduled,
        Self::Started,
        Self::Delayed,
        Self::Completed,
        Self::Failed,
    ];

    /// Wire value, also used as the dedupe marker label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "StatePending",
            Self::Scheduled => "StateScheduled",
            Self::Started => "StateStarted",
            Self::Delayed => "StateDelayed",
            Self::Completed => "StateCompleted",
            Self::Failed => "StateFailed",
        }
    }

    /// States reachable from `self`. `Pending` has no outgoing edges.
    pub const fn allowed_next(self) -> &'static [Self] {
        match self {
            Self::Pending | Self::Completed | Self::Failed => &[],
            Self::Scheduled => &[Self::Started],
            Self::Started => &[Self::Delayed, Self::Completed, Self::Failed],
            Self::Delayed => &[Self::Completed, Self::Failed],
        }
    }
}

impl fmt::Display for NotifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject any transition not listed in the table.
pub fn validate_state_transition(from: NotifyState, to: NotifyState) -> Result<(), MuoError> {
    if from.allowed_next().contains(&to) {
        Ok(())
    } else {
        Err(MuoError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// One lifecycle notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub upgrade_config: String,
    pub version: String,
    pub state: NotifyState,
    pub description: String,
}

/// Delivery backend. A failed delivery is an error so the caller retries.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Validates transitions and hands legal ones to the sink.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub async fn notify_state(&self, from: NotifyState, notification: &Notification) -> Result<()> {
        validate_state_transition(from, notification.state)?;
        self.sink.send(notification).await.map_err(|e| {
            MuoError::Notification(format!("can't send notification '{}': {e:#}", notification.state))
                .into()
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink recording every delivered notification.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<Notification>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        pub(crate) fn states(&self) -> Vec<NotifyState> {
            self.sent.lock().unwrap().iter().map(|n| n.state).collect()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, notification: &Notification) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("webhook returned 503");
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn notification(state: NotifyState) -> Notification {
        Notification {
            upgrade_config: "managed-upgrade-config".to_string(),
            version: "4.15.3".to_string(),
            state,
            description: "desc".to_string(),
        }
    }

    #[test]
    fn test_transition_table_is_exhaustive() {
        use NotifyState::{Completed, Delayed, Failed, Scheduled, Started};
        let allowed = [
            (Scheduled, Started),
            (Started, Delayed),
            (Started, Completed),
            (Started, Failed),
            (Delayed, Completed),
            (Delayed, Failed),
        ];
        let mut checked = 0;
        for from in NotifyState::ALL {
            for to in NotifyState::ALL {
                let legal = allowed.contains(&(from, to));
                assert_eq!(
                    validate_state_transition(from, to).is_ok(),
                    legal,
                    "{from} -> {to}"
                );
                checked += 1;
            }
        }
        assert_eq!(checked, 36);
    }

    #[test]
    fn test_pending_has_no_outgoing_edges() {
        for to in NotifyState::ALL {
            assert!(validate_state_transition(NotifyState::Pending, to).is_err());
        }
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(NotifyState::Completed.to_string(), "StateCompleted");
        assert_eq!(NotifyState::Delayed.to_string(), "StateDelayed");
    }

    #[tokio::test]
    async fn test_notifier_rejects_illegal_transition_without_sending() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone());
        let err = notifier
            .notify_state(NotifyState::Scheduled, &notification(NotifyState::Completed))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
        assert!(sink.states().is_empty());
    }

    #[tokio::test]
    async fn test_notifier_sends_legal_transition() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone());
        notifier
            .notify_state(NotifyState::Scheduled, &notification(NotifyState::Started))
            .await
            .unwrap();
        assert_eq!(sink.states(), vec![NotifyState::Started]);
    }

    #[tokio::test]
    async fn test_notifier_propagates_sink_failure() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let notifier = Notifier::new(sink);
        let err = notifier
            .notify_state(NotifyState::Started, &notification(NotifyState::Delayed))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("StateDelayed"));
    }
}
