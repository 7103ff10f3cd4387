//! Status patch helpers, history and condition bookkeeping, and event recording.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Api;
use kube::Resource;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::debug;

use crate::crd::{
    ConditionStatus, UpgradeCondition, UpgradeConfig, UpgradeConfigStatus, UpgradeHistory,
    UpgradePhase,
};
use crate::error::MuoError;

/// Condition type recorded when an uncommenced upgrade is abandoned.
pub const FAILED_UPGRADE_CONDITION: &str = "FailedUpgrade";

/// Field manager used for every status write.
pub const FIELD_MANAGER: &str = "muo";

/// Status merge patch pinned to the resource version `uc` was read at.
///
/// The API server rejects the write with a conflict when the object moved on
/// since, so a pass computed from a stale copy never lands.
pub fn status_patch(uc: &UpgradeConfig, status: &UpgradeConfigStatus) -> serde_json::Value {
    let mut patch = serde_json::json!({ "status": status });
    if let Some(resource_version) = &uc.metadata.resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": resource_version });
    }
    patch
}

/// Patch the status subresource of an `UpgradeConfig`.
///
/// A conflict maps to [`MuoError::StatusConflict`], which the controller
/// retries against a fresh read.
pub async fn patch_status(
    api: &Api<UpgradeConfig>,
    uc: &UpgradeConfig,
    status: &UpgradeConfigStatus,
) -> Result<UpgradeConfig> {
    let name = uc.name_or_unknown();
    debug!(
        "Patching status for {}: phase={:?}",
        name,
        status.history.first().map(|h| h.phase)
    );

    let patch = status_patch(uc, status);
    match api
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(updated) => Ok(updated),
        Err(kube::Error::Api(response)) if response.code == 409 => {
            Err(MuoError::StatusConflict(name.to_string()).into())
        }
        Err(e) => Err(MuoError::from(e).into()),
    }
}

/// History entry for the given version, if any.
pub fn history_for<'a>(status: &'a UpgradeConfigStatus, version: &str) -> Option<&'a UpgradeHistory> {
    status.history.iter().find(|h| h.version == version)
}

pub fn history_for_mut<'a>(
    status: &'a mut UpgradeConfigStatus,
    version: &str,
) -> Option<&'a mut UpgradeHistory> {
    status.history.iter_mut().find(|h| h.version == version)
}

/// Insert or replace the entry for `history.version`. New entries are prepended.
pub fn upsert_history(status: &mut UpgradeConfigStatus, history: UpgradeHistory) {
    match history_for_mut(status, &history.version) {
        Some(existing) => *existing = history,
        None => status.history.insert(0, history),
    }
}

/// Phase of the given version's entry, or `New` when none is recorded.
pub fn phase_for(status: &UpgradeConfigStatus, version: &str) -> UpgradePhase {
    history_for(status, version).map_or(UpgradePhase::New, |h| h.phase)
}

/// Move the entry's phase forward. Regressions are ignored.
pub fn advance_phase(history: &mut UpgradeHistory, phase: UpgradePhase) -> bool {
    if phase.rank() < history.phase.rank() {
        debug!(
            "Ignoring phase regression for {}: {} -> {}",
            history.version, history.phase, phase
        );
        return false;
    }
    history.phase = phase;
    true
}

fn set_condition(history: &mut UpgradeHistory, mut condition: UpgradeCondition, now: DateTime<Utc>) {
    condition.last_probe_time = Some(now);
    match history
        .conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.or(Some(now))
            } else {
                Some(now)
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            history.conditions.push(condition);
        }
    }
}

fn new_condition(step: &str, status: ConditionStatus, reason: String, message: String) -> UpgradeCondition {
    UpgradeCondition {
        r#type: step.to_string(),
        status,
        reason,
        message,
        last_probe_time: None,
        last_transition_time: None,
        start_time: None,
        complete_time: None,
    }
}

/// Record that a step started. Existing conditions keep their start time.
pub fn set_condition_start(history: &mut UpgradeHistory, step: &str, now: DateTime<Utc>) {
    if history.condition(step).is_some() {
        return;
    }
    let mut condition = new_condition(
        step,
        ConditionStatus::False,
        format!("{step} not done"),
        format!("{step} has started"),
    );
    condition.start_time = Some(now);
    set_condition(history, condition, now);
}

/// Record that a step is not done yet. Clears any earlier completion time.
pub fn set_condition_in_progress(
    history: &mut UpgradeHistory,
    step: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let Some(existing) = history.condition(step).cloned() else {
        return;
    };
    let condition = UpgradeCondition {
        status: ConditionStatus::False,
        message: message.to_string(),
        complete_time: None,
        ..existing
    };
    set_condition(history, condition, now);
}

/// Record that a step completed. The completion time is stamped once.
pub fn set_condition_complete(history: &mut UpgradeHistory, step: &str, now: DateTime<Utc>) {
    let Some(existing) = history.condition(step).cloned() else {
        return;
    };
    let condition = UpgradeCondition {
        status: ConditionStatus::True,
        reason: format!("{step} done"),
        message: format!("{step} is completed"),
        complete_time: existing.complete_time.or(Some(now)),
        ..existing
    };
    set_condition(history, condition, now);
}

/// Record the outcome of abandoning an uncommenced upgrade.
///
/// `error` is `None` when the failure path completed.
pub fn set_failed_upgrade_condition(
    history: &mut UpgradeHistory,
    error: Option<&str>,
    now: DateTime<Utc>,
) {
    let condition = match error {
        None => new_condition(
            FAILED_UPGRADE_CONDITION,
            ConditionStatus::True,
            "FailedUpgrade done".to_string(),
            "FailedUpgrade is completed".to_string(),
        ),
        Some(err) => new_condition(
            FAILED_UPGRADE_CONDITION,
            ConditionStatus::False,
            "FailedUpgrade not done".to_string(),
            err.to_string(),
        ),
    };
    set_condition(history, condition, now);
}

/// First condition that has not completed, in recorded order.
pub fn first_incomplete_condition(history: &UpgradeHistory) -> Option<&UpgradeCondition> {
    history
        .conditions
        .iter()
        .find(|c| c.status == ConditionStatus::False)
}

/// Kubernetes events attached to the reconciled `UpgradeConfig`.
///
/// Publishing is best effort: a failed event write is logged, never returned.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, reason: &str, message: &str);

    async fn publish_warning(&self, reason: &str, message: &str);
}

/// Event recorder bundled with its target `ObjectReference`.
pub struct EventRecorder {
    recorder: Recorder,
    obj_ref: ObjectReference,
}

impl EventRecorder {
    pub fn new(client: kube::Client, obj: &UpgradeConfig) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
            obj_ref: obj.object_ref(&()),
        }
    }

    async fn emit(&self, type_: EventType, reason: &str, message: &str) {
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note: Some(message.into()),
                    action: reason.into(),
                    secondary: None,
                },
                &self.obj_ref,
            )
            .await
            .unwrap_or_else(|e| tracing::warn!("Failed to publish event: {}", e));
    }
}

#[async_trait]
impl EventPublisher for EventRecorder {
    async fn publish(&self, reason: &str, message: &str) {
        self.emit(EventType::Normal, reason, message).await;
    }

    async fn publish_warning(&self, reason: &str, message: &str) {
        self.emit(EventType::Warning, reason, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_upsert_history_prepends_new_entries() {
        let mut status = UpgradeConfigStatus::default();
        upsert_history(&mut status, UpgradeHistory::new("4.14.9", UpgradePhase::Upgraded));
        upsert_history(&mut status, UpgradeHistory::new("4.15.3", UpgradePhase::New));
        assert_eq!(status.history[0].version, "4.15.3");
        assert_eq!(status.history.len(), 2);

        upsert_history(&mut status, UpgradeHistory::new("4.15.3", UpgradePhase::Pending));
        assert_eq!(status.history.len(), 2);
        assert_eq!(phase_for(&status, "4.15.3"), UpgradePhase::Pending);
    }

    #[test]
    fn test_phase_for_missing_version_is_new() {
        let status = UpgradeConfigStatus::default();
        assert_eq!(phase_for(&status, "4.15.3"), UpgradePhase::New);
    }

    #[test]
    fn test_advance_phase_never_regresses() {
        let mut history = UpgradeHistory::new("4.15.3", UpgradePhase::Upgrading);
        assert!(!advance_phase(&mut history, UpgradePhase::Pending));
        assert_eq!(history.phase, UpgradePhase::Upgrading);
        assert!(advance_phase(&mut history, UpgradePhase::Upgraded));
        assert_eq!(history.phase, UpgradePhase::Upgraded);
    }

    #[test]
    fn test_condition_start_is_written_once() {
        let mut history = UpgradeHistory::new("4.15.3", UpgradePhase::Upgrading);
        set_condition_start(&mut history, "PreHealthCheck", t0());
        set_condition_start(&mut history, "PreHealthCheck", t0() + Duration::minutes(5));
        assert_eq!(history.conditions.len(), 1);
        let cond = &history.conditions[0];
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.start_time, Some(t0()));
        assert_eq!(cond.message, "PreHealthCheck has started");
    }

    #[test]
    fn test_condition_complete_stamps_once_and_in_progress_resets() {
        let mut history = UpgradeHistory::new("4.15.3", UpgradePhase::Upgrading);
        set_condition_start(&mut history, "CommenceUpgrade", t0());
        set_condition_complete(&mut history, "CommenceUpgrade", t0() + Duration::minutes(1));
        set_condition_complete(&mut history, "CommenceUpgrade", t0() + Duration::minutes(2));
        let cond = history.condition("CommenceUpgrade").unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.complete_time, Some(t0() + Duration::minutes(1)));

        set_condition_in_progress(&mut history, "CommenceUpgrade", "boom", t0() + Duration::minutes(3));
        let cond = history.condition("CommenceUpgrade").unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "boom");
        assert!(cond.complete_time.is_none());
        assert_eq!(cond.start_time, Some(t0()));
        assert_eq!(cond.last_transition_time, Some(t0() + Duration::minutes(3)));
    }

    #[test]
    fn test_in_progress_without_start_is_noop() {
        let mut history = UpgradeHistory::new("4.15.3", UpgradePhase::Upgrading);
        set_condition_in_progress(&mut history, "PreHealthCheck", "waiting", t0());
        assert!(history.conditions.is_empty());
    }

    #[test]
    fn test_failed_upgrade_condition() {
        let mut history = UpgradeHistory::new("4.15.3", UpgradePhase::Upgrading);
        set_failed_upgrade_condition(&mut history, Some("scale down failed"), t0());
        let cond = history.condition(FAILED_UPGRADE_CONDITION).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "scale down failed");

        set_failed_upgrade_condition(&mut history, None, t0());
        assert!(history.is_condition_true(FAILED_UPGRADE_CONDITION));
        assert_eq!(history.conditions.len(), 1);
    }

    #[test]
    fn test_status_patch_carries_resource_version() {
        let mut uc = crate::cluster::tests::upgrade_config("4.15.3", "stable-4.15", "");
        let mut status = UpgradeConfigStatus::default();
        upsert_history(&mut status, UpgradeHistory::new("4.15.3", UpgradePhase::Upgrading));

        uc.metadata.resource_version = Some("4711".to_string());
        let patch = status_patch(&uc, &status);
        assert_eq!(patch["metadata"]["resourceVersion"], "4711");
        assert_eq!(patch["status"]["history"][0]["phase"], "Upgrading");
        assert_eq!(patch["status"]["history"][0]["version"], "4.15.3");

        uc.metadata.resource_version = None;
        let patch = status_patch(&uc, &status);
        assert!(patch.get("metadata").is_none());
    }

    #[test]
    fn test_first_incomplete_condition() {
        let mut history = UpgradeHistory::new("4.15.3", UpgradePhase::Upgrading);
        set_condition_start(&mut history, "SendStartedNotification", t0());
        set_condition_complete(&mut history, "SendStartedNotification", t0());
        set_condition_start(&mut history, "PreHealthCheck", t0());
        assert_eq!(
            first_incomplete_condition(&history).map(|c| c.r#type.as_str()),
            Some("PreHealthCheck")
        );
    }
}
