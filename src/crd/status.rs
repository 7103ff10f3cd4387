//! `UpgradeConfig` status types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ConditionStatus, UpgradePhase};

/// Top-level status of the `UpgradeConfig` CRD.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeConfigStatus {
    /// One entry per desired version ever attempted, newest first.
    #[serde(default)]
    pub history: Vec<UpgradeHistory>,
}

/// Record of a single upgrade attempt.
///
/// JSON Merge Patch replaces arrays wholesale, so unset timestamps inside a
/// history entry are simply omitted rather than serialized as `null`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeHistory {
    pub version: String,

    #[serde(default)]
    pub phase: UpgradePhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<UpgradeCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_complete_time: Option<DateTime<Utc>>,

    /// Cluster version before this upgrade started.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preceding_version: String,
}

/// Audit record of a step's last known outcome.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCondition {
    /// Step name.
    pub r#type: String,
    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<DateTime<Utc>>,
}

impl UpgradeHistory {
    pub fn new(version: impl Into<String>, phase: UpgradePhase) -> Self {
        Self {
            version: version.into(),
            phase,
            ..Self::default()
        }
    }

    pub fn condition(&self, condition_type: &str) -> Option<&UpgradeCondition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }

    #[cfg(test)]
    pub fn is_condition_true(&self, condition_type: &str) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}
