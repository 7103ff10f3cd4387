//! `UpgradeConfig` spec types.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::UpgradeConfigStatus;
use super::types::UpgradeType;

/// `UpgradeConfig` spec defines a scheduled cluster upgrade.
///
/// Written by the external policy source; the controller only reads it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[kube(
    group = "upgrade.managed.openshift.io",
    version = "v1alpha1",
    kind = "UpgradeConfig",
    namespaced,
    shortname = "upgrade",
    status = "UpgradeConfigStatus",
    printcolumn = r#"{"name":"DESIRED_VERSION","type":"string","jsonPath":".spec.desired.version"}"#,
    printcolumn = r#"{"name":"PHASE","type":"string","jsonPath":".status.history[0].phase"}"#,
    printcolumn = r#"{"name":"UPGRADE_AT","type":"string","jsonPath":".spec.upgradeAt"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeConfigSpec {
    /// Target release.
    pub desired: Update,

    /// Scheduled start time (RFC3339).
    pub upgrade_at: String,

    /// Minutes to wait for a PDB-protected drain before forcing it.
    #[serde(rename = "PDBForceDrainTimeout")]
    pub pdb_force_drain_timeout: i32,

    /// Upgrade flavor, selects the step catalogue and failure policy.
    #[serde(rename = "type")]
    pub upgrade_type: UpgradeType,

    /// Provision extra worker capacity for the duration of the upgrade.
    #[serde(default)]
    pub capacity_reservation: bool,
}

/// Desired release, identified by image digest or by channel + version.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub channel: String,

    #[serde(default)]
    pub image: String,
}

impl UpgradeConfig {
    /// Object name, or `"unknown"` for objects without metadata.
    pub fn name_or_unknown(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Desired version string of the spec.
    pub fn desired_version(&self) -> &str {
        &self.spec.desired.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_deserializes_wire_names() {
        let json = r#"{
            "desired": {"version": "4.15.3", "channel": "stable-4.15"},
            "upgradeAt": "2026-10-17T10:00:00Z",
            "PDBForceDrainTimeout": 60,
            "type": "OSD",
            "capacityReservation": true
        }"#;
        let spec: UpgradeConfigSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.desired.version, "4.15.3");
        assert_eq!(spec.desired.channel, "stable-4.15");
        assert!(spec.desired.image.is_empty());
        assert_eq!(spec.pdb_force_drain_timeout, 60);
        assert_eq!(spec.upgrade_type, UpgradeType::Osd);
        assert!(spec.capacity_reservation);
    }

    #[test]
    fn test_capacity_reservation_defaults_false() {
        let json = r#"{
            "desired": {"image": "quay.io/openshift-release-dev/ocp-release@sha256:abc"},
            "upgradeAt": "2026-10-17T10:00:00Z",
            "PDBForceDrainTimeout": 30,
            "type": "ARO"
        }"#;
        let spec: UpgradeConfigSpec = serde_json::from_str(json).unwrap();
        assert!(!spec.capacity_reservation);
        assert_eq!(spec.upgrade_type, UpgradeType::Aro);
    }
}
