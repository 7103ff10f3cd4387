//! Enum types for upgrade phases, condition status and upgrade flavors.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase of one upgrade attempt.
///
/// Phases only move forward: `New → Pending → Upgrading → {Upgraded | Failed}`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum UpgradePhase {
    #[default]
    New,
    Pending,
    Upgrading,
    Upgraded,
    Failed,
    Unknown,
}

impl UpgradePhase {
    /// Position in the phase lattice. Terminal phases share the top rank.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::New => 1,
            Self::Pending => 2,
            Self::Upgrading => 3,
            Self::Upgraded | Self::Failed => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Pending => "Pending",
            Self::Upgrading => "Upgrading",
            Self::Upgraded => "Upgraded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state condition status.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Upgrade flavor.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum UpgradeType {
    /// Standard managed cluster, abandons uncommenced upgrades after the window.
    #[serde(rename = "OSD")]
    Osd,
    /// Network-restricted cluster, no expiry and no external availability checks.
    #[serde(rename = "ARO")]
    Aro,
}

impl std::fmt::Display for UpgradeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Osd => write!(f, "OSD"),
            Self::Aro => write!(f, "ARO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_phase_display() {
        assert_eq!(UpgradePhase::New.to_string(), "New");
        assert_eq!(UpgradePhase::Upgrading.to_string(), "Upgrading");
        assert_eq!(UpgradePhase::Upgraded.to_string(), "Upgraded");
    }

    #[test]
    fn test_phase_rank_is_monotonic_along_lattice() {
        let path = [
            UpgradePhase::New,
            UpgradePhase::Pending,
            UpgradePhase::Upgrading,
            UpgradePhase::Upgraded,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
        assert_eq!(UpgradePhase::Upgraded.rank(), UpgradePhase::Failed.rank());
    }

    #[test]
    fn test_upgrade_type_wire_names() {
        assert_eq!(serde_json::to_string(&UpgradeType::Osd).unwrap(), "\"OSD\"");
        assert_eq!(serde_json::to_string(&UpgradeType::Aro).unwrap(), "\"ARO\"");
    }
}
