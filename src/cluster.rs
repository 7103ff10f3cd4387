//! Live cluster state snapshots and the collaborator interfaces the upgrade
//! core consumes.
//!
//! Everything in this module that takes a snapshot is a pure function, so the
//! "has this already happened" questions asked by every step can be unit
//! tested without a cluster. The traits are the seams where kube-backed and
//! HTTP-backed implementations plug in.

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::crd::UpgradeConfig;
use crate::error::MuoError;

/// `ClusterVersion` history state of a finished rollout.
pub const COMPLETED_UPDATE: &str = "Completed";

/// A release the cluster may move to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Release {
    pub version: String,
    pub image: String,
}

/// One entry of `ClusterVersion.status.history`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionHistoryEntry {
    pub state: String,
    pub version: String,
    pub image: String,
    pub started_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusCondition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
}

impl StatusCondition {
    pub fn is(&self, condition_type: &str, status: &str) -> bool {
        self.r#type == condition_type && self.status == status
    }
}

/// Snapshot of the platform `ClusterVersion` object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterVersionState {
    pub cluster_id: String,
    pub channel: String,
    pub upstream: String,
    /// `spec.desiredUpdate`, absent when no update was ever requested.
    pub desired_update: Option<Release>,
    pub history: Vec<VersionHistoryEntry>,
    pub conditions: Vec<StatusCondition>,
    pub available_updates: Vec<Release>,
    pub conditional_updates: Vec<Release>,
}

/// Snapshot of one platform operator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterOperatorState {
    pub name: String,
    pub conditions: Vec<StatusCondition>,
}

impl ClusterOperatorState {
    /// Degraded, or explicitly not available.
    pub fn is_degraded(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.is("Degraded", "True") || c.is("Available", "False"))
    }
}

/// How the desired release is identified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeSource {
    Image(String),
    ChannelVersion { channel: String, version: String },
}

/// Image wins over channel + version when both are set.
pub fn upgrade_source(uc: &UpgradeConfig) -> Result<UpgradeSource, MuoError> {
    let desired = &uc.spec.desired;
    if !desired.image.is_empty() {
        return Ok(UpgradeSource::Image(desired.image.clone()));
    }
    if !desired.channel.is_empty() && !desired.version.is_empty() {
        return Ok(UpgradeSource::ChannelVersion {
            channel: desired.channel.clone(),
            version: desired.version.clone(),
        });
    }
    Err(MuoError::UpgradeSource(uc.name_or_unknown().to_string()))
}

/// True once the platform has been told to move to the desired release.
pub fn has_upgrade_commenced(cv: &ClusterVersionState, uc: &UpgradeConfig) -> Result<bool, MuoError> {
    let Some(update) = &cv.desired_update else {
        upgrade_source(uc)?;
        return Ok(false);
    };
    Ok(match upgrade_source(uc)? {
        UpgradeSource::Image(image) => update.image == image,
        UpgradeSource::ChannelVersion { version, .. } => update.version == version,
    })
}

pub fn has_upgrade_completed(cv: &ClusterVersionState, version: &str) -> bool {
    cv.history
        .iter()
        .any(|h| h.version == version && h.state == COMPLETED_UPDATE)
}

/// Version of the most recently completed rollout.
pub fn current_version(cv: &ClusterVersionState) -> Option<&str> {
    cv.history
        .iter()
        .filter(|h| h.state == COMPLETED_UPDATE)
        .max_by_key(|h| h.completion_time)
        .map(|h| h.version.as_str())
}

/// When the platform started rolling out `version`, if it has.
pub fn history_start_time(cv: &ClusterVersionState, version: &str) -> Option<DateTime<Utc>> {
    cv.history
        .iter()
        .find(|h| h.version == version)
        .and_then(|h| h.started_time)
}

pub fn is_progressing(cv: &ClusterVersionState) -> bool {
    cv.conditions.iter().any(|c| c.is("Progressing", "True"))
}

/// The `Upgradeable` condition, if the platform reports one.
pub fn upgradeable_condition(cv: &ClusterVersionState) -> Option<&StatusCondition> {
    cv.conditions.iter().find(|c| c.r#type == "Upgradeable")
}

/// Names of operators that are degraded or unavailable, in listing order.
pub fn degraded_operators(operators: &[ClusterOperatorState]) -> Vec<String> {
    operators
        .iter()
        .filter(|o| o.is_degraded())
        .map(|o| o.name.clone())
        .collect()
}

/// A node taint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeTaint {
    pub key: String,
    pub effect: String,
    pub time_added: Option<DateTime<Utc>>,
}

/// Snapshot of one node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeState {
    pub name: String,
    pub unschedulable: bool,
    pub taints: Vec<NodeTaint>,
    /// The machine config daemon is moving this node to a new config.
    pub upgrading: bool,
}

impl NodeState {
    /// Cordoned means unschedulable with a `NoSchedule` taint in place.
    pub fn is_cordoned(&self) -> bool {
        self.unschedulable && self.taints.iter().any(|t| t.effect == "NoSchedule")
    }
}

/// Rollout progress of a machine pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpgradingResult {
    pub is_upgrading: bool,
    pub machine_count: i64,
    pub updated_count: i64,
}

impl UpgradingResult {
    pub const fn pending(&self) -> i64 {
        self.machine_count - self.updated_count
    }
}

/// Outcome of a pod disruption budget analysis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PdbFinding {
    Valid,
    /// At least one budget blocks draining.
    Invalid { detail: String },
}

/// Access to the platform `ClusterVersion` and `ClusterOperator` objects.
#[async_trait]
pub trait ClusterVersionClient: Send + Sync {
    async fn get(&self) -> Result<ClusterVersionState>;

    /// Point the platform at the desired release.
    ///
    /// Returns false while the desired version is not yet offered in the
    /// channel.
    async fn ensure_desired_config(&self, uc: &UpgradeConfig) -> Result<bool>;

    async fn cluster_operators(&self) -> Result<Vec<ClusterOperatorState>>;
}

/// Alert silencing for the duration of the upgrade.
#[async_trait]
pub trait Maintenance: Send + Sync {
    async fn start_control_plane(
        &self,
        ends_at: DateTime<Utc>,
        version: &str,
        ignored_critical_alerts: &[String],
    ) -> Result<()>;

    async fn set_worker(&self, ends_at: DateTime<Utc>, version: &str, pending: i64) -> Result<()>;

    async fn end_control_plane(&self) -> Result<()>;

    async fn end_worker(&self) -> Result<()>;

    async fn is_active(&self) -> Result<bool>;
}

/// Temporary extra worker capacity.
#[async_trait]
pub trait Scaler: Send + Sync {
    async fn can_scale(&self) -> Result<bool>;

    /// Returns true once the extra capacity is ready.
    /// Fails with `MuoError::ScaleTimeout` once `timeout` has elapsed.
    async fn ensure_scale_up_nodes(&self, timeout: Duration, now: DateTime<Utc>) -> Result<bool>;

    /// Returns true once the extra capacity is gone.
    /// Fails with `MuoError::DrainTimeout` when a node does not drain in time.
    async fn ensure_scale_down_nodes(&self, drain_timeout: Duration, now: DateTime<Utc>) -> Result<bool>;
}

/// Machine pool and node inspection.
#[async_trait]
pub trait Machinery: Send + Sync {
    async fn is_upgrading(&self, pool: &str) -> Result<UpgradingResult>;

    /// Worker nodes, excluding infra nodes.
    async fn worker_nodes(&self) -> Result<Vec<NodeState>>;

    async fn all_nodes(&self) -> Result<Vec<NodeState>>;
}

/// Reachability of services the upgrade depends on.
#[async_trait]
pub trait AvailabilityChecker: Send + Sync {
    async fn available(&self) -> Result<()>;
}

#[async_trait]
pub trait PdbAnalyzer: Send + Sync {
    async fn analyze(&self) -> Result<PdbFinding>;
}

/// File integrity database maintenance after a landed upgrade.
#[async_trait]
pub trait FileIntegrity: Send + Sync {
    /// Ask the file integrity operator to rebuild its database.
    async fn reinit(&self) -> Result<()>;
}

/// Release graph of the update service.
#[async_trait]
pub trait UpdateGraph: Send + Sync {
    /// Versions reachable from `from_version` in `channel`.
    async fn available_updates(
        &self,
        upstream: &str,
        channel: &str,
        from_version: &str,
    ) -> Result<Vec<String>>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::spec::Update;
    use crate::crd::{UpgradeConfigSpec, UpgradeType};
    use chrono::TimeZone;

    pub(crate) fn upgrade_config(version: &str, channel: &str, image: &str) -> UpgradeConfig {
        UpgradeConfig::new(
            "managed-upgrade-config",
            UpgradeConfigSpec {
                desired: Update {
                    version: version.to_string(),
                    channel: channel.to_string(),
                    image: image.to_string(),
                },
                upgrade_at: "2026-10-17T10:00:00Z".to_string(),
                pdb_force_drain_timeout: 60,
                upgrade_type: UpgradeType::Osd,
                capacity_reservation: false,
            },
        )
    }

    fn completed(version: &str, hour: u32) -> VersionHistoryEntry {
        VersionHistoryEntry {
            state: COMPLETED_UPDATE.to_string(),
            version: version.to_string(),
            image: String::new(),
            started_time: Some(Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap()),
            completion_time: Some(Utc.with_ymd_and_hms(2026, 1, 1, hour, 30, 0).unwrap()),
        }
    }

    #[test]
    fn test_upgrade_source_prefers_image() {
        let uc = upgrade_config("4.15.3", "stable-4.15", "quay.io/x/y@sha256:abc");
        assert_eq!(
            upgrade_source(&uc).unwrap(),
            UpgradeSource::Image("quay.io/x/y@sha256:abc".to_string())
        );
    }

    #[test]
    fn test_upgrade_source_requires_channel_and_version() {
        let uc = upgrade_config("4.15.3", "", "");
        assert!(matches!(upgrade_source(&uc), Err(MuoError::UpgradeSource(_))));
    }

    #[test]
    fn test_has_upgrade_commenced_by_version() {
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        let mut cv = ClusterVersionState::default();
        assert!(!has_upgrade_commenced(&cv, &uc).unwrap());

        cv.desired_update = Some(Release {
            version: "4.14.9".to_string(),
            image: String::new(),
        });
        assert!(!has_upgrade_commenced(&cv, &uc).unwrap());

        cv.desired_update = Some(Release {
            version: "4.15.3".to_string(),
            image: String::new(),
        });
        assert!(has_upgrade_commenced(&cv, &uc).unwrap());
    }

    #[test]
    fn test_has_upgrade_commenced_by_image() {
        let uc = upgrade_config("", "", "quay.io/x/y@sha256:abc");
        let cv = ClusterVersionState {
            desired_update: Some(Release {
                version: String::new(),
                image: "quay.io/x/y@sha256:abc".to_string(),
            }),
            ..ClusterVersionState::default()
        };
        assert!(has_upgrade_commenced(&cv, &uc).unwrap());
    }

    #[test]
    fn test_current_version_is_latest_completed() {
        let mut partial = completed("4.15.3", 9);
        partial.state = "Partial".to_string();
        let cv = ClusterVersionState {
            history: vec![partial, completed("4.14.9", 5), completed("4.14.2", 1)],
            ..ClusterVersionState::default()
        };
        assert_eq!(current_version(&cv), Some("4.14.9"));
        assert!(has_upgrade_completed(&cv, "4.14.2"));
        assert!(!has_upgrade_completed(&cv, "4.15.3"));
        assert_eq!(
            history_start_time(&cv, "4.15.3"),
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_degraded_operators() {
        let cond = |t: &str, s: &str| StatusCondition {
            r#type: t.to_string(),
            status: s.to_string(),
            ..StatusCondition::default()
        };
        let operators = vec![
            ClusterOperatorState {
                name: "dns".to_string(),
                conditions: vec![cond("Degraded", "False"), cond("Available", "True")],
            },
            ClusterOperatorState {
                name: "etcd".to_string(),
                conditions: vec![cond("Degraded", "True")],
            },
            ClusterOperatorState {
                name: "ingress".to_string(),
                conditions: vec![cond("Available", "False")],
            },
        ];
        assert_eq!(degraded_operators(&operators), vec!["etcd", "ingress"]);
    }

    #[test]
    fn test_node_cordon_requires_no_schedule_taint() {
        let mut node = NodeState {
            name: "worker-0".to_string(),
            unschedulable: true,
            ..NodeState::default()
        };
        assert!(!node.is_cordoned());
        node.taints.push(NodeTaint {
            key: "node.kubernetes.io/unschedulable".to_string(),
            effect: "NoSchedule".to_string(),
            time_added: None,
        });
        assert!(node.is_cordoned());
        node.unschedulable = false;
        assert!(!node.is_cordoned());
    }

    #[test]
    fn test_upgrading_result_pending() {
        let result = UpgradingResult {
            is_upgrading: true,
            machine_count: 6,
            updated_count: 2,
        };
        assert_eq!(result.pending(), 4);
    }
}
