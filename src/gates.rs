//! Upgrade policy gates.
//!
//! Pure decision functions over cluster snapshots and elapsed time. The
//! step bodies in [`crate::upgrader`] call these and carry out the effects.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use semver::Version;

use crate::cluster::{
    ClusterVersionClient, ClusterVersionState, UpgradingResult, current_version,
    has_upgrade_commenced, history_start_time, upgradeable_condition,
};
use crate::config::OperatorConfig;
use crate::crd::UpgradeConfig;
use crate::error::MuoError;

/// Tell the platform to move to the desired release unless it already has.
///
/// Returns true once the change is in place. An already-commenced upgrade is
/// a no-op, so calling this twice never issues a second write.
pub async fn commence(client: &dyn ClusterVersionClient, uc: &UpgradeConfig) -> Result<bool> {
    let cv = client.get().await?;
    if has_upgrade_commenced(&cv, uc)? {
        return Ok(true);
    }
    client.ensure_desired_config(uc).await
}

/// Abandon an upgrade that has not commenced within the window.
///
/// A zero window disables expiry. Once commenced the gate never fires.
pub fn should_fail_upgrade(
    start: Option<DateTime<Utc>>,
    window: Duration,
    commenced: bool,
    now: DateTime<Utc>,
) -> bool {
    past_deadline(start, window, commenced, now)
}

/// Raise a delay notice for an upgrade not commenced within `delay_trigger`.
pub fn delay_check(
    start: Option<DateTime<Utc>>,
    delay_trigger: Duration,
    commenced: bool,
    now: DateTime<Utc>,
) -> bool {
    past_deadline(start, delay_trigger, commenced, now)
}

fn past_deadline(
    start: Option<DateTime<Utc>>,
    limit: Duration,
    commenced: bool,
    now: DateTime<Utc>,
) -> bool {
    if commenced || limit <= Duration::zero() {
        return false;
    }
    start.is_some_and(|start| now > start + limit)
}

/// When the control plane started moving: the platform history entry for
/// the desired version, else the scheduled `upgradeAt`.
pub fn control_plane_start(cv: &ClusterVersionState, uc: &UpgradeConfig) -> Result<DateTime<Utc>, MuoError> {
    if let Some(start) = history_start_time(cv, uc.desired_version()) {
        return Ok(start);
    }
    parse_upgrade_at(&uc.spec.upgrade_at)
}

pub fn control_plane_timeout(start: DateTime<Utc>, duration: Duration, now: DateTime<Utc>) -> bool {
    now > start + duration
}

/// Progress of the worker rollout as seen by the worker step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerProgress {
    Completed,
    InProgress { timed_out: bool },
}

/// Workers still rolling out with no active maintenance silence have
/// outlived their window.
pub const fn worker_timeout(result: &UpgradingResult, silence_active: bool) -> WorkerProgress {
    if result.is_upgrading {
        WorkerProgress::InProgress {
            timed_out: !silence_active,
        }
    } else {
        WorkerProgress::Completed
    }
}

/// End of the worker maintenance window, or `None` when no worker is left.
///
/// Each pending worker may wait the larger of the PDB force-drain timeout
/// and the node drain timeout, then take the expected drain time.
pub fn worker_maintenance_window(
    result: &UpgradingResult,
    pdb_force_drain_minutes: i32,
    cfg: &OperatorConfig,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let pending = result.pending();
    if !result.is_upgrading || pending < 1 {
        return None;
    }
    let pdb_timeout = Duration::minutes(i64::from(pdb_force_drain_minutes));
    let wait_per_node = pdb_timeout.max(cfg.node_drain_timeout());
    let total = (wait_per_node + cfg.expected_node_drain_time()) * i32::try_from(pending).ok()?;
    Some(now + total)
}

/// Whether the `Upgradeable` condition lets the desired version proceed.
///
/// An absent or `True` condition allows everything. `False` only allows
/// staying on the current minor version.
pub fn is_upgradeable(cv: &ClusterVersionState, desired_version: &str) -> Result<bool, MuoError> {
    let Some(condition) = upgradeable_condition(cv) else {
        return Ok(true);
    };
    if condition.status != "False" {
        return Ok(true);
    }
    let current = current_version(cv)
        .ok_or_else(|| MuoError::InvalidVersion("failed to get current cluster version".to_string()))?;
    let current = parse_version(current)?;
    let desired = parse_version(desired_version)?;
    Ok(current.major == desired.major && current.minor == desired.minor)
}

pub fn parse_version(version: &str) -> Result<Version, MuoError> {
    Version::parse(version).map_err(|e| MuoError::InvalidVersion(format!("{version}: {e}")))
}

pub fn parse_upgrade_at(upgrade_at: &str) -> Result<DateTime<Utc>, MuoError> {
    DateTime::parse_from_rfc3339(upgrade_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MuoError::Reconcile(format!("failed to parse spec.upgradeAt {upgrade_at}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::upgrade_config;
    use crate::cluster::{
        ClusterOperatorState, Release, StatusCondition, VersionHistoryEntry, COMPLETED_UPDATE,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 10, 0, 0).unwrap()
    }

    /// Platform that commences on the first `ensure_desired_config`.
    #[derive(Default)]
    struct FakePlatform {
        cv: Mutex<ClusterVersionState>,
        writes: Mutex<u32>,
    }

    #[async_trait]
    impl ClusterVersionClient for FakePlatform {
        async fn get(&self) -> Result<ClusterVersionState> {
            Ok(self.cv.lock().unwrap().clone())
        }
        async fn ensure_desired_config(&self, uc: &UpgradeConfig) -> Result<bool> {
            *self.writes.lock().unwrap() += 1;
            self.cv.lock().unwrap().desired_update = Some(Release {
                version: uc.desired_version().to_string(),
                image: String::new(),
            });
            Ok(true)
        }
        async fn cluster_operators(&self) -> Result<Vec<ClusterOperatorState>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_commence_is_idempotent() {
        let platform = FakePlatform::default();
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        assert!(commence(&platform, &uc).await.unwrap());
        assert!(commence(&platform, &uc).await.unwrap());
        assert_eq!(*platform.writes.lock().unwrap(), 1);
    }

    #[test]
    fn test_window_math() {
        let delay = Duration::minutes(30);
        let window = Duration::minutes(120);
        let at = |m: i64| t0() + Duration::minutes(m);

        assert!(!delay_check(Some(t0()), delay, false, at(29)));
        assert!(!should_fail_upgrade(Some(t0()), window, false, at(29)));

        assert!(delay_check(Some(t0()), delay, false, at(31)));
        assert!(!should_fail_upgrade(Some(t0()), window, false, at(31)));

        assert!(!should_fail_upgrade(Some(t0()), window, false, at(120)));
        assert!(should_fail_upgrade(Some(t0()), window, false, at(121)));
    }

    #[test]
    fn test_gates_bypassed_once_commenced() {
        let late = t0() + Duration::hours(10);
        assert!(!should_fail_upgrade(Some(t0()), Duration::minutes(120), true, late));
        assert!(!delay_check(Some(t0()), Duration::minutes(30), true, late));
    }

    #[test]
    fn test_zero_window_or_missing_start_never_fails() {
        let late = t0() + Duration::hours(10);
        assert!(!should_fail_upgrade(Some(t0()), Duration::zero(), false, late));
        assert!(!should_fail_upgrade(None, Duration::minutes(120), false, late));
    }

    #[test]
    fn test_control_plane_start_prefers_platform_history() {
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        let mut cv = ClusterVersionState::default();
        assert_eq!(control_plane_start(&cv, &uc).unwrap(), t0());

        cv.history.push(VersionHistoryEntry {
            state: "Partial".to_string(),
            version: "4.15.3".to_string(),
            started_time: Some(t0() + Duration::minutes(5)),
            ..VersionHistoryEntry::default()
        });
        let start = control_plane_start(&cv, &uc).unwrap();
        assert_eq!(start, t0() + Duration::minutes(5));
        assert!(!control_plane_timeout(start, Duration::minutes(60), start + Duration::minutes(60)));
        assert!(control_plane_timeout(start, Duration::minutes(60), start + Duration::minutes(61)));
    }

    #[test]
    fn test_worker_timeout() {
        let upgrading = UpgradingResult {
            is_upgrading: true,
            machine_count: 3,
            updated_count: 1,
        };
        assert_eq!(
            worker_timeout(&upgrading, false),
            WorkerProgress::InProgress { timed_out: true }
        );
        assert_eq!(
            worker_timeout(&upgrading, true),
            WorkerProgress::InProgress { timed_out: false }
        );
        assert_eq!(
            worker_timeout(&UpgradingResult::default(), false),
            WorkerProgress::Completed
        );
    }

    #[test]
    fn test_worker_maintenance_window() {
        let cfg = OperatorConfig::default();
        let result = UpgradingResult {
            is_upgrading: true,
            machine_count: 5,
            updated_count: 2,
        };
        // 3 pending * (max(60, 45) + 8) minutes
        assert_eq!(
            worker_maintenance_window(&result, 60, &cfg, t0()),
            Some(t0() + Duration::minutes(3 * 68))
        );
        // node drain timeout wins over a shorter PDB timeout
        assert_eq!(
            worker_maintenance_window(&result, 10, &cfg, t0()),
            Some(t0() + Duration::minutes(3 * 53))
        );
        let done = UpgradingResult {
            is_upgrading: true,
            machine_count: 3,
            updated_count: 3,
        };
        assert_eq!(worker_maintenance_window(&done, 60, &cfg, t0()), None);
        assert_eq!(worker_maintenance_window(&UpgradingResult::default(), 60, &cfg, t0()), None);
    }

    fn cv_with_upgradeable(status: Option<&str>) -> ClusterVersionState {
        ClusterVersionState {
            history: vec![VersionHistoryEntry {
                state: COMPLETED_UPDATE.to_string(),
                version: "4.14.9".to_string(),
                completion_time: Some(t0()),
                ..VersionHistoryEntry::default()
            }],
            conditions: status
                .map(|s| StatusCondition {
                    r#type: "Upgradeable".to_string(),
                    status: s.to_string(),
                    ..StatusCondition::default()
                })
                .into_iter()
                .collect(),
            ..ClusterVersionState::default()
        }
    }

    #[test]
    fn test_is_upgradeable_y_stream() {
        assert!(is_upgradeable(&cv_with_upgradeable(None), "4.15.3").unwrap());
        assert!(is_upgradeable(&cv_with_upgradeable(Some("True")), "4.15.3").unwrap());
        assert!(!is_upgradeable(&cv_with_upgradeable(Some("False")), "4.15.3").unwrap());
        assert!(is_upgradeable(&cv_with_upgradeable(Some("False")), "4.14.12").unwrap());
        assert!(is_upgradeable(&cv_with_upgradeable(Some("False")), "4.x").is_err());
    }
}
