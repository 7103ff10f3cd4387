//! Upgrade scheduling against `spec.upgradeAt`.

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info};

use crate::crd::UpgradeConfig;
use crate::gates::parse_upgrade_at;

/// Scheduling decision, computed fresh every reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerResult {
    /// The scheduled time has been reached.
    pub is_ready: bool,
    /// The scheduled time plus the upgrade window has passed.
    pub is_breached: bool,
    /// Time left before the scheduled time. Zero once ready.
    pub time_until_upgrade: Duration,
}

impl SchedulerResult {
    const fn not_ready(time_until_upgrade: Duration) -> Self {
        Self {
            is_ready: false,
            is_breached: false,
            time_until_upgrade,
        }
    }
}

/// Decide whether the upgrade may start at `now`.
///
/// An unparseable `upgradeAt` is never ready. Validation rejects it earlier,
/// so this only guards against a spec edited between the two.
pub fn is_ready_to_upgrade(uc: &UpgradeConfig, window: Duration, now: DateTime<Utc>) -> SchedulerResult {
    let upgrade_at = match parse_upgrade_at(&uc.spec.upgrade_at) {
        Ok(t) => t,
        Err(e) => {
            error!(upgradeconfig = uc.name_or_unknown(), error = %e, "Failed to parse spec.upgradeAt");
            return SchedulerResult::not_ready(Duration::zero());
        }
    };

    if now > upgrade_at {
        return SchedulerResult {
            is_ready: true,
            is_breached: upgrade_at + window <= now,
            time_until_upgrade: Duration::zero(),
        };
    }

    let pending = upgrade_at - now;
    info!(
        upgradeconfig = uc.name_or_unknown(),
        "Upgrade is scheduled in {} hours {} mins",
        pending.num_hours(),
        pending.num_minutes() % 60
    );
    SchedulerResult::not_ready(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::upgrade_config;
    use chrono::TimeZone;

    fn upgrade_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_not_ready_before_upgrade_at() {
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        let result = is_ready_to_upgrade(&uc, Duration::minutes(120), upgrade_at() - Duration::hours(1));
        assert!(!result.is_ready);
        assert!(!result.is_breached);
        assert_eq!(result.time_until_upgrade, Duration::hours(1));
    }

    #[test]
    fn test_ready_within_window() {
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        let result = is_ready_to_upgrade(&uc, Duration::minutes(120), upgrade_at() + Duration::minutes(5));
        assert!(result.is_ready);
        assert!(!result.is_breached);
        assert_eq!(result.time_until_upgrade, Duration::zero());
    }

    #[test]
    fn test_breached_after_window() {
        let uc = upgrade_config("4.15.3", "stable-4.15", "");
        let result = is_ready_to_upgrade(&uc, Duration::minutes(120), upgrade_at() + Duration::minutes(121));
        assert!(result.is_ready);
        assert!(result.is_breached);
    }

    #[test]
    fn test_invalid_upgrade_at_is_never_ready() {
        let mut uc = upgrade_config("4.15.3", "stable-4.15", "");
        uc.spec.upgrade_at = "tomorrow".to_string();
        let result = is_ready_to_upgrade(&uc, Duration::minutes(120), upgrade_at());
        assert_eq!(result, SchedulerResult::not_ready(Duration::zero()));
    }
}
