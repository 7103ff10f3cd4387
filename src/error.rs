//! Custom error types for muo.

use thiserror::Error;

/// Errors that can occur while orchestrating a cluster upgrade.
#[derive(Error, Debug)]
pub enum MuoError {
    #[error("Invalid operator configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Cannot find the correct upgrade spec source: {0}")]
    UpgradeSource(String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Status of {0} changed since it was read")]
    StatusConflict(String),

    #[error("Metrics query failed: {0}")]
    MetricsQuery(String),

    #[error("Maintenance window error: {0}")]
    Maintenance(String),

    #[error("Scaling error: {0}")]
    Scaling(String),

    #[error("Timed out waiting for extra capacity: {0}")]
    ScaleTimeout(String),

    #[error("Timed out draining node: {0}")]
    DrainTimeout(String),

    #[error("Availability check failed: {0}")]
    AvailabilityCheck(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Notification state transition from {from} to {to} is not allowed")]
    InvalidTransition { from: String, to: String },

    #[error("Notification state {0} is not supported")]
    UnsupportedNotifyState(String),

    #[error("No upgrade config manager configured")]
    PolicyNotConfigured,

    #[error("Upgrade policy sync failed: {0}")]
    PolicySync(String),

    #[error("{0}")]
    Reconcile(String),
}

impl MuoError {
    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::KubernetesApi(_)
                | Self::StatusConflict(_)
                | Self::MetricsQuery(_)
                | Self::Maintenance(_)
                | Self::Scaling(_)
                | Self::AvailabilityCheck(_)
                | Self::Notification(_)
                | Self::PolicySync(_)
        )
    }

    /// Map an `anyhow::Error` to a `MuoError`, keeping the original variant when present.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(e) => e,
            Err(other) => Self::Reconcile(format!("{other:#}")),
        }
    }
}

impl From<kube::Error> for MuoError {
    fn from(err: kube::Error) -> Self {
        Self::KubernetesApi(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_version() {
        let err = MuoError::InvalidVersion("4.x".to_string());
        assert_eq!(err.to_string(), "Invalid version format: 4.x");
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = MuoError::InvalidTransition {
            from: "Completed".to_string(),
            to: "Started".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Notification state transition from Completed to Started is not allowed"
        );
    }

    #[test]
    fn test_error_display_kubernetes_api() {
        let err = MuoError::KubernetesApi("conflict on UpgradeConfig".to_string());
        assert_eq!(
            err.to_string(),
            "Kubernetes API error: conflict on UpgradeConfig"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(MuoError::KubernetesApi("x".into()).is_transient());
        assert!(MuoError::StatusConflict("managed-upgrade-config".into()).is_transient());
        assert!(MuoError::MetricsQuery("x".into()).is_transient());
        assert!(MuoError::Notification("x".into()).is_transient());
        assert!(!MuoError::InvalidVersion("x".into()).is_transient());
        assert!(!MuoError::ScaleTimeout("x".into()).is_transient());
        assert!(!MuoError::PolicyNotConfigured.is_transient());
    }

    #[test]
    fn test_from_anyhow_keeps_variant() {
        let err = anyhow::Error::from(MuoError::Maintenance("silence create failed".into()));
        let mapped = MuoError::from_anyhow(err);
        assert!(matches!(mapped, MuoError::Maintenance(_)));
    }

    #[test]
    fn test_from_anyhow_wraps_foreign_error() {
        let err = anyhow::anyhow!("socket closed").context("querying prometheus");
        let mapped = MuoError::from_anyhow(err);
        assert!(matches!(mapped, MuoError::Reconcile(_)));
        assert!(mapped.to_string().contains("socket closed"));
    }
}
