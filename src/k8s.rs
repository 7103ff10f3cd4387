//! Kubernetes-backed implementations of the cluster collaborator traits.
//!
//! OpenShift resources are reached through `DynamicObject`; core resources
//! through the typed `k8s-openapi` APIs.

pub mod cluster_version;
pub mod file_integrity;
pub mod machinery;
pub mod pdb;
pub mod scaler;

use chrono::{DateTime, Utc};
use kube::api::ApiResource;
use serde::Serialize;

pub use cluster_version::KubeClusterVersion;
pub use file_integrity::KubeFileIntegrity;
pub use machinery::KubeMachinery;
pub use pdb::KubePdbAnalyzer;
pub use scaler::KubeScaler;

/// Namespace of the machine API objects.
pub const MACHINE_API_NAMESPACE: &str = "openshift-machine-api";

/// `ApiResource` for an OpenShift kind.
pub(crate) fn api_resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: format!("{group}/{version}"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Convert a Kubernetes timestamp to chrono through its RFC3339 wire form.
pub(crate) fn k8s_time<T: Serialize>(time: Option<&T>) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time?).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_resource() {
        let ar = api_resource("config.openshift.io", "v1", "ClusterVersion", "clusterversions");
        assert_eq!(ar.api_version, "config.openshift.io/v1");
        assert_eq!(ar.plural, "clusterversions");
    }

    #[test]
    fn test_k8s_time_parses_rfc3339() {
        let raw = "2026-10-17T10:00:00Z".to_string();
        let parsed = k8s_time(Some(&raw)).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-10-17T10:00:00+00:00");
        assert!(k8s_time::<String>(None).is_none());
    }
}
