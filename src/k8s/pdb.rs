//! PDB (PodDisruptionBudget) drain deadlock validation.
//!
//! Detects budgets that can never allow a node drain during the worker
//! rollout.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::api::ListParams;
use tracing::debug;

use crate::cluster::{PdbAnalyzer, PdbFinding};
use crate::error::MuoError;

/// Platform namespaces whose budgets are managed by the platform itself.
const PLATFORM_NAMESPACE_PREFIXES: &[&str] = &["openshift-", "kube-"];

/// Why a budget blocks draining, if it does.
///
/// A budget blocks drain when it protects active pods, currently allows zero
/// disruptions, and its spec makes that permanent (`minAvailable: 100%` or
/// `maxUnavailable: 0`).
pub fn blocking_reason(pdb: &PodDisruptionBudget) -> Option<String> {
    let status = pdb.status.as_ref()?;
    if status.disruptions_allowed != 0 || status.expected_pods == 0 {
        return None;
    }
    let spec = pdb.spec.as_ref()?;
    let rule = match (&spec.min_available, &spec.max_unavailable) {
        (Some(IntOrString::String(s)), _) if s == "100%" => "minAvailable=100%",
        (Some(IntOrString::Int(n)), _) if *n >= status.expected_pods => "minAvailable>=expectedPods",
        (_, Some(IntOrString::Int(0))) => "maxUnavailable=0",
        (_, Some(IntOrString::String(s))) if s == "0%" => "maxUnavailable=0%",
        _ => return None,
    };
    let namespace = pdb.metadata.namespace.as_deref().unwrap_or("default");
    let name = pdb.metadata.name.as_deref().unwrap_or("unknown");
    Some(format!("{namespace}/{name} ({rule})"))
}

fn is_platform_namespace(pdb: &PodDisruptionBudget) -> bool {
    pdb.metadata
        .namespace
        .as_deref()
        .is_some_and(|ns| PLATFORM_NAMESPACE_PREFIXES.iter().any(|p| ns.starts_with(p)))
}

/// Summarize the blocking budgets of a listing.
pub fn analyze_pdbs(pdbs: &[PodDisruptionBudget]) -> PdbFinding {
    let blocking: Vec<String> = pdbs
        .iter()
        .filter(|pdb| !is_platform_namespace(pdb))
        .filter_map(blocking_reason)
        .collect();
    debug!("PDB check complete: {}/{} blocking", blocking.len(), pdbs.len());
    if blocking.is_empty() {
        PdbFinding::Valid
    } else {
        PdbFinding::Invalid {
            detail: format!("PDBs blocking node drain: {}", blocking.join(", ")),
        }
    }
}

pub struct KubePdbAnalyzer {
    client: kube::Client,
}

impl KubePdbAnalyzer {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PdbAnalyzer for KubePdbAnalyzer {
    async fn analyze(&self) -> Result<PdbFinding> {
        let pdbs: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        let list = pdbs
            .list(&ListParams::default())
            .await
            .map_err(|e| MuoError::KubernetesApi(format!("Failed to list PDBs: {e}")))?;
        Ok(analyze_pdbs(&list.items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::policy::v1::{PodDisruptionBudgetSpec, PodDisruptionBudgetStatus};
    use kube::api::ObjectMeta;

    fn pdb(
        namespace: &str,
        min_available: Option<IntOrString>,
        max_unavailable: Option<IntOrString>,
        disruptions_allowed: i32,
        expected_pods: i32,
    ) -> PodDisruptionBudget {
        PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                min_available,
                max_unavailable,
                ..PodDisruptionBudgetSpec::default()
            }),
            status: Some(PodDisruptionBudgetStatus {
                disruptions_allowed,
                expected_pods,
                ..PodDisruptionBudgetStatus::default()
            }),
        }
    }

    #[test]
    fn test_full_min_available_blocks() {
        let p = pdb("payments", Some(IntOrString::String("100%".to_string())), None, 0, 3);
        assert_eq!(blocking_reason(&p).as_deref(), Some("payments/api (minAvailable=100%)"));
    }

    #[test]
    fn test_zero_max_unavailable_blocks() {
        let p = pdb("payments", None, Some(IntOrString::Int(0)), 0, 2);
        assert!(blocking_reason(&p).is_some());
    }

    #[test]
    fn test_temporarily_exhausted_budget_is_valid() {
        let p = pdb("payments", Some(IntOrString::Int(1)), None, 0, 3);
        assert!(blocking_reason(&p).is_none());
    }

    #[test]
    fn test_budget_without_pods_is_valid() {
        let p = pdb("payments", Some(IntOrString::String("100%".to_string())), None, 0, 0);
        assert!(blocking_reason(&p).is_none());
    }

    #[test]
    fn test_analyze_ignores_platform_namespaces() {
        let pdbs = vec![
            pdb("openshift-etcd", Some(IntOrString::String("100%".to_string())), None, 0, 3),
            pdb("kube-system", None, Some(IntOrString::Int(0)), 0, 1),
        ];
        assert_eq!(analyze_pdbs(&pdbs), PdbFinding::Valid);

        let mut pdbs = pdbs;
        pdbs.push(pdb("payments", None, Some(IntOrString::String("0%".to_string())), 0, 2));
        assert_eq!(
            analyze_pdbs(&pdbs),
            PdbFinding::Invalid {
                detail: "PDBs blocking node drain: payments/api (maxUnavailable=0%)".to_string()
            }
        );
    }
}
