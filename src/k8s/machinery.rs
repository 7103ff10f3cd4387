//! Machine config pool rollout state and node inspection.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use kube::api::{DynamicObject, ListParams};
use serde_json::Value;
use tracing::debug;

use super::{api_resource, k8s_time};
use crate::cluster::{Machinery, NodeState, NodeTaint, UpgradingResult};
use crate::error::MuoError;

const CURRENT_CONFIG_ANNOTATION: &str = "machineconfiguration.openshift.io/currentConfig";
const DESIRED_CONFIG_ANNOTATION: &str = "machineconfiguration.openshift.io/desiredConfig";

/// Worker nodes, excluding infra nodes.
const WORKER_SELECTOR: &str = "node-role.kubernetes.io/worker,!node-role.kubernetes.io/infra";

/// Rollout counters of a `MachineConfigPool` body.
pub fn pool_progress(data: &Value) -> UpgradingResult {
    let count = |field: &str| {
        data.get("status")
            .and_then(|s| s.get(field))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    };
    let machine_count = count("machineCount");
    let updated_count = count("updatedMachineCount");
    UpgradingResult {
        is_upgrading: machine_count != updated_count,
        machine_count,
        updated_count,
    }
}

/// Snapshot of a node. The node is upgrading while the machine config
/// daemon has not yet applied the desired config.
pub fn node_state(node: &Node) -> NodeState {
    let annotations = node.metadata.annotations.as_ref();
    let annotation = |key: &str| annotations.and_then(|a| a.get(key)).map(String::as_str);
    let upgrading = match (
        annotation(CURRENT_CONFIG_ANNOTATION),
        annotation(DESIRED_CONFIG_ANNOTATION),
    ) {
        (Some(current), Some(desired)) => current != desired,
        _ => false,
    };
    let spec = node.spec.as_ref();
    NodeState {
        name: node.metadata.name.clone().unwrap_or_default(),
        unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
        taints: spec
            .and_then(|s| s.taints.as_ref())
            .map(|taints| {
                taints
                    .iter()
                    .map(|t| NodeTaint {
                        key: t.key.clone(),
                        effect: t.effect.clone(),
                        time_added: k8s_time(t.time_added.as_ref()),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        upgrading,
    }
}

pub struct KubeMachinery {
    client: kube::Client,
}

impl KubeMachinery {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn list_nodes(&self, params: &ListParams) -> Result<Vec<NodeState>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(params)
            .await
            .map_err(|e| MuoError::KubernetesApi(format!("Failed to list nodes: {e}")))?;
        debug!(count = list.items.len(), "Listed nodes");
        Ok(list.items.iter().map(node_state).collect())
    }
}

#[async_trait]
impl Machinery for KubeMachinery {
    async fn is_upgrading(&self, pool: &str) -> Result<UpgradingResult> {
        let ar = api_resource(
            "machineconfiguration.openshift.io",
            "v1",
            "MachineConfigPool",
            "machineconfigpools",
        );
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let obj = api.get(pool).await.map_err(|e| {
            MuoError::KubernetesApi(format!("Failed to get MachineConfigPool {pool}: {e}"))
        })?;
        Ok(pool_progress(&obj.data))
    }

    async fn worker_nodes(&self) -> Result<Vec<NodeState>> {
        self.list_nodes(&ListParams::default().labels(WORKER_SELECTOR)).await
    }

    async fn all_nodes(&self) -> Result<Vec<NodeState>> {
        self.list_nodes(&ListParams::default()).await
    }
}
