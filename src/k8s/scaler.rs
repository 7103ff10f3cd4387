//! Temporary extra worker capacity through cloned `MachineSet`s.
//!
//! Every worker `MachineSet` gets a one-replica `<name>-upgrade` clone
//! labelled `upgrade.managed.openshift.io=true`. Scale-down deletes the
//! clones and waits for their machines to drain away.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kube::Api;
use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams, ObjectMeta, PostParams};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::info;

use super::{MACHINE_API_NAMESPACE, api_resource, k8s_time};
use crate::cluster::Scaler;
use crate::error::MuoError;

pub const UPGRADE_LABEL: &str = "upgrade.managed.openshift.io";
const MACHINE_POOL_LABEL: &str = "hive.openshift.io/machine-pool";
const MACHINESET_LABEL: &str = "machine.openshift.io/cluster-api-machineset";
const UPGRADE_SUFFIX: &str = "-upgrade";

fn machineset_resource() -> ApiResource {
    api_resource("machine.openshift.io", "v1beta1", "MachineSet", "machinesets")
}

fn machine_resource() -> ApiResource {
    api_resource("machine.openshift.io", "v1beta1", "Machine", "machines")
}

fn upgrade_selector() -> String {
    format!("{UPGRADE_LABEL}=true")
}

fn worker_source_selector() -> String {
    format!("{MACHINE_POOL_LABEL}=worker,!{UPGRADE_LABEL}")
}

/// One-replica clone of a worker `MachineSet`.
pub fn upgrade_machineset(source: &DynamicObject, ar: &ApiResource) -> Option<DynamicObject> {
    let name = format!("{}{UPGRADE_SUFFIX}", source.metadata.name.as_deref()?);
    let mut labels = source.metadata.labels.clone().unwrap_or_default();
    labels.insert(UPGRADE_LABEL.to_string(), "true".to_string());

    let mut spec = source.data.get("spec").cloned().unwrap_or_else(|| json!({}));
    spec["replicas"] = json!(1);
    spec["selector"]["matchLabels"][MACHINESET_LABEL] = json!(name);
    spec["template"]["metadata"]["labels"][MACHINESET_LABEL] = json!(name);
    spec["template"]["metadata"]["labels"][UPGRADE_LABEL] = json!("true");

    let mut obj = DynamicObject::new(&name, ar);
    obj.metadata = ObjectMeta {
        name: Some(name),
        namespace: Some(MACHINE_API_NAMESPACE.to_string()),
        labels: Some(labels),
        annotations: Some(BTreeMap::new()),
        ..ObjectMeta::default()
    };
    obj.data = json!({ "spec": spec });
    Some(obj)
}

/// All requested replicas report ready.
pub fn machineset_ready(data: &Value) -> bool {
    let replicas = data
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let ready = data
        .get("status")
        .and_then(|s| s.get("readyReplicas"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    ready >= replicas
}

/// Past its deadline: created (or marked deleted) at `since`, bounded by `timeout`.
pub fn deadline_passed(since: Option<DateTime<Utc>>, timeout: Duration, now: DateTime<Utc>) -> bool {
    since.is_some_and(|since| now > since + timeout)
}

pub struct KubeScaler {
    client: kube::Client,
}

impl KubeScaler {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn machinesets(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), MACHINE_API_NAMESPACE, &machineset_resource())
    }

    async fn list(&self, api: &Api<DynamicObject>, selector: &str) -> Result<Vec<DynamicObject>> {
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| MuoError::Scaling(format!("Failed to list machine objects: {e}")))?;
        Ok(list.items)
    }
}

#[async_trait]
impl Scaler for KubeScaler {
    async fn can_scale(&self) -> Result<bool> {
        let sources = self.list(&self.machinesets(), &worker_source_selector()).await?;
        Ok(!sources.is_empty())
    }

    async fn ensure_scale_up_nodes(&self, timeout: Duration, now: DateTime<Utc>) -> Result<bool> {
        let api = self.machinesets();
        let extra = self.list(&api, &upgrade_selector()).await?;

        if extra.is_empty() {
            let ar = machineset_resource();
            let sources = self.list(&api, &worker_source_selector()).await?;
            if sources.is_empty() {
                return Err(MuoError::Scaling("no worker machinesets to clone".to_string()).into());
            }
            for source in &sources {
                let Some(clone) = upgrade_machineset(source, &ar) else {
                    continue;
                };
                info!(machineset = clone.metadata.name.as_deref(), "Creating extra worker capacity");
                api.create(&PostParams::default(), &clone)
                    .await
                    .map_err(|e| MuoError::Scaling(format!("Failed to create machineset: {e}")))?;
            }
            return Ok(false);
        }

        let mut all_ready = true;
        for ms in &extra {
            if machineset_ready(&ms.data) {
                continue;
            }
            all_ready = false;
            let created = k8s_time(ms.metadata.creation_timestamp.as_ref());
            if deadline_passed(created, timeout, now) {
                let name = ms.metadata.name.clone().unwrap_or_default();
                return Err(MuoError::ScaleTimeout(name).into());
            }
        }
        Ok(all_ready)
    }

    async fn ensure_scale_down_nodes(&self, drain_timeout: Duration, now: DateTime<Utc>) -> Result<bool> {
        let api = self.machinesets();
        for ms in self.list(&api, &upgrade_selector()).await? {
            let Some(name) = ms.metadata.name.as_deref() else {
                continue;
            };
            if ms.metadata.deletion_timestamp.is_some() {
                continue;
            }
            info!(machineset = name, "Removing extra worker capacity");
            api.delete(name, &DeleteParams::default())
                .await
                .map_err(|e| MuoError::Scaling(format!("Failed to delete machineset {name}: {e}")))?;
        }

        let machines: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), MACHINE_API_NAMESPACE, &machine_resource());
        let remaining = self.list(&machines, &upgrade_selector()).await?;
        for machine in &remaining {
            let deleting = k8s_time(machine.metadata.deletion_timestamp.as_ref());
            if deadline_passed(deleting, drain_timeout, now) {
                let node = machine
                    .data
                    .get("status")
                    .and_then(|s| s.get("nodeRef"))
                    .and_then(|n| n.get("name"))
                    .and_then(Value::as_str)
                    .or(machine.metadata.name.as_deref())
                    .unwrap_or("unknown");
                return Err(MuoError::DrainTimeout(node.to_string()).into());
            }
        }
        Ok(remaining.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn source() -> DynamicObject {
        let ar = machineset_resource();
        let mut obj = DynamicObject::new("cluster-x-worker-a", &ar).within(MACHINE_API_NAMESPACE);
        obj.metadata.labels = Some(BTreeMap::from([(MACHINE_POOL_LABEL.to_string(), "worker".to_string())]));
        obj.metadata.resource_version = Some("4711".to_string());
        obj.data = json!({
            "spec": {
                "replicas": 3,
                "selector": {"matchLabels": {MACHINESET_LABEL: "cluster-x-worker-a"}},
                "template": {"metadata": {"labels": {MACHINESET_LABEL: "cluster-x-worker-a"}}}
            },
            "status": {"readyReplicas": 3}
        });
        obj
    }

    #[test]
    fn test_upgrade_machineset_clone() {
        let clone = upgrade_machineset(&source(), &machineset_resource()).unwrap();
        assert_eq!(clone.metadata.name.as_deref(), Some("cluster-x-worker-a-upgrade"));
        assert!(clone.metadata.resource_version.is_none());
        assert_eq!(
            clone.metadata.labels.as_ref().unwrap().get(UPGRADE_LABEL).map(String::as_str),
            Some("true")
        );
        let spec = &clone.data["spec"];
        assert_eq!(spec["replicas"], 1);
        assert_eq!(spec["selector"]["matchLabels"][MACHINESET_LABEL], "cluster-x-worker-a-upgrade");
        assert_eq!(spec["template"]["metadata"]["labels"][UPGRADE_LABEL], "true");
        assert!(clone.data.get("status").is_none());
    }

    #[test]
    fn test_machineset_ready() {
        assert!(machineset_ready(&source().data));
        assert!(!machineset_ready(&json!({"spec": {"replicas": 1}})));
    }

    #[test]
    fn test_deadline_passed() {
        let start = Utc.with_ymd_and_hms(2026, 10, 17, 10, 0, 0).unwrap();
        let timeout = Duration::minutes(30);
        assert!(!deadline_passed(Some(start), timeout, start + Duration::minutes(29)));
        assert!(deadline_passed(Some(start), timeout, start + Duration::minutes(31)));
        assert!(!deadline_passed(None, timeout, start + Duration::hours(5)));
    }

    #[test]
    fn test_selectors() {
        assert_eq!(upgrade_selector(), "upgrade.managed.openshift.io=true");
        assert_eq!(
            worker_source_selector(),
            "hive.openshift.io/machine-pool=worker,!upgrade.managed.openshift.io"
        );
    }
}
