//! `ClusterVersion` and `ClusterOperator` access.

use anyhow::Result;
use async_trait::async_trait;
use kube::Api;
use kube::api::{ApiResource, DynamicObject, ListParams, Patch, PatchParams};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::api_resource;
use crate::cluster::{
    ClusterOperatorState, ClusterVersionClient, ClusterVersionState, Release, StatusCondition,
    UpgradeSource, VersionHistoryEntry, has_upgrade_commenced, upgrade_source,
};
use crate::crd::UpgradeConfig;
use crate::error::MuoError;
use crate::status::FIELD_MANAGER;

/// The singleton `ClusterVersion` object.
const CLUSTER_VERSION_NAME: &str = "version";

fn cluster_version_resource() -> ApiResource {
    api_resource("config.openshift.io", "v1", "ClusterVersion", "clusterversions")
}

fn cluster_operator_resource() -> ApiResource {
    api_resource("config.openshift.io", "v1", "ClusterOperator", "clusteroperators")
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WireRelease {
    version: String,
    image: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WireConditional {
    release: WireRelease,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WireCondition {
    r#type: String,
    status: String,
    reason: String,
    message: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WireHistory {
    state: String,
    version: String,
    image: String,
    started_time: Option<chrono::DateTime<chrono::Utc>>,
    completion_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WireSpec {
    #[serde(rename = "clusterID")]
    cluster_id: String,
    channel: String,
    upstream: String,
    desired_update: Option<WireRelease>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WireStatus {
    history: Vec<WireHistory>,
    conditions: Vec<WireCondition>,
    available_updates: Option<Vec<WireRelease>>,
    conditional_updates: Option<Vec<WireConditional>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireClusterVersion {
    spec: WireSpec,
    status: WireStatus,
}

impl From<WireRelease> for Release {
    fn from(r: WireRelease) -> Self {
        Self {
            version: r.version,
            image: r.image,
        }
    }
}

impl From<WireCondition> for StatusCondition {
    fn from(c: WireCondition) -> Self {
        Self {
            r#type: c.r#type,
            status: c.status,
            reason: c.reason,
            message: c.message,
        }
    }
}

/// Map a raw `ClusterVersion` body into a snapshot.
pub fn parse_cluster_version(data: &Value) -> Result<ClusterVersionState> {
    let cv: WireClusterVersion = serde_json::from_value(data.clone())
        .map_err(|e| MuoError::KubernetesApi(format!("Malformed ClusterVersion: {e}")))?;
    Ok(ClusterVersionState {
        cluster_id: cv.spec.cluster_id,
        channel: cv.spec.channel,
        upstream: cv.spec.upstream,
        desired_update: cv.spec.desired_update.map(Release::from),
        history: cv
            .status
            .history
            .into_iter()
            .map(|h| VersionHistoryEntry {
                state: h.state,
                version: h.version,
                image: h.image,
                started_time: h.started_time,
                completion_time: h.completion_time,
            })
            .collect(),
        conditions: cv.status.conditions.into_iter().map(StatusCondition::from).collect(),
        available_updates: cv
            .status
            .available_updates
            .unwrap_or_default()
            .into_iter()
            .map(Release::from)
            .collect(),
        conditional_updates: cv
            .status
            .conditional_updates
            .unwrap_or_default()
            .into_iter()
            .map(|c| Release::from(c.release))
            .collect(),
    })
}

/// Map a raw `ClusterOperator` into a snapshot.
pub fn parse_cluster_operator(obj: &DynamicObject) -> ClusterOperatorState {
    let conditions = obj
        .data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .cloned()
        .and_then(|c| serde_json::from_value::<Vec<WireCondition>>(c).ok())
        .unwrap_or_default();
    ClusterOperatorState {
        name: obj.metadata.name.clone().unwrap_or_default(),
        conditions: conditions.into_iter().map(StatusCondition::from).collect(),
    }
}

/// The merge patch that moves the cluster towards `uc`, or `None` while the
/// desired version is not yet offered in the channel.
pub fn desired_update_patch(cv: &ClusterVersionState, source: &UpgradeSource) -> Option<Value> {
    match source {
        UpgradeSource::Image(image) => Some(json!({
            "spec": {"desiredUpdate": {"image": image, "force": false}}
        })),
        UpgradeSource::ChannelVersion { channel, version } => {
            if cv.channel != *channel {
                return Some(json!({"spec": {"channel": channel}}));
            }
            cv.available_updates
                .iter()
                .chain(&cv.conditional_updates)
                .find(|r| r.version == *version)
                .map(|release| {
                    json!({
                        "spec": {"desiredUpdate": {
                            "version": release.version,
                            "image": release.image,
                            "force": false
                        }}
                    })
                })
        }
    }
}

pub struct KubeClusterVersion {
    client: kube::Client,
}

impl KubeClusterVersion {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &cluster_version_resource())
    }
}

#[async_trait]
impl ClusterVersionClient for KubeClusterVersion {
    async fn get(&self) -> Result<ClusterVersionState> {
        let obj = self
            .api()
            .get(CLUSTER_VERSION_NAME)
            .await
            .map_err(|e| MuoError::KubernetesApi(format!("Failed to get ClusterVersion: {e}")))?;
        parse_cluster_version(&obj.data)
    }

    async fn ensure_desired_config(&self, uc: &UpgradeConfig) -> Result<bool> {
        let cv = self.get().await?;
        if has_upgrade_commenced(&cv, uc)? {
            return Ok(true);
        }
        let source = upgrade_source(uc)?;
        let Some(patch) = desired_update_patch(&cv, &source) else {
            info!(
                upgradeconfig = uc.name_or_unknown(),
                version = uc.desired_version(),
                "Desired version not yet available in channel"
            );
            return Ok(false);
        };
        let channel_only = patch["spec"].get("desiredUpdate").is_none();
        self.api()
            .patch(
                CLUSTER_VERSION_NAME,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| MuoError::KubernetesApi(format!("Failed to patch ClusterVersion: {e}")))?;
        debug!(patch = %patch, "Patched ClusterVersion");
        Ok(!channel_only)
    }

    async fn cluster_operators(&self) -> Result<Vec<ClusterOperatorState>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &cluster_operator_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| MuoError::KubernetesApi(format!("Failed to list ClusterOperators: {e}")))?;
        Ok(list.items.iter().map(parse_cluster_operator).collect())
    }
}
