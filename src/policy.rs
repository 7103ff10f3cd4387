//! Upgrade policy synchronisation.
//!
//! The cluster's upgrade policy lives outside the `UpgradeConfig` object. A
//! background loop periodically pulls the policy and replaces the object's
//! spec when it changed. The phase machine also refreshes on demand right
//! before an upgrade starts, so a late policy change aborts the pass.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube::api::{DeleteParams, PostParams};
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterVersionClient, is_progressing};
use crate::crd::{UpgradeConfig, UpgradeConfigSpec, UpgradePhase};
use crate::error::MuoError;
use crate::status::phase_for;
use crate::telemetry::metrics::MetricsSink;

/// Name of the single `UpgradeConfig` the manager owns.
pub const UPGRADE_CONFIG_NAME: &str = "managed-upgrade-config";

/// ConfigMap data key holding the YAML list of upgrade specs.
pub const POLICY_KEY: &str = "upgradePolicies";

/// Relative deviation applied to every sync interval.
pub const JITTER_FACTOR: f64 = 0.1;

/// Delay before the first sync after startup.
pub const INITIAL_SYNC: Duration = Duration::from_secs(60);

const BACKOFF_MIN: Duration = Duration::from_secs(60);
const BACKOFF_MAX: Duration = Duration::from_secs(3600);

const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DELETE_POLL_ATTEMPTS: u32 = 12;

/// Refreshes the `UpgradeConfig` from the policy source.
#[async_trait]
pub trait PolicyRefresher: Send + Sync {
    /// Returns true when the stored spec was replaced or removed.
    ///
    /// Fails with [`MuoError::PolicyNotConfigured`] when no policy source is
    /// configured.
    async fn refresh(&self) -> Result<bool>;
}

/// Source of upgrade specs.
#[async_trait]
pub trait SpecProvider: Send + Sync {
    async fn specs(&self) -> Result<Vec<UpgradeConfigSpec>>;
}

/// Storage of the managed `UpgradeConfig`.
#[async_trait]
pub trait UpgradeConfigStore: Send + Sync {
    async fn get(&self) -> Result<Option<UpgradeConfig>>;
    async fn delete(&self) -> Result<()>;
    async fn create(&self, uc: &UpgradeConfig) -> Result<()>;
}

/// Parse the policy document stored under [`POLICY_KEY`].
pub fn parse_policy(document: &str) -> Result<Vec<UpgradeConfigSpec>, MuoError> {
    if document.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(document)
        .map_err(|e| MuoError::PolicySync(format!("invalid upgrade policy document: {e}")))
}

/// Reads upgrade specs from a ConfigMap in the operator namespace.
pub struct ConfigMapSpecProvider {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapSpecProvider {
    pub fn new(client: kube::Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

#[async_trait]
impl SpecProvider for ConfigMapSpecProvider {
    async fn specs(&self) -> Result<Vec<UpgradeConfigSpec>> {
        debug!(configmap = self.name.as_str(), "Reading upgrade policy");
        let cm = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| MuoError::PolicySync(format!("unable to read ConfigMap {}: {e}", self.name)))?
            .ok_or_else(|| MuoError::PolicySync(format!("ConfigMap {} not found", self.name)))?;
        let document = cm
            .data
            .as_ref()
            .and_then(|data| data.get(POLICY_KEY))
            .map_or("", String::as_str);
        Ok(parse_policy(document)?)
    }
}

/// `UpgradeConfig` store backed by the Kubernetes API.
pub struct KubeUpgradeConfigStore {
    api: Api<UpgradeConfig>,
}

impl KubeUpgradeConfigStore {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl UpgradeConfigStore for KubeUpgradeConfigStore {
    async fn get(&self) -> Result<Option<UpgradeConfig>> {
        Ok(self.api.get_opt(UPGRADE_CONFIG_NAME).await.map_err(MuoError::from)?)
    }

    async fn delete(&self) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        self.api
            .delete(UPGRADE_CONFIG_NAME, &params)
            .await
            .map_err(|e| MuoError::PolicySync(format!("unable to remove UpgradeConfig: {e}")))?;
        Ok(())
    }

    async fn create(&self, uc: &UpgradeConfig) -> Result<()> {
        self.api
            .create(&PostParams::default(), uc)
            .await
            .map_err(|e| MuoError::PolicySync(format!("unable to create UpgradeConfig: {e}")))?;
        Ok(())
    }
}

/// Keeps the managed `UpgradeConfig` in line with the policy source.
pub struct UpgradeConfigManager {
    store: Arc<dyn UpgradeConfigStore>,
    cluster_version: Arc<dyn ClusterVersionClient>,
    provider: Option<Arc<dyn SpecProvider>>,
    namespace: String,
    delete_poll_interval: Duration,
}

impl UpgradeConfigManager {
    pub fn new(
        store: Arc<dyn UpgradeConfigStore>,
        cluster_version: Arc<dyn ClusterVersionClient>,
        provider: Option<Arc<dyn SpecProvider>>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cluster_version,
            provider,
            namespace: namespace.into(),
            delete_poll_interval: DELETE_POLL_INTERVAL,
        }
    }

    /// An upgrade is underway when the stored config is upgrading or the
    /// platform reports progress.
    async fn upgrade_in_progress(&self, current: Option<&UpgradeConfig>) -> Result<bool> {
        let upgrading = current.is_some_and(|uc| {
            uc.status
                .as_ref()
                .is_some_and(|s| phase_for(s, uc.desired_version()) == UpgradePhase::Upgrading)
        });
        if upgrading {
            return Ok(true);
        }
        let cv = self
            .cluster_version
            .get()
            .await
            .map_err(|e| MuoError::PolicySync(format!("can't determine cluster version: {e:#}")))?;
        Ok(is_progressing(&cv))
    }

    async fn wait_until_deleted(&self) -> Result<()> {
        for _ in 0..DELETE_POLL_ATTEMPTS {
            if self.store.get().await?.is_none() {
                info!("UpgradeConfig deletion confirmed");
                return Ok(());
            }
            tokio::time::sleep(self.delete_poll_interval).await;
        }
        Err(MuoError::PolicySync("unable to confirm deletion of current UpgradeConfig".to_string()).into())
    }

    fn replacement(&self, spec: UpgradeConfigSpec) -> UpgradeConfig {
        let mut uc = UpgradeConfig::new(UPGRADE_CONFIG_NAME, spec);
        uc.metadata.namespace = Some(self.namespace.clone());
        uc
    }
}

#[async_trait]
impl PolicyRefresher for UpgradeConfigManager {
    async fn refresh(&self) -> Result<bool> {
        let current = self.store.get().await?;

        if self.upgrade_in_progress(current.as_ref()).await? {
            info!("Skipping spec refresh as the cluster is currently upgrading");
            return Ok(false);
        }

        let Some(provider) = &self.provider else {
            return Err(MuoError::PolicyNotConfigured.into());
        };
        let specs = provider.specs().await.map_err(|e| {
            error!(error = %e, "Error pulling provider specs");
            MuoError::PolicySync(format!("unable to retrieve upgrade spec: {e:#}"))
        })?;

        let Some(spec) = specs.into_iter().next() else {
            if current.is_some() {
                info!(upgradeconfig = UPGRADE_CONFIG_NAME, "Removing expired UpgradeConfig");
                self.store.delete().await?;
                return Ok(true);
            }
            return Ok(false);
        };

        if let Some(current) = &current {
            if current.spec == spec {
                debug!(upgradeconfig = UPGRADE_CONFIG_NAME, "No change in upgrade spec");
                return Ok(false);
            }
            info!(upgradeconfig = UPGRADE_CONFIG_NAME, "Cluster upgrade spec has changed, will delete and re-create");
            self.store.delete().await?;
            self.wait_until_deleted().await?;
        }

        self.store.create(&self.replacement(spec)).await?;
        info!(upgradeconfig = UPGRADE_CONFIG_NAME, "Created UpgradeConfig from the upgrade policy");
        Ok(true)
    }
}

/// Deviate `base` by up to `factor` in either direction.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn jitter<R: Rng + ?Sized>(base: Duration, factor: f64, rng: &mut R) -> Duration {
    let nanos = base.as_nanos() as f64;
    let min = (nanos * (1.0 - factor)).floor().max(0.0) as u64;
    let max = (nanos * (1.0 + factor)).ceil() as u64;
    if max <= min {
        return base;
    }
    Duration::from_nanos(rng.gen_range(min..max))
}

/// Wait after `failures` consecutive refresh errors: one minute doubling up
/// to one hour.
pub fn backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_MIN
        .saturating_mul(1 << exponent)
        .min(BACKOFF_MAX)
}

/// Periodically refresh the policy until `shutdown` flips.
pub async fn start_sync(
    refresher: Arc<dyn PolicyRefresher>,
    metrics: Arc<dyn MetricsSink>,
    watch_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = watch_interval.as_secs(), "Starting the upgrade policy sync");
    let mut failures = 0u32;
    let mut wait = jitter(INITIAL_SYNC, JITTER_FACTOR, &mut rand::thread_rng());

    loop {
        tokio::select! {
            () = tokio::time::sleep(wait) => {
                match refresher.refresh().await {
                    Ok(changed) => {
                        failures = 0;
                        metrics.update_config_synced(UPGRADE_CONFIG_NAME, Utc::now());
                        if changed {
                            info!(upgradeconfig = UPGRADE_CONFIG_NAME, "Upgrade policy applied");
                        }
                        wait = jitter(watch_interval, JITTER_FACTOR, &mut rand::thread_rng());
                    }
                    Err(e) => {
                        if matches!(e.downcast_ref::<MuoError>(), Some(MuoError::PolicyNotConfigured)) {
                            info!("No upgrade policy source configured, will not sync");
                            return;
                        }
                        failures = failures.saturating_add(1);
                        let retry = backoff(failures);
                        warn!(error = %e, retry_secs = retry.as_secs(), "Unable to refresh upgrade config");
                        wait = jitter(retry, JITTER_FACTOR, &mut rand::thread_rng());
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Stopping the upgrade policy sync");
                break;
            }
        }
    }
}
