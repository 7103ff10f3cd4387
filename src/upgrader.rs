//! Upgrade step catalogue and the generic cluster upgrader.
//!
//! Both upgrade flavors share one runner. The flavor only selects the step
//! list and a [`VariantPolicy`]. Every step begins with a live-state check
//! (usually "has the platform already been told to upgrade?") so that a
//! pass can be repeated from the top without repeating side effects.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Span, error, info, warn};

use crate::cluster::{
    AvailabilityChecker, ClusterVersionClient, FileIntegrity, Machinery, Maintenance, PdbAnalyzer,
    Scaler, has_upgrade_commenced, has_upgrade_completed,
};
use crate::config::OperatorConfig;
use crate::crd::{UpgradeConfig, UpgradeHistory, UpgradePhase, UpgradeType};
use crate::error::MuoError;
use crate::events::{EventManager, failure_description};
use crate::gates::{
    WorkerProgress, commence, control_plane_start, control_plane_timeout, delay_check,
    is_upgradeable, should_fail_upgrade, worker_maintenance_window, worker_timeout,
};
use crate::health::{
    HealthChecks, HealthReporter, post_upgrade_health_check, pre_upgrade_health_check,
};
use crate::monitoring::MetricsQuery;
use crate::notify::NotifyState;
use crate::status::{
    EventPublisher, set_condition_in_progress, set_condition_start, set_failed_upgrade_condition,
};
use crate::steps::{UpgradeStep, run_steps};
use crate::telemetry::metrics::MetricsSink;

/// Machine config pool holding the worker nodes.
const WORKER_POOL: &str = "worker";

/// Named checkpoints of an upgrade. The string form is the condition type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepName {
    SendStartedNotification,
    UpgradeDelayedCheck,
    IsClusterUpgradable,
    PreHealthCheck,
    ExtDepAvailabilityCheck,
    ScaleUpExtraNodes,
    ControlPlaneMaintWindow,
    CommenceUpgrade,
    ControlPlaneUpgraded,
    RemoveControlPlaneMaintWindow,
    WorkersMaintWindow,
    AllWorkerNodesUpgraded,
    RemoveExtraScaledNodes,
    RemoveMaintWindow,
    PostClusterHealthCheck,
    PostUpgradeProcedures,
    SendCompletedNotification,
}

impl StepName {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SendStartedNotification => "StartedNotificationSent",
            Self::UpgradeDelayedCheck => "UpgradeDelayedCheck",
            Self::IsClusterUpgradable => "IsClusterUpgradable",
            Self::PreHealthCheck => "PreHealthCheck",
            Self::ExtDepAvailabilityCheck => "ExtDepAvailabilityCheck",
            Self::ScaleUpExtraNodes => "ScaleUpExtraNodes",
            Self::ControlPlaneMaintWindow => "ControlPlaneMaintWindow",
            Self::CommenceUpgrade => "CommenceUpgrade",
            Self::ControlPlaneUpgraded => "ControlPlaneUpgraded",
            Self::RemoveControlPlaneMaintWindow => "RemoveControlPlaneMaintWindow",
            Self::WorkersMaintWindow => "WorkersMaintWindow",
            Self::AllWorkerNodesUpgraded => "AllWorkerNodesUpgraded",
            Self::RemoveExtraScaledNodes => "RemoveExtraScaledNodes",
            Self::RemoveMaintWindow => "RemoveMaintWindow",
            Self::PostClusterHealthCheck => "PostClusterHealthCheck",
            Self::PostUpgradeProcedures => "PostUpgradeProcedures",
            Self::SendCompletedNotification => "CompletedNotificationSent",
        }
    }

    pub fn from_condition_type(condition_type: &str) -> Option<Self> {
        OSD_STEPS
            .iter()
            .copied()
            .find(|step| step.as_str() == condition_type)
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const OSD_STEPS: &[StepName] = &[
    StepName::SendStartedNotification,
    StepName::UpgradeDelayedCheck,
    StepName::IsClusterUpgradable,
    StepName::PreHealthCheck,
    StepName::ExtDepAvailabilityCheck,
    StepName::ScaleUpExtraNodes,
    StepName::ControlPlaneMaintWindow,
    StepName::CommenceUpgrade,
    StepName::ControlPlaneUpgraded,
    StepName::RemoveControlPlaneMaintWindow,
    StepName::WorkersMaintWindow,
    StepName::AllWorkerNodesUpgraded,
    StepName::RemoveExtraScaledNodes,
    StepName::RemoveMaintWindow,
    StepName::PostClusterHealthCheck,
    StepName::PostUpgradeProcedures,
    StepName::SendCompletedNotification,
];

const ARO_STEPS: &[StepName] = &[
    StepName::SendStartedNotification,
    StepName::PreHealthCheck,
    StepName::ExtDepAvailabilityCheck,
    StepName::ScaleUpExtraNodes,
    StepName::ControlPlaneMaintWindow,
    StepName::CommenceUpgrade,
    StepName::ControlPlaneUpgraded,
    StepName::RemoveControlPlaneMaintWindow,
    StepName::WorkersMaintWindow,
    StepName::AllWorkerNodesUpgraded,
    StepName::RemoveExtraScaledNodes,
    StepName::RemoveMaintWindow,
    StepName::PostClusterHealthCheck,
    StepName::SendCompletedNotification,
];

/// Ordered steps for an upgrade flavor.
pub const fn catalogue(upgrade_type: UpgradeType) -> &'static [StepName] {
    match upgrade_type {
        UpgradeType::Osd => OSD_STEPS,
        UpgradeType::Aro => ARO_STEPS,
    }
}

/// Per-flavor policy knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariantPolicy {
    /// Abandon upgrades not commenced within the upgrade window.
    pub expiry: bool,
    /// Probe external dependencies before commencing.
    pub availability_checks: bool,
}

impl VariantPolicy {
    pub const fn for_type(upgrade_type: UpgradeType) -> Self {
        match upgrade_type {
            UpgradeType::Osd => Self {
                expiry: true,
                availability_checks: true,
            },
            UpgradeType::Aro => Self {
                expiry: false,
                availability_checks: false,
            },
        }
    }
}

/// Cluster-facing collaborators of the upgrader.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster_version: Arc<dyn ClusterVersionClient>,
    pub maintenance: Arc<dyn Maintenance>,
    pub scaler: Arc<dyn Scaler>,
    pub machinery: Arc<dyn Machinery>,
    pub pdb: Arc<dyn PdbAnalyzer>,
    pub metrics_query: Arc<dyn MetricsQuery>,
    pub availability: Vec<Arc<dyn AvailabilityChecker>>,
    pub file_integrity: Arc<dyn FileIntegrity>,
}

/// Runs the step catalogue of one upgrade flavor.
pub struct ClusterUpgrader {
    cluster: Collaborators,
    config: Arc<OperatorConfig>,
    metrics: Arc<dyn MetricsSink>,
    events: EventManager,
    recorder: Arc<dyn EventPublisher>,
    upgrade_type: UpgradeType,
    policy: VariantPolicy,
}

impl ClusterUpgrader {
    pub fn new(
        cluster: Collaborators,
        config: Arc<OperatorConfig>,
        metrics: Arc<dyn MetricsSink>,
        events: EventManager,
        recorder: Arc<dyn EventPublisher>,
        upgrade_type: UpgradeType,
    ) -> Self {
        Self {
            cluster,
            config,
            metrics,
            events,
            recorder,
            upgrade_type,
            policy: VariantPolicy::for_type(upgrade_type),
        }
    }

    /// Drive the upgrade one pass forward and return the resulting phase.
    ///
    /// `history` is the entry of the desired version. Conditions and worker
    /// timestamps are written to it even when an error is returned, so the
    /// caller persists it either way.
    pub async fn upgrade_cluster(
        &self,
        uc: &UpgradeConfig,
        history: &mut UpgradeHistory,
        span: &Span,
        now: DateTime<Utc>,
    ) -> Result<UpgradePhase> {
        if self.policy.expiry {
            let cv = self.cluster.cluster_version.get().await?;
            let commenced = has_upgrade_commenced(&cv, uc)?;
            if should_fail_upgrade(
                history.start_time,
                self.config.upgrade_window_timeout(),
                commenced,
                now,
            ) {
                info!(parent: span, "Upgrade did not commence within the upgrade window");
                return Ok(self.perform_upgrade_failure(uc, history, now).await);
            }
        }

        let steps: Vec<Box<dyn UpgradeStep + '_>> = catalogue(self.upgrade_type)
            .iter()
            .map(|&name| {
                Box::new(Step {
                    name,
                    upgrader: self,
                    uc,
                    now,
                }) as Box<dyn UpgradeStep + '_>
            })
            .collect();
        let outcome = run_steps(&steps, history, span, now).await?;
        info!(parent: span, outcome = %outcome, "Upgrade pass finished");
        Ok(outcome.phase())
    }

    /// Health gate the phase machine evaluates before committing to
    /// `Upgrading`, so a blocked start sends no notification.
    ///
    /// A held start leaves the `PreHealthCheck` condition incomplete on
    /// `history`.
    pub async fn ready_to_start(
        &self,
        uc: &UpgradeConfig,
        history: &mut UpgradeHistory,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let step = StepName::PreHealthCheck.as_str();
        let ready = self.pre_health_check(uc, history).await?;
        if !ready {
            set_condition_start(history, step, now);
            set_condition_in_progress(history, step, &format!("{step} still in progress"), now);
        }
        Ok(ready)
    }

    /// Record a phase transition as a `Normal` event on the reconciled object.
    pub async fn record_transition(&self, reason: &str, message: &str) {
        self.recorder.publish(reason, message).await;
    }

    /// The upgrade window passed while the health gate held the start.
    ///
    /// Flags the breach, and under the expiry policy abandons the attempt.
    /// Nothing was announced yet, so the failure is a warning event rather
    /// than a notification. Returns whether the attempt was abandoned.
    pub async fn abandon_held_start(
        &self,
        uc: &UpgradeConfig,
        history: &mut UpgradeHistory,
        now: DateTime<Utc>,
    ) -> bool {
        let name = uc.name_or_unknown();
        if !self.policy.expiry {
            self.metrics.update_window_breached(name, true);
            return false;
        }
        self.metrics.reset_failure_metrics();
        self.metrics.update_window_breached(name, true);
        set_failed_upgrade_condition(history, None, now);
        self.recorder
            .publish_warning(
                "UpgradeFailed",
                &failure_description(uc.desired_version(), Some(history)),
            )
            .await;
        true
    }

    /// Abandon an upgrade that never commenced.
    ///
    /// Extra capacity is removed and the failure is notified before the phase
    /// moves to `Failed`. When either fails the phase stays as it was and the
    /// `FailedUpgrade` condition carries the error.
    async fn perform_upgrade_failure(
        &self,
        uc: &UpgradeConfig,
        history: &mut UpgradeHistory,
        now: DateTime<Utc>,
    ) -> UpgradePhase {
        let name = uc.name_or_unknown();

        if let Err(e) = self
            .cluster
            .scaler
            .ensure_scale_down_nodes(self.config.node_drain_timeout(), now)
            .await
        {
            error!(upgradeconfig = name, error = %e, "Failed to scale down the temporary upgrade machine when upgrade failed");
            set_failed_upgrade_condition(history, Some(&format!("{e:#}")), now);
            return history.phase;
        }

        if let Err(e) = self.events.notify(uc, Some(history), NotifyState::Failed).await {
            error!(upgradeconfig = name, error = %e, "Failed to notify of upgrade failure");
            set_failed_upgrade_condition(history, Some(&format!("{e:#}")), now);
            return history.phase;
        }

        self.metrics.update_window_breached(name, true);
        self.metrics.reset_failure_metrics();
        set_failed_upgrade_condition(history, None, now);
        self.recorder
            .publish_warning(
                "UpgradeFailed",
                &failure_description(uc.desired_version(), Some(history)),
            )
            .await;
        UpgradePhase::Failed
    }

    async fn commenced(&self, uc: &UpgradeConfig) -> Result<bool> {
        let cv = self.cluster.cluster_version.get().await?;
        Ok(has_upgrade_commenced(&cv, uc)?)
    }

    fn health_checks<'a>(&'a self, uc: &'a UpgradeConfig, history: &'a UpgradeHistory) -> HealthChecks<'a> {
        HealthChecks {
            metrics_query: self.cluster.metrics_query.as_ref(),
            cluster_version: self.cluster.cluster_version.as_ref(),
            machinery: self.cluster.machinery.as_ref(),
            scaler: self.cluster.scaler.as_ref(),
            pdb: self.cluster.pdb.as_ref(),
            config: &self.config,
            reporter: HealthReporter {
                metrics: self.metrics.as_ref(),
                name: uc.name_or_unknown(),
                version: health_version_label(uc, history),
                state: history.phase.as_str(),
            },
        }
    }

    async fn run_step(
        &self,
        step: StepName,
        uc: &UpgradeConfig,
        history: &mut UpgradeHistory,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match step {
            StepName::SendStartedNotification => self.send_started_notification(uc, history).await,
            StepName::UpgradeDelayedCheck => self.upgrade_delayed_check(uc, history, now).await,
            StepName::IsClusterUpgradable => self.is_cluster_upgradable(uc).await,
            StepName::PreHealthCheck => self.pre_health_check(uc, history).await,
            StepName::ExtDepAvailabilityCheck => self.ext_dep_availability_check(uc).await,
            StepName::ScaleUpExtraNodes => self.scale_up_extra_nodes(uc, now).await,
            StepName::ControlPlaneMaintWindow => self.control_plane_maint_window(uc, now).await,
            StepName::CommenceUpgrade => self.commence_upgrade(uc).await,
            StepName::ControlPlaneUpgraded => self.control_plane_upgraded(uc, now).await,
            StepName::RemoveControlPlaneMaintWindow => {
                self.cluster.maintenance.end_control_plane().await?;
                Ok(true)
            }
            StepName::WorkersMaintWindow => self.workers_maint_window(uc, history, now).await,
            StepName::AllWorkerNodesUpgraded => self.all_worker_nodes_upgraded(uc, history, now).await,
            StepName::RemoveExtraScaledNodes => self.remove_extra_scaled_nodes(uc, now).await,
            StepName::RemoveMaintWindow => {
                self.cluster.maintenance.end_worker().await?;
                Ok(true)
            }
            StepName::PostClusterHealthCheck => {
                let report = post_upgrade_health_check(&self.health_checks(uc, history)).await?;
                Ok(report.passed())
            }
            StepName::PostUpgradeProcedures => self.post_upgrade_procedures().await,
            StepName::SendCompletedNotification => {
                self.events
                    .notify(uc, Some(history), NotifyState::Completed)
                    .await?;
                Ok(true)
            }
        }
    }

    async fn send_started_notification(&self, uc: &UpgradeConfig, history: &UpgradeHistory) -> Result<bool> {
        if self.commenced(uc).await? {
            return Ok(true);
        }
        self.events.notify(uc, Some(history), NotifyState::Started).await?;
        Ok(true)
    }

    /// Never blocks: raises the delay notice and moves on.
    async fn upgrade_delayed_check(
        &self,
        uc: &UpgradeConfig,
        history: &UpgradeHistory,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.commenced(uc).await? {
            return Ok(true);
        }
        if delay_check(history.start_time, self.config.delay_trigger(), false, now) {
            self.events.notify(uc, Some(history), NotifyState::Delayed).await?;
        }
        Ok(true)
    }

    async fn is_cluster_upgradable(&self, uc: &UpgradeConfig) -> Result<bool> {
        let cv = self.cluster.cluster_version.get().await?;
        if has_upgrade_commenced(&cv, uc)? || uc.desired_version().is_empty() {
            return Ok(true);
        }
        let upgradeable = is_upgradeable(&cv, uc.desired_version())?;
        if !upgradeable {
            info!(
                upgradeconfig = uc.name_or_unknown(),
                version = uc.desired_version(),
                "Cluster reports Upgradeable=False, minor version upgrade is held"
            );
        }
        Ok(upgradeable)
    }

    async fn pre_health_check(&self, uc: &UpgradeConfig, history: &UpgradeHistory) -> Result<bool> {
        let commenced = self.commenced(uc).await?;
        if commenced {
            info!("Skipping upgrade step {}", StepName::PreHealthCheck);
        }
        let report = pre_upgrade_health_check(
            &self.health_checks(uc, history),
            commenced,
            uc.spec.capacity_reservation,
        )
        .await?;
        if !report.passed() {
            self.recorder
                .publish_warning("PreHealthCheckFailed", &report.failures.join(","))
                .await;
        }
        Ok(report.passed())
    }

    async fn ext_dep_availability_check(&self, uc: &UpgradeConfig) -> Result<bool> {
        if !self.policy.availability_checks {
            return Ok(true);
        }
        if self.commenced(uc).await? {
            info!("Skipping upgrade step {}", StepName::ExtDepAvailabilityCheck);
            return Ok(true);
        }
        if self.cluster.availability.is_empty() {
            info!("No external dependencies configured for availability checks. Skipping.");
            return Ok(true);
        }
        for checker in &self.cluster.availability {
            checker.available().await?;
        }
        Ok(true)
    }

    async fn scale_up_extra_nodes(&self, uc: &UpgradeConfig, now: DateTime<Utc>) -> Result<bool> {
        if !uc.spec.capacity_reservation {
            info!("Do not need to scale up extra node(s) since the capacity reservation is disabled");
            return Ok(true);
        }
        if self.commenced(uc).await? {
            info!("Skipping upgrade step {}", StepName::ScaleUpExtraNodes);
            return Ok(true);
        }
        if !self.cluster.scaler.can_scale().await? {
            return Ok(true);
        }

        let name = uc.name_or_unknown();
        match self
            .cluster
            .scaler
            .ensure_scale_up_nodes(self.config.scale_duration(), now)
            .await
        {
            Ok(scaled) => {
                if scaled {
                    self.metrics.update_scaling(name, false);
                }
                Ok(scaled)
            }
            Err(e) => match e.downcast_ref::<MuoError>() {
                Some(MuoError::ScaleTimeout(detail)) => {
                    warn!(upgradeconfig = name, detail = detail.as_str(), "Extra capacity not ready in time, continuing without it");
                    self.metrics.update_scaling(name, true);
                    self.recorder
                        .publish_warning(
                            "ScaleSkipped",
                            &format!("Extra worker capacity was not ready in time: {detail}"),
                        )
                        .await;
                    Ok(true)
                }
                _ => Err(e),
            },
        }
    }

    async fn control_plane_maint_window(&self, uc: &UpgradeConfig, now: DateTime<Utc>) -> Result<bool> {
        let ends_at = now + self.config.control_plane_duration();
        self.cluster
            .maintenance
            .start_control_plane(
                ends_at,
                uc.desired_version(),
                &self.config.maintenance.ignored_alerts.control_plane_criticals,
            )
            .await?;
        Ok(true)
    }

    async fn commence_upgrade(&self, uc: &UpgradeConfig) -> Result<bool> {
        self.metrics.update_window_breached(uc.name_or_unknown(), false);
        let commenced = commence(self.cluster.cluster_version.as_ref(), uc).await?;
        if !commenced {
            info!("clusterversion has not been updated to desired version, will retry on next reconcile");
        }
        Ok(commenced)
    }

    async fn control_plane_upgraded(&self, uc: &UpgradeConfig, now: DateTime<Utc>) -> Result<bool> {
        let name = uc.name_or_unknown();
        let version = uc.desired_version();
        let cv = self.cluster.cluster_version.get().await?;
        if has_upgrade_completed(&cv, version) {
            self.metrics.update_control_plane_timeout(name, version, false);
            return Ok(true);
        }
        let start = control_plane_start(&cv, uc)?;
        if control_plane_timeout(start, self.config.control_plane_duration(), now) {
            info!(upgradeconfig = name, "Control plane upgrade timeout");
            self.metrics.update_control_plane_timeout(name, version, true);
        }
        Ok(false)
    }

    async fn workers_maint_window(
        &self,
        uc: &UpgradeConfig,
        history: &mut UpgradeHistory,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = self.cluster.machinery.is_upgrading(WORKER_POOL).await?;
        let Some(ends_at) =
            worker_maintenance_window(&result, uc.spec.pdb_force_drain_timeout, &self.config, now)
        else {
            info!(
                "Worker nodes are already upgraded. Skipping worker maintenance for {}",
                uc.desired_version()
            );
            return Ok(true);
        };
        history.worker_start_time.get_or_insert(now);
        info!(
            "Creating worker node maintenance for {} remaining nodes if no previous silence, ending at {}",
            result.pending(),
            ends_at
        );
        self.cluster
            .maintenance
            .set_worker(ends_at, uc.desired_version(), result.pending())
            .await?;
        Ok(true)
    }

    async fn all_worker_nodes_upgraded(
        &self,
        uc: &UpgradeConfig,
        history: &mut UpgradeHistory,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let name = uc.name_or_unknown();
        let version = uc.desired_version();
        let result = self.cluster.machinery.is_upgrading(WORKER_POOL).await?;
        let silence_active = self.cluster.maintenance.is_active().await?;

        match worker_timeout(&result, silence_active) {
            WorkerProgress::InProgress { timed_out } => {
                info!(
                    "not all workers are upgraded, upgraded: {}, total: {}",
                    result.updated_count, result.machine_count
                );
                if timed_out {
                    info!(upgradeconfig = name, "Worker upgrade timeout.");
                }
                self.metrics.update_worker_timeout(name, version, timed_out);
                Ok(false)
            }
            WorkerProgress::Completed => {
                self.metrics.update_worker_timeout(name, version, false);
                history.worker_complete_time.get_or_insert(now);
                Ok(true)
            }
        }
    }

    async fn remove_extra_scaled_nodes(&self, uc: &UpgradeConfig, now: DateTime<Utc>) -> Result<bool> {
        if !uc.spec.capacity_reservation {
            info!("Do not need to remove nodes since the capacity reservation is disabled");
            return Ok(true);
        }
        if !self.cluster.scaler.can_scale().await? {
            return Ok(true);
        }

        let name = uc.name_or_unknown();
        match self
            .cluster
            .scaler
            .ensure_scale_down_nodes(self.config.node_drain_timeout(), now)
            .await
        {
            Ok(scaled_down) => {
                if scaled_down {
                    self.metrics.update_node_drain_failed(name, false);
                }
                Ok(scaled_down)
            }
            Err(e) => {
                if matches!(e.downcast_ref::<MuoError>(), Some(MuoError::DrainTimeout(_))) {
                    self.metrics.update_node_drain_failed(name, true);
                }
                error!(upgradeconfig = name, error = %e, "Extra upgrade node failed to drain in time");
                Err(e)
            }
        }
    }

    async fn post_upgrade_procedures(&self) -> Result<bool> {
        if !self.config.environment.fedramp {
            info!("Non-FedRAMP environment, skipping file integrity re-initialisation");
            return Ok(true);
        }
        self.cluster.file_integrity.reinit().await?;
        Ok(true)
    }
}

/// Version label of health metrics: the version being left while the
/// upgrade is underway, the desired one once it landed.
fn health_version_label<'a>(uc: &'a UpgradeConfig, history: &'a UpgradeHistory) -> &'a str {
    match history.phase {
        UpgradePhase::Upgraded => uc.desired_version(),
        UpgradePhase::Unknown => "unknown",
        _ => &history.preceding_version,
    }
}

/// Binds one catalogue entry to the upgrader for a single pass.
struct Step<'a> {
    name: StepName,
    upgrader: &'a ClusterUpgrader,
    uc: &'a UpgradeConfig,
    now: DateTime<Utc>,
}

#[async_trait]
impl<'a> UpgradeStep for Step<'a> {
    fn name(&self) -> String {
        self.name.as_str().to_string()
    }

    async fn run(&self, history: &mut UpgradeHistory) -> Result<bool> {
        self.upgrader
            .run_step(self.name, self.uc, history, self.now)
            .await
    }
}
