//! UpgradeConfig controller: the phase state machine and its kube wiring.
//!
//! [`Reconciler::reconcile_upgrade`] holds the phase logic and never talks to
//! the API server itself. The kube-facing [`reconcile`] persists the status
//! it returns, then surfaces any error to the controller runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::Api;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use semver::Version;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::cluster::{UpdateGraph, current_version, has_upgrade_commenced};
use crate::config::OperatorConfig;
use crate::crd::{UpgradeConfig, UpgradeConfigStatus, UpgradeHistory, UpgradePhase};
use crate::error::MuoError;
use crate::events::EventManager;
use crate::monitoring::MetricsQuery;
use crate::monitoring::prometheus::alerts_from_upgrade;
use crate::policy::{PolicyRefresher, UPGRADE_CONFIG_NAME};
use crate::scheduler::is_ready_to_upgrade;
use crate::status::{
    self, EventPublisher, EventRecorder, advance_phase, history_for, history_for_mut, phase_for,
    upsert_history,
};
use crate::telemetry::metrics::{Metrics, MetricsSink};
use crate::upgrader::{ClusterUpgrader, Collaborators};
use crate::validation::validate_upgrade_config;

/// Resync period when nothing more specific is due.
pub const SYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Retry interval while an upgrade is running or held by a health gate.
pub const UPGRADING_REQUEUE: Duration = Duration::from_secs(60);

/// Result of one pass of the phase machine.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Status to persist, `None` when nothing changed.
    pub status: Option<UpgradeConfigStatus>,
    /// Requeue delay, `None` to wait for the next change.
    pub requeue: Option<Duration>,
    pub error: Option<MuoError>,
}

impl ReconcileOutcome {
    fn done(status: Option<UpgradeConfigStatus>, requeue: Option<Duration>) -> Self {
        Self {
            status,
            requeue,
            error: None,
        }
    }

    fn failed(status: Option<UpgradeConfigStatus>, error: impl Into<MuoError>) -> Self {
        Self {
            status,
            requeue: None,
            error: Some(error.into()),
        }
    }
}

/// Everything the phase machine needs apart from the API server.
pub struct Reconciler {
    pub collaborators: Collaborators,
    pub config: Arc<OperatorConfig>,
    pub metrics: Arc<dyn MetricsSink>,
    pub events: EventManager,
    pub update_graph: Option<Arc<dyn UpdateGraph>>,
    pub policy: Arc<dyn PolicyRefresher>,
}

impl Reconciler {
    fn upgrader(&self, uc: &UpgradeConfig, recorder: Arc<dyn EventPublisher>) -> ClusterUpgrader {
        ClusterUpgrader::new(
            self.collaborators.clone(),
            self.config.clone(),
            self.metrics.clone(),
            self.events.clone(),
            recorder,
            uc.spec.upgrade_type,
        )
    }

    /// Drive `uc` one step through the phase machine.
    pub async fn reconcile_upgrade(
        &self,
        uc: &UpgradeConfig,
        recorder: Arc<dyn EventPublisher>,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let name = uc.name_or_unknown();
        let version = uc.desired_version();
        let span = info_span!("reconcile", upgradeconfig = name, version = version);

        let cv = match self
            .collaborators
            .cluster_version
            .get()
            .instrument(span.clone())
            .await
        {
            Ok(cv) => cv,
            Err(e) => return ReconcileOutcome::failed(None, MuoError::from_anyhow(e)),
        };

        let mut status = uc.status.clone().unwrap_or_default();
        let mut dirty = false;
        if history_for(&status, version).is_none() {
            let commenced = match has_upgrade_commenced(&cv, uc) {
                Ok(commenced) => commenced,
                Err(e) => return ReconcileOutcome::failed(None, e),
            };
            let mut history = if commenced {
                // Already moving at the platform level: the real start time is unknown.
                let mut history = UpgradeHistory::new(version, UpgradePhase::Upgrading);
                history.start_time = Some(now);
                history
            } else {
                UpgradeHistory::new(version, UpgradePhase::New)
            };
            history.preceding_version = current_version(&cv).unwrap_or_default().to_string();
            info!(parent: &span, phase = %history.phase, "Recording new upgrade history");
            upsert_history(&mut status, history);
            dirty = true;
        }

        let phase = phase_for(&status, version);
        info!(parent: &span, phase = %phase, "Current cluster status");
        let upgrader = self.upgrader(uc, recorder);

        match phase {
            UpgradePhase::New | UpgradePhase::Pending => {
                self.schedule(uc, &cv, status, dirty, &upgrader, &span, now).await
            }
            UpgradePhase::Upgrading => {
                info!(parent: &span, "Cluster detected as already upgrading");
                self.run_upgrade(uc, status, &upgrader, &span, now).await
            }
            UpgradePhase::Upgraded => {
                info!(parent: &span, "Cluster is already upgraded");
                let status_out = dirty.then(|| status.clone());
                let Some(history) = history_for(&status, version) else {
                    return ReconcileOutcome::done(status_out, None);
                };
                match report_upgrade_metrics(
                    self.collaborators.metrics_query.as_ref(),
                    self.metrics.as_ref(),
                    name,
                    history,
                    now,
                )
                .await
                {
                    Ok(()) => ReconcileOutcome::done(status_out, None),
                    Err(e) => ReconcileOutcome::failed(status_out, MuoError::from_anyhow(e)),
                }
            }
            UpgradePhase::Failed => {
                info!(parent: &span, "Cluster has failed to upgrade");
                ReconcileOutcome::done(dirty.then_some(status), None)
            }
            UpgradePhase::Unknown => {
                warn!(parent: &span, "Unknown upgrade phase");
                ReconcileOutcome::done(dirty.then_some(status), None)
            }
        }
    }

    /// `New`/`Pending`: validate, wait for the schedule, then start.
    #[allow(clippy::too_many_arguments)]
    async fn schedule(
        &self,
        uc: &UpgradeConfig,
        cv: &crate::cluster::ClusterVersionState,
        mut status: UpgradeConfigStatus,
        dirty: bool,
        upgrader: &ClusterUpgrader,
        span: &Span,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let name = uc.name_or_unknown();
        let version = uc.desired_version();
        info!(parent: span, "Validating UpgradeConfig");

        let graph = self
            .update_graph
            .as_deref()
            .filter(|_| self.config.validation.cincinnati);
        let result = match validate_upgrade_config(uc, cv, graph).instrument(span.clone()).await {
            Ok(result) => result,
            Err(e) => {
                self.metrics.update_validation(name, true);
                return ReconcileOutcome::failed(dirty.then_some(status), MuoError::from_anyhow(e));
            }
        };
        if !result.is_valid {
            info!(parent: span, message = result.message.as_str(), "UpgradeConfig failed validation");
            self.metrics.update_validation(name, true);
            return ReconcileOutcome::done(dirty.then_some(status), None);
        }
        self.metrics.update_validation(name, false);
        if !result.is_available_update {
            info!(parent: span, message = result.message.as_str(), "Desired version is not an available update");
            return ReconcileOutcome::done(dirty.then_some(status), None);
        }

        let scheduled = is_ready_to_upgrade(uc, self.config.upgrade_window_timeout(), now);
        let Some(history) = history_for_mut(&mut status, version) else {
            return ReconcileOutcome::failed(None, MuoError::Reconcile(format!("no history for {version}")));
        };

        if !scheduled.is_ready {
            advance_phase(history, UpgradePhase::Pending);
            let requeue = scheduled
                .time_until_upgrade
                .to_std()
                .ok()
                .filter(|d| !d.is_zero())
                .map_or(SYNC_PERIOD, |d| d.min(SYNC_PERIOD));
            return ReconcileOutcome::done(Some(status), Some(requeue));
        }
        if scheduled.is_breached {
            warn!(parent: span, "Upgrade window has already passed");
        }

        match self.policy.refresh().instrument(span.clone()).await {
            Ok(true) => {
                info!(parent: span, "The cluster's upgrade policy has changed, so the operator will re-reconcile");
                return ReconcileOutcome::done(None, None);
            }
            Ok(false) => {}
            Err(e) => match e.downcast::<MuoError>() {
                Ok(MuoError::PolicyNotConfigured) => {
                    info!(parent: span, "No upgrade policy source configured, kill-switch ignored");
                }
                Ok(e) => return ReconcileOutcome::failed(dirty.then_some(status), e),
                Err(e) => return ReconcileOutcome::failed(dirty.then_some(status), MuoError::from_anyhow(e)),
            },
        }

        match upgrader.ready_to_start(uc, history, now).instrument(span.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                advance_phase(history, UpgradePhase::Pending);
                if scheduled.is_breached && upgrader.abandon_held_start(uc, history, now).await {
                    warn!(parent: span, "Health checks held the upgrade past its window, abandoning it");
                    advance_phase(history, UpgradePhase::Failed);
                    return ReconcileOutcome::done(Some(status), None);
                }
                info!(parent: span, "Pre-upgrade health check failed, holding the upgrade");
                return ReconcileOutcome::done(Some(status), Some(UPGRADING_REQUEUE));
            }
            Err(e) => {
                advance_phase(history, UpgradePhase::Pending);
                return ReconcileOutcome::failed(Some(status), MuoError::from_anyhow(e));
            }
        }

        advance_phase(history, UpgradePhase::Upgrading);
        history.start_time = Some(now);
        info!(parent: span, upgrade_type = %uc.spec.upgrade_type, "Cluster is commencing upgrade");
        upgrader
            .record_transition(
                "UpgradeStarted",
                &format!("Cluster upgrade to version {version} has started"),
            )
            .await;
        self.run_upgrade(uc, status, upgrader, span, now).await
    }

    /// `Upgrading`: one pass of the step engine, short requeue.
    async fn run_upgrade(
        &self,
        uc: &UpgradeConfig,
        mut status: UpgradeConfigStatus,
        upgrader: &ClusterUpgrader,
        span: &Span,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let version = uc.desired_version();
        let Some(history) = history_for_mut(&mut status, version) else {
            return ReconcileOutcome::failed(None, MuoError::Reconcile(format!("no history for {version}")));
        };

        let error = match upgrader.upgrade_cluster(uc, history, span, now).await {
            Ok(phase) => {
                let was_upgraded = history.phase == UpgradePhase::Upgraded;
                advance_phase(history, phase);
                if history.phase == UpgradePhase::Upgraded && !was_upgraded {
                    history.complete_time.get_or_insert(now);
                    upgrader
                        .record_transition(
                            "UpgradeCompleted",
                            &format!("Cluster upgrade to version {version} has completed"),
                        )
                        .await;
                }
                None
            }
            Err(e) => {
                error!(parent: span, error = %e, "Upgrade pass failed");
                Some(MuoError::from_anyhow(e))
            }
        };
        ReconcileOutcome {
            status: Some(status),
            requeue: Some(UPGRADING_REQUEUE),
            error,
        }
    }
}

/// Version stream of an upgrade: `y` for a major or minor bump, `z` for a
/// patch. Unparseable versions count as `y`.
pub fn version_stream(from: &str, to: &str) -> &'static str {
    match (Version::parse(from), Version::parse(to)) {
        (Ok(from), Ok(to)) if from.major == to.major && from.minor == to.minor => "z",
        _ => "y",
    }
}

/// Record the upgrade result: paging alerts fired during the upgrade and
/// the version stream.
pub async fn report_upgrade_metrics(
    query: &dyn MetricsQuery,
    sink: &dyn MetricsSink,
    name: &str,
    history: &UpgradeHistory,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let (Some(start), Some(end)) = (history.start_time, history.complete_time) else {
        debug!(upgradeconfig = name, "Upgrade has no start or completion time, skipping result metric");
        return Ok(());
    };
    let alerts = alerts_from_upgrade(query, start, end, now)
        .await
        .map_err(|e| MuoError::MetricsQuery(format!("unable to query upgrade alerts: {e:#}")))?;
    let stream = version_stream(&history.preceding_version, &history.version);
    sink.update_upgrade_result(name, &history.version, stream, &alerts);
    Ok(())
}

/// Shared context for the controller.
pub struct Context {
    pub client: kube::Client,
    pub reconciler: Reconciler,
    pub metrics: Arc<Metrics>,
}

/// Reconcile an UpgradeConfig resource.
pub async fn reconcile(obj: Arc<UpgradeConfig>, ctx: Arc<Context>) -> Result<Action, MuoError> {
    let name = obj.name_or_unknown();
    if name != UPGRADE_CONFIG_NAME {
        debug!(upgradeconfig = name, "Ignoring unmanaged UpgradeConfig");
        return Ok(Action::await_change());
    }

    let started = Instant::now();
    let namespace = obj.namespace().unwrap_or_default();
    let api: Api<UpgradeConfig> = Api::namespaced(ctx.client.clone(), &namespace);
    let recorder: Arc<dyn EventPublisher> = Arc::new(EventRecorder::new(ctx.client.clone(), &obj));

    info!("Reconciling {}", name);
    let outcome = ctx.reconciler.reconcile_upgrade(&obj, recorder, Utc::now()).await;

    let mut result = match outcome.error {
        Some(e) => Err(e),
        None => Ok(outcome.requeue.map_or_else(Action::await_change, Action::requeue)),
    };
    if let Some(new_status) = &outcome.status
        && let Err(e) = status::patch_status(&api, &obj, new_status).await
    {
        warn!("Failed to patch status for {}: {}", name, e);
        if result.is_ok() {
            result = Err(MuoError::from_anyhow(e));
        }
    }

    let label = if result.is_ok() { "success" } else { "error" };
    ctx.metrics
        .record_reconcile(name, label, started.elapsed().as_secs_f64());
    result
}

/// Error policy for the controller.
pub fn error_policy(obj: Arc<UpgradeConfig>, err: &MuoError, _ctx: Arc<Context>) -> Action {
    let name = obj.name_or_unknown();
    if err.is_transient() {
        warn!("Transient error for {}, will retry: {}", name, err);
        return Action::requeue(Duration::from_secs(30));
    }
    error!("Controller error for {}: {}", name, err);
    Action::requeue(SYNC_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::upgrade_config;
    use crate::cluster::{COMPLETED_UPDATE, Release, VersionHistoryEntry};
    use crate::health::tests::FakeAlerts;
    use crate::notify::NotifyState;
    use crate::status::fake::RecordingEvents;
    use crate::upgrader::tests::{FakeDependency, FakePlatform, Harness};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    #[derive(Clone, Copy)]
    enum PolicyAnswer {
        Unchanged,
        Changed,
        NotConfigured,
    }

    struct FixedPolicy(PolicyAnswer);

    #[async_trait]
    impl PolicyRefresher for FixedPolicy {
        async fn refresh(&self) -> anyhow::Result<bool> {
            match self.0 {
                PolicyAnswer::Unchanged => Ok(false),
                PolicyAnswer::Changed => Ok(true),
                PolicyAnswer::NotConfigured => Err(MuoError::PolicyNotConfigured.into()),
            }
        }
    }

    /// Cluster on 4.15.1 offering 4.15.3 in its channel.
    fn on_4_15_1(platform: FakePlatform) -> FakePlatform {
        {
            let mut cv = platform.cv.lock().unwrap();
            cv.channel = "stable-4.15".to_string();
            cv.history.push(VersionHistoryEntry {
                state: COMPLETED_UPDATE.to_string(),
                version: "4.15.1".to_string(),
                image: String::new(),
                started_time: Some(Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap()),
                completion_time: Some(Utc.with_ymd_and_hms(2026, 9, 1, 9, 0, 0).unwrap()),
            });
            cv.available_updates.push(Release {
                version: "4.15.3".to_string(),
                image: String::new(),
            });
        }
        platform
    }

    fn reconciler(harness: &Harness, answer: PolicyAnswer) -> Reconciler {
        Reconciler {
            collaborators: harness.collaborators(),
            config: Arc::new(harness.config.clone()),
            metrics: harness.metrics.clone(),
            events: harness.event_manager(),
            update_graph: None,
            policy: Arc::new(FixedPolicy(answer)),
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, hour, minute, 0).unwrap()
    }

    fn phase(outcome: &ReconcileOutcome) -> UpgradePhase {
        phase_for(outcome.status.as_ref().unwrap(), "4.15.3")
    }

    #[tokio::test]
    async fn test_happy_path() {
        let harness = Harness::new(on_4_15_1(FakePlatform::landing()));
        let reconciler = reconciler(&harness, PolicyAnswer::Unchanged);
        let events: Arc<RecordingEvents> = harness.events.clone();
        let mut uc = upgrade_config("4.15.3", "stable-4.15", "");

        // One hour before upgradeAt.
        let outcome = reconciler.reconcile_upgrade(&uc, events.clone(), at(9, 0)).await;
        assert!(outcome.error.is_none());
        assert_eq!(phase(&outcome), UpgradePhase::Pending);
        assert_eq!(outcome.requeue, Some(SYNC_PERIOD));
        assert!(harness.metrics.has("validation:false"));
        uc.status = outcome.status;

        // Three minutes before upgradeAt the requeue tightens.
        let outcome = reconciler.reconcile_upgrade(&uc, events.clone(), at(9, 57)).await;
        assert_eq!(outcome.requeue, Some(Duration::from_secs(180)));
        uc.status = outcome.status;

        let outcome = reconciler.reconcile_upgrade(&uc, events.clone(), at(10, 5)).await;
        assert!(outcome.error.is_none());
        assert_eq!(phase(&outcome), UpgradePhase::Upgraded);
        assert_eq!(outcome.requeue, Some(UPGRADING_REQUEUE));
        let history = history_for(outcome.status.as_ref().unwrap(), "4.15.3").unwrap();
        assert_eq!(history.start_time, Some(at(10, 5)));
        assert_eq!(history.complete_time, Some(at(10, 5)));
        assert_eq!(history.preceding_version, "4.15.1");
        assert_eq!(
            harness.sink.states(),
            vec![NotifyState::Started, NotifyState::Completed]
        );
        assert_eq!(harness.events.reasons(), vec!["UpgradeStarted", "UpgradeCompleted"]);
        uc.status = outcome.status;

        let outcome = reconciler.reconcile_upgrade(&uc, events, at(10, 6)).await;
        assert!(outcome.error.is_none());
        assert!(outcome.status.is_none());
        assert_eq!(outcome.requeue, None);
        assert!(harness.metrics.has("result:4.15.3:z:"));
        assert_eq!(harness.platform.ensure_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_critical_alert_blocks_start() {
        let harness = Harness::new(on_4_15_1(FakePlatform::landing()))
            .with_alerts(FakeAlerts::firing(&["KubeAPIErrorBudgetBurn"]));
        let reconciler = reconciler(&harness, PolicyAnswer::Unchanged);
        let uc = upgrade_config("4.15.3", "stable-4.15", "");

        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(10, 5))
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(phase(&outcome), UpgradePhase::Pending);
        assert_eq!(outcome.requeue, Some(UPGRADING_REQUEUE));
        assert!(harness.metrics.has("health:CriticalAlertsFiring:true"));
        assert!(harness.sink.states().is_empty());
        assert_eq!(harness.platform.ensure_calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.events.reasons(), vec!["PreHealthCheckFailed"]);
    }

    #[tokio::test]
    async fn test_health_hold_past_window_abandons_osd_upgrade() {
        let harness = Harness::new(on_4_15_1(FakePlatform::landing()))
            .with_alerts(FakeAlerts::firing(&["etcdMembersDown"]));
        let reconciler = reconciler(&harness, PolicyAnswer::Unchanged);
        let mut uc = upgrade_config("4.15.3", "stable-4.15", "");

        // Held every half hour inside the 120 minute window.
        for minute in [5, 35] {
            let outcome = reconciler
                .reconcile_upgrade(&uc, harness.events.clone(), at(10, minute))
                .await;
            assert_eq!(phase(&outcome), UpgradePhase::Pending);
            uc.status = outcome.status;
        }
        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(11, 35))
            .await;
        assert_eq!(phase(&outcome), UpgradePhase::Pending);
        assert!(!harness.metrics.has("window_breached:true"));
        uc.status = outcome.status;

        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(12, 5))
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(phase(&outcome), UpgradePhase::Failed);
        assert_eq!(outcome.requeue, None);
        assert!(harness.metrics.has("window_breached:true"));
        assert!(harness.sink.states().is_empty());
        assert_eq!(harness.platform.ensure_calls.load(Ordering::SeqCst), 0);
        let history = history_for(outcome.status.as_ref().unwrap(), "4.15.3").unwrap();
        assert!(history.is_condition_true("FailedUpgrade"));
        assert!(!history.is_condition_true("PreHealthCheck"));
        let message = harness.events.message("UpgradeFailed").unwrap();
        assert!(message.contains("cancelled during the Pre-Health Check step"), "{message}");
        uc.status = outcome.status;

        // Failed is terminal.
        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(13, 0))
            .await;
        assert!(outcome.status.is_none());
        assert_eq!(outcome.requeue, None);
    }

    #[tokio::test]
    async fn test_health_hold_past_window_keeps_aro_pending() {
        let harness = Harness::new(on_4_15_1(FakePlatform::landing()))
            .with_alerts(FakeAlerts::firing(&["etcdMembersDown"]));
        let reconciler = reconciler(&harness, PolicyAnswer::Unchanged);
        let mut uc = upgrade_config("4.15.3", "stable-4.15", "");
        uc.spec.upgrade_type = crate::crd::UpgradeType::Aro;

        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(12, 5))
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(phase(&outcome), UpgradePhase::Pending);
        assert_eq!(outcome.requeue, Some(UPGRADING_REQUEUE));
        assert!(harness.metrics.has("window_breached:true"));
        assert!(!harness.events.reasons().contains(&"UpgradeFailed".to_string()));
    }

    #[tokio::test]
    async fn test_late_policy_change_aborts_pass() {
        let harness = Harness::new(on_4_15_1(FakePlatform::landing()));
        let reconciler = reconciler(&harness, PolicyAnswer::Changed);
        let mut uc = upgrade_config("4.15.3", "stable-4.15", "");
        let mut status = UpgradeConfigStatus::default();
        upsert_history(&mut status, UpgradeHistory::new("4.15.3", UpgradePhase::Pending));
        uc.status = Some(status);

        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(10, 5))
            .await;

        assert!(outcome.error.is_none());
        assert!(outcome.status.is_none());
        assert!(harness.sink.states().is_empty());
        assert_eq!(harness.platform.ensure_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_policy_is_ignored() {
        let harness = Harness::new(on_4_15_1(FakePlatform::landing()));
        let reconciler = reconciler(&harness, PolicyAnswer::NotConfigured);
        let uc = upgrade_config("4.15.3", "stable-4.15", "");

        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(10, 5))
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(phase(&outcome), UpgradePhase::Upgraded);
    }

    #[tokio::test]
    async fn test_invalid_config_records_validation_failure() {
        let harness = Harness::new(on_4_15_1(FakePlatform::landing()));
        let reconciler = reconciler(&harness, PolicyAnswer::Unchanged);
        let mut uc = upgrade_config("4.15.3", "stable-4.15", "");
        uc.spec.upgrade_at = "next tuesday".to_string();

        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(10, 5))
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(phase(&outcome), UpgradePhase::New);
        assert_eq!(outcome.requeue, None);
        assert!(harness.metrics.has("validation:true"));
    }

    #[tokio::test]
    async fn test_equal_version_is_not_an_available_update() {
        let harness = Harness::new(on_4_15_1(FakePlatform::landing()));
        let reconciler = reconciler(&harness, PolicyAnswer::Unchanged);
        let uc = upgrade_config("4.15.1", "stable-4.15", "");

        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(10, 5))
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(phase_for(outcome.status.as_ref().unwrap(), "4.15.1"), UpgradePhase::New);
        assert!(harness.metrics.has("validation:false"));
        assert!(harness.sink.states().is_empty());
    }

    #[tokio::test]
    async fn test_commenced_platform_backdates_history() {
        let harness = Harness::new(on_4_15_1(FakePlatform::commenced_to("4.15.3")));
        let reconciler = reconciler(&harness, PolicyAnswer::Unchanged);
        let uc = upgrade_config("4.15.3", "stable-4.15", "");

        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(11, 0))
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(phase(&outcome), UpgradePhase::Upgrading);
        let history = history_for(outcome.status.as_ref().unwrap(), "4.15.3").unwrap();
        assert_eq!(history.start_time, Some(at(11, 0)));
        assert!(history.is_condition_true("CommenceUpgrade"));
        assert_eq!(harness.platform.ensure_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_step_error_persists_status() {
        let mut harness = Harness::new(on_4_15_1(FakePlatform::landing()));
        harness.dependency = Arc::new(FakeDependency {
            down: true,
            ..FakeDependency::default()
        });
        let reconciler = reconciler(&harness, PolicyAnswer::Unchanged);
        let uc = upgrade_config("4.15.3", "stable-4.15", "");

        let outcome = reconciler
            .reconcile_upgrade(&uc, harness.events.clone(), at(10, 5))
            .await;

        let error = outcome.error.as_ref().unwrap();
        assert!(error.is_transient());
        assert_eq!(phase(&outcome), UpgradePhase::Upgrading);
        let history = history_for(outcome.status.as_ref().unwrap(), "4.15.3").unwrap();
        assert!(!history.is_condition_true("ExtDepAvailabilityCheck"));
        assert!(history.is_condition_true("PreHealthCheck"));
    }

    #[test]
    fn test_version_stream() {
        assert_eq!(version_stream("4.15.1", "4.15.3"), "z");
        assert_eq!(version_stream("4.14.9", "4.15.3"), "y");
        assert_eq!(version_stream("3.11.0", "4.11.0"), "y");
        assert_eq!(version_stream("", "4.15.3"), "y");
    }
}
