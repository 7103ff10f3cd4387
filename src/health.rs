//! Cluster health checks gating the start of an upgrade and validating its
//! landing state.
//!
//! Every check reports its own metric, keyed by upgrade config and check, so
//! the health history survives a check that fails to run. A negative result
//! is a value ([`CheckOutcome::Failed`]); an error means the check could not
//! be evaluated.

use anyhow::Result;
use tracing::{info, warn};

use crate::cluster::{
    ClusterVersionClient, Machinery, NodeState, PdbAnalyzer, PdbFinding, Scaler, degraded_operators,
};
use crate::config::{HealthCheckConfig, OperatorConfig, PRE_HEALTH_CHECK_FEATURE_GATE};
use crate::error::MuoError;
use crate::monitoring::MetricsQuery;
use crate::telemetry::metrics::MetricsSink;

/// Metric label identifying which check failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HealthCheckReason {
    MetricsQueryFailed,
    CriticalAlertsFiring,
    ClusterOperatorsDegraded,
    ClusterOperatorsStatusFailed,
    ManuallyCordonedNodes,
    NodeUnschedulableTaints,
    ClusterInvalidPDBConf,
    PDBQueryFailed,
    DefaultWorkerMachinepoolNotFound,
}

impl std::fmt::Display for HealthCheckReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MetricsQueryFailed => "MetricsQueryFailed",
            Self::CriticalAlertsFiring => "CriticalAlertsFiring",
            Self::ClusterOperatorsDegraded => "ClusterOperatorsDegraded",
            Self::ClusterOperatorsStatusFailed => "ClusterOperatorsStatusFailed",
            Self::ManuallyCordonedNodes => "ManuallyCordonedNodes",
            Self::NodeUnschedulableTaints => "NodeUnschedulableTaints",
            Self::ClusterInvalidPDBConf => "ClusterInvalidPDBConf",
            Self::PDBQueryFailed => "PDBQueryFailed",
            Self::DefaultWorkerMachinepoolNotFound => "DefaultWorkerMachinepoolNotFound",
        };
        write!(f, "{s}")
    }
}

/// Result of one check that ran to completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    Failed(String),
}

impl CheckOutcome {
    pub const fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Metric labels shared by every check of one evaluation.
pub struct HealthReporter<'a> {
    pub metrics: &'a dyn MetricsSink,
    pub name: &'a str,
    pub version: &'a str,
    pub state: &'a str,
}

impl HealthReporter<'_> {
    fn record(&self, reason: HealthCheckReason, failed: bool) {
        self.metrics
            .update_health_check(self.name, reason, self.version, self.state, failed);
    }

    fn fail(&self, reason: HealthCheckReason) {
        self.record(reason, true);
    }

    fn pass(&self, reason: HealthCheckReason) {
        self.record(reason, false);
    }
}

/// PromQL selecting firing critical alerts in platform namespaces, minus the
/// configured ignore lists.
pub fn critical_alerts_query(cfg: &HealthCheckConfig) -> String {
    let mut query = String::from(
        r#"ALERTS{alertstate="firing",severity="critical",namespace=~"^openshift.*|^kube-.*|^default$""#,
    );
    for namespace in &cfg.ignored_namespaces {
        query.push_str(&format!(r#",namespace!="{namespace}""#));
    }
    for alert in &cfg.ignored_criticals {
        query.push_str(&format!(r#",alertname!="{alert}""#));
    }
    query.push('}');
    query
}

pub async fn critical_alerts(
    client: &dyn MetricsQuery,
    cfg: &HealthCheckConfig,
    reporter: &HealthReporter<'_>,
) -> Result<CheckOutcome> {
    let response = match client.query(&critical_alerts_query(cfg)).await {
        Ok(response) => response,
        Err(e) => {
            warn!(upgradeconfig = reporter.name, error = %e, "Unable to query critical alerts");
            reporter.fail(HealthCheckReason::MetricsQueryFailed);
            return Err(MuoError::MetricsQuery(format!("unable to query critical alerts: {e:#}")).into());
        }
    };
    reporter.pass(HealthCheckReason::MetricsQueryFailed);

    let alerts = response.unique_label_values("alertname");
    if !alerts.is_empty() {
        let joined = alerts.join(", ");
        info!(upgradeconfig = reporter.name, alerts = joined.as_str(), "Critical alerts firing");
        reporter.fail(HealthCheckReason::CriticalAlertsFiring);
        return Ok(CheckOutcome::Failed(format!("critical alert(s) firing: {joined}")));
    }
    reporter.pass(HealthCheckReason::CriticalAlertsFiring);
    Ok(CheckOutcome::Passed)
}

pub async fn cluster_operators(
    client: &dyn ClusterVersionClient,
    reporter: &HealthReporter<'_>,
) -> Result<CheckOutcome> {
    let operators = match client.cluster_operators().await {
        Ok(operators) => operators,
        Err(e) => {
            warn!(upgradeconfig = reporter.name, error = %e, "Unable to fetch status of clusteroperators");
            reporter.fail(HealthCheckReason::ClusterOperatorsStatusFailed);
            return Err(e);
        }
    };
    reporter.pass(HealthCheckReason::ClusterOperatorsStatusFailed);

    let degraded = degraded_operators(&operators);
    if !degraded.is_empty() {
        let joined = degraded.join(", ");
        info!(upgradeconfig = reporter.name, operators = joined.as_str(), "Degraded operators");
        reporter.fail(HealthCheckReason::ClusterOperatorsDegraded);
        return Ok(CheckOutcome::Failed(format!("degraded operators: {joined}")));
    }
    reporter.pass(HealthCheckReason::ClusterOperatorsDegraded);
    Ok(CheckOutcome::Passed)
}

/// Cordoned worker nodes the machine config daemon is not working on.
pub fn manually_cordoned(nodes: &[NodeState]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| n.is_cordoned() && !n.upgrading)
        .map(|n| n.name.clone())
        .collect()
}

pub async fn manually_cordoned_nodes(
    machinery: &dyn Machinery,
    reporter: &HealthReporter<'_>,
) -> Result<CheckOutcome> {
    let nodes = match machinery.worker_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            reporter.fail(HealthCheckReason::ManuallyCordonedNodes);
            return Err(e);
        }
    };
    let cordoned = manually_cordoned(&nodes);
    if !cordoned.is_empty() {
        reporter.fail(HealthCheckReason::ManuallyCordonedNodes);
        return Ok(CheckOutcome::Failed(format!("cordoned nodes: {}", cordoned.join(", "))));
    }
    reporter.pass(HealthCheckReason::ManuallyCordonedNodes);
    Ok(CheckOutcome::Passed)
}

/// Node pressure taints that block scheduling.
const PRESSURE_TAINTS: &[(&str, &str)] = &[
    ("node.kubernetes.io/memory-pressure", "memory pressure"),
    ("node.kubernetes.io/disk-pressure", "disk pressure"),
    ("node.kubernetes.io/pid-pressure", "pid pressure"),
];

/// Nodes carrying each pressure taint, omitting pressure types with no nodes.
pub fn pressure_tainted(nodes: &[NodeState]) -> Vec<(&'static str, Vec<String>)> {
    PRESSURE_TAINTS
        .iter()
        .map(|(key, label)| {
            let names = nodes
                .iter()
                .filter(|n| n.taints.iter().any(|t| t.key == *key))
                .map(|n| n.name.clone())
                .collect::<Vec<_>>();
            (*label, names)
        })
        .filter(|(_, names)| !names.is_empty())
        .collect()
}

pub async fn node_unschedulable_taints(
    machinery: &dyn Machinery,
    reporter: &HealthReporter<'_>,
) -> Result<CheckOutcome> {
    let nodes = match machinery.all_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            reporter.fail(HealthCheckReason::NodeUnschedulableTaints);
            return Err(e);
        }
    };
    let tainted = pressure_tainted(&nodes);
    if !tainted.is_empty() {
        let detail = tainted
            .iter()
            .map(|(label, names)| format!("{label}: {}", names.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");
        reporter.fail(HealthCheckReason::NodeUnschedulableTaints);
        return Ok(CheckOutcome::Failed(format!("unschedulable taints on nodes: {detail}")));
    }
    reporter.pass(HealthCheckReason::NodeUnschedulableTaints);
    Ok(CheckOutcome::Passed)
}

pub async fn pdb_health(analyzer: &dyn PdbAnalyzer, reporter: &HealthReporter<'_>) -> Result<CheckOutcome> {
    match analyzer.analyze().await {
        Err(e) => {
            reporter.fail(HealthCheckReason::PDBQueryFailed);
            Err(e)
        }
        Ok(PdbFinding::Invalid { detail }) => {
            reporter.pass(HealthCheckReason::PDBQueryFailed);
            reporter.fail(HealthCheckReason::ClusterInvalidPDBConf);
            Ok(CheckOutcome::Failed(detail))
        }
        Ok(PdbFinding::Valid) => {
            reporter.pass(HealthCheckReason::PDBQueryFailed);
            reporter.pass(HealthCheckReason::ClusterInvalidPDBConf);
            Ok(CheckOutcome::Passed)
        }
    }
}

/// Collaborators used by the aggregate checks.
pub struct HealthChecks<'a> {
    pub metrics_query: &'a dyn MetricsQuery,
    pub cluster_version: &'a dyn ClusterVersionClient,
    pub machinery: &'a dyn Machinery,
    pub scaler: &'a dyn Scaler,
    pub pdb: &'a dyn PdbAnalyzer,
    pub config: &'a OperatorConfig,
    pub reporter: HealthReporter<'a>,
}

/// Aggregate result. `failures` names every failed check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub failures: Vec<String>,
}

impl HealthReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    fn single(outcome: CheckOutcome) -> Self {
        match outcome {
            CheckOutcome::Passed => Self::default(),
            CheckOutcome::Failed(msg) => Self { failures: vec![msg] },
        }
    }
}

fn collect(failures: &mut Vec<String>, label: &str, result: Result<CheckOutcome>) {
    match result {
        Ok(CheckOutcome::Passed) => {}
        Ok(CheckOutcome::Failed(msg)) => {
            info!(check = label, detail = msg.as_str(), "Pre-upgrade health check failed");
            failures.push(label.to_string());
        }
        Err(e) => {
            info!(check = label, error = %e, "Pre-upgrade health check could not run");
            failures.push(label.to_string());
        }
    }
}

/// Gate evaluated before the upgrade commences.
///
/// Once the platform has been told to upgrade the gate always passes. With
/// the extended feature gate every check runs and failures are aggregated;
/// otherwise alerts then operators run and the first failure wins.
pub async fn pre_upgrade_health_check(
    checks: &HealthChecks<'_>,
    commenced: bool,
    capacity_reservation: bool,
) -> Result<HealthReport> {
    if commenced {
        return Ok(HealthReport::default());
    }
    let reporter = &checks.reporter;

    if !checks.config.is_feature_enabled(PRE_HEALTH_CHECK_FEATURE_GATE) {
        let outcome =
            critical_alerts(checks.metrics_query, &checks.config.health_check, reporter).await?;
        if !outcome.passed() {
            return Ok(HealthReport::single(outcome));
        }
        let outcome = cluster_operators(checks.cluster_version, reporter).await?;
        return Ok(HealthReport::single(outcome));
    }

    let mut failures = Vec::new();
    collect(
        &mut failures,
        "CriticalAlertsHealthcheckFailed",
        critical_alerts(checks.metrics_query, &checks.config.health_check, reporter).await,
    );
    collect(
        &mut failures,
        "ClusterOperatorsHealthcheckFailed",
        cluster_operators(checks.cluster_version, reporter).await,
    );
    if capacity_reservation {
        let can_scale = checks.scaler.can_scale().await.unwrap_or(false);
        if can_scale {
            reporter.pass(HealthCheckReason::DefaultWorkerMachinepoolNotFound);
        } else {
            reporter.fail(HealthCheckReason::DefaultWorkerMachinepoolNotFound);
            failures.push("CapacityReservationHealthcheckFailed".to_string());
        }
    }
    collect(
        &mut failures,
        "NodeUnschedulableHealthcheckFailed",
        manually_cordoned_nodes(checks.machinery, reporter).await,
    );
    collect(
        &mut failures,
        "NodeUnschedulableTaintHealthcheckFailed",
        node_unschedulable_taints(checks.machinery, reporter).await,
    );
    collect(&mut failures, "PDBHealthcheckFailed", pdb_health(checks.pdb, reporter).await);

    if !failures.is_empty() {
        info!(
            upgradeconfig = reporter.name,
            failures = failures.join(",").as_str(),
            "Upgrade may be delayed by pre-upgrade health check failures"
        );
    }
    Ok(HealthReport { failures })
}

/// Landing-state check: alerts then operators, first failure wins.
pub async fn post_upgrade_health_check(checks: &HealthChecks<'_>) -> Result<HealthReport> {
    let outcome =
        critical_alerts(checks.metrics_query, &checks.config.health_check, &checks.reporter).await?;
    if !outcome.passed() {
        return Ok(HealthReport::single(outcome));
    }
    let outcome = cluster_operators(checks.cluster_version, &checks.reporter).await?;
    Ok(HealthReport::single(outcome))
}
