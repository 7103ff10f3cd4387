//! Prometheus metrics for the muo operator.
//!
//! Gauges follow the `upgradeoperator_*` naming the paging alerts are written
//! against. The [`MetricsSink`] trait is what the upgrade core depends on.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tracing::debug;

use crate::health::HealthCheckReason;
use crate::monitoring::MetricsQuery;
use crate::monitoring::prometheus::notification_marker_query;

/// Metric updates and lookups used by the upgrade core.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    fn update_validation(&self, name: &str, failed: bool);

    fn update_health_check(
        &self,
        name: &str,
        check: HealthCheckReason,
        version: &str,
        state: &str,
        failed: bool,
    );

    fn update_scaling(&self, name: &str, failed: bool);

    fn update_window_breached(&self, name: &str, breached: bool);

    fn update_control_plane_timeout(&self, name: &str, version: &str, timed_out: bool);

    fn update_worker_timeout(&self, name: &str, version: &str, timed_out: bool);

    fn update_node_drain_failed(&self, name: &str, failed: bool);

    /// Whether the notification for `(name, event, version)` was already sent.
    async fn is_notification_event_sent(&self, name: &str, event: &str, version: &str) -> Result<bool>;

    fn update_notification_event_sent(&self, name: &str, event: &str, version: &str);

    fn update_upgrade_result(&self, name: &str, version: &str, stream: &str, alerts: &[String]);

    fn update_config_synced(&self, name: &str, now: DateTime<Utc>);

    /// Clear the failure gauges once an upgrade is abandoned. The window breach flag stays set.
    fn reset_failure_metrics(&self);
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub upgradeconfig_name: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NameLabels {
    pub upgradeconfig_name: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub upgradeconfig_name: String,
    pub healthcheck: String,
    pub version: String,
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VersionLabels {
    pub upgradeconfig_name: String,
    pub version: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NotificationLabels {
    pub upgradeconfig_name: String,
    pub event: String,
    pub version: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub upgradeconfig_name: String,
    pub version: String,
    pub stream: String,
    pub alerts: String,
}

fn name_labels(name: &str) -> NameLabels {
    NameLabels {
        upgradeconfig_name: name.to_string(),
    }
}

const fn flag(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

const RECONCILE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<NameLabels, Histogram>,
    validation_failed: Family<NameLabels, Gauge>,
    healthcheck_failed: Family<HealthCheckLabels, Gauge>,
    scaling_failed: Family<NameLabels, Gauge>,
    upgrade_window_breached: Family<NameLabels, Gauge>,
    controlplane_timeout: Family<VersionLabels, Gauge>,
    worker_timeout: Family<VersionLabels, Gauge>,
    node_drain_timeout: Family<NameLabels, Gauge>,
    upgrade_notification: Family<NotificationLabels, Gauge>,
    upgrade_result: Family<ResultLabels, Gauge>,
    config_sync_timestamp: Family<NameLabels, Gauge>,
    /// Markers set by this process, checked before asking the backend.
    sent_notifications: Mutex<HashSet<NotificationLabels>>,
    /// Backend that has scraped markers set before a restart.
    backend: Option<Arc<dyn MetricsQuery>>,
}

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry, backend: Option<Arc<dyn MetricsQuery>>) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "upgradeoperator_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds = Family::<NameLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(RECONCILE_BUCKETS.iter().copied())
        });
        registry.register(
            "upgradeoperator_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let gauge = |registry: &mut Registry, name: &str, help: &str| {
            let family = Family::<NameLabels, Gauge>::default();
            registry.register(name, help, family.clone());
            family
        };
        let validation_failed = gauge(
            registry,
            "upgradeoperator_upgradeconfig_validation_failed",
            "Failed to validate the upgrade config",
        );
        let scaling_failed = gauge(
            registry,
            "upgradeoperator_scaling_failed",
            "Failed to scale up extra workers",
        );
        let upgrade_window_breached = gauge(
            registry,
            "upgradeoperator_upgrade_window_breached",
            "Failed to commence the upgrade during the upgrade window",
        );
        let node_drain_timeout = gauge(
            registry,
            "upgradeoperator_node_drain_timeout",
            "Node cannot be drained successfully in time",
        );
        let config_sync_timestamp = gauge(
            registry,
            "upgradeoperator_upgradeconfig_sync_timestamp",
            "Unix time of the last successful upgrade policy sync",
        );

        let healthcheck_failed = Family::<HealthCheckLabels, Gauge>::default();
        registry.register(
            "upgradeoperator_healthcheck_failed",
            "Pre or post upgrade health check failed",
            healthcheck_failed.clone(),
        );

        let controlplane_timeout = Family::<VersionLabels, Gauge>::default();
        registry.register(
            "upgradeoperator_controlplane_timeout",
            "Control plane upgrade timed out",
            controlplane_timeout.clone(),
        );

        let worker_timeout = Family::<VersionLabels, Gauge>::default();
        registry.register(
            "upgradeoperator_worker_timeout",
            "Worker nodes upgrade timed out",
            worker_timeout.clone(),
        );

        let upgrade_notification = Family::<NotificationLabels, Gauge>::default();
        registry.register(
            "upgradeoperator_upgrade_notification",
            "Notification event raised",
            upgrade_notification.clone(),
        );

        let upgrade_result = Family::<ResultLabels, Gauge>::default();
        registry.register(
            "upgradeoperator_upgrade_result",
            "Result of the last upgrade (1 when no paging alerts fired)",
            upgrade_result.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            validation_failed,
            healthcheck_failed,
            scaling_failed,
            upgrade_window_breached,
            controlplane_timeout,
            worker_timeout,
            node_drain_timeout,
            upgrade_notification,
            upgrade_result,
            config_sync_timestamp,
            sent_notifications: Mutex::new(HashSet::new()),
            backend,
        }
    }

    /// Count one reconcile and observe its duration.
    pub fn record_reconcile(&self, name: &str, result: &str, seconds: f64) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                upgradeconfig_name: name.to_string(),
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .get_or_create(&name_labels(name))
            .observe(seconds);
    }
}

#[async_trait]
impl MetricsSink for Metrics {
    fn update_validation(&self, name: &str, failed: bool) {
        self.validation_failed.get_or_create(&name_labels(name)).set(flag(failed));
    }

    fn update_health_check(
        &self,
        name: &str,
        check: HealthCheckReason,
        version: &str,
        state: &str,
        failed: bool,
    ) {
        self.healthcheck_failed
            .get_or_create(&HealthCheckLabels {
                upgradeconfig_name: name.to_string(),
                healthcheck: check.to_string(),
                version: version.to_string(),
                state: state.to_string(),
            })
            .set(flag(failed));
    }

    fn update_scaling(&self, name: &str, failed: bool) {
        self.scaling_failed.get_or_create(&name_labels(name)).set(flag(failed));
    }

    fn update_window_breached(&self, name: &str, breached: bool) {
        self.upgrade_window_breached
            .get_or_create(&name_labels(name))
            .set(flag(breached));
    }

    fn update_control_plane_timeout(&self, name: &str, version: &str, timed_out: bool) {
        self.controlplane_timeout
            .get_or_create(&VersionLabels {
                upgradeconfig_name: name.to_string(),
                version: version.to_string(),
            })
            .set(flag(timed_out));
    }

    fn update_worker_timeout(&self, name: &str, version: &str, timed_out: bool) {
        self.worker_timeout
            .get_or_create(&VersionLabels {
                upgradeconfig_name: name.to_string(),
                version: version.to_string(),
            })
            .set(flag(timed_out));
    }

    fn update_node_drain_failed(&self, name: &str, failed: bool) {
        self.node_drain_timeout.get_or_create(&name_labels(name)).set(flag(failed));
    }

    async fn is_notification_event_sent(&self, name: &str, event: &str, version: &str) -> Result<bool> {
        let labels = NotificationLabels {
            upgradeconfig_name: name.to_string(),
            event: event.to_string(),
            version: version.to_string(),
        };
        if self
            .sent_notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&labels)
        {
            return Ok(true);
        }
        let Some(backend) = &self.backend else {
            return Ok(false);
        };
        let response = backend
            .query(&notification_marker_query(name, event, version))
            .await?;
        debug!(
            upgradeconfig = name,
            event,
            version,
            found = !response.is_empty(),
            "Checked notification marker in metrics backend"
        );
        Ok(!response.is_empty())
    }

    fn update_notification_event_sent(&self, name: &str, event: &str, version: &str) {
        let labels = NotificationLabels {
            upgradeconfig_name: name.to_string(),
            event: event.to_string(),
            version: version.to_string(),
        };
        self.upgrade_notification.get_or_create(&labels).set(1);
        self.sent_notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(labels);
    }

    fn update_upgrade_result(&self, name: &str, version: &str, stream: &str, alerts: &[String]) {
        self.upgrade_result
            .get_or_create(&ResultLabels {
                upgradeconfig_name: name.to_string(),
                version: version.to_string(),
                stream: stream.to_string(),
                alerts: alerts.join(","),
            })
            .set(flag(alerts.is_empty()));
    }

    fn update_config_synced(&self, name: &str, now: DateTime<Utc>) {
        self.config_sync_timestamp
            .get_or_create(&name_labels(name))
            .set(now.timestamp());
    }

    fn reset_failure_metrics(&self) {
        self.validation_failed.clear();
        self.healthcheck_failed.clear();
        self.scaling_failed.clear();
        self.controlplane_timeout.clear();
        self.worker_timeout.clear();
        self.node_drain_timeout.clear();
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
