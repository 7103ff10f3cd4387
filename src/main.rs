//! muo - Managed Upgrade Operator.
//!
//! Watches `UpgradeConfig` resources and performs scheduled cluster upgrades:
//! health-gated start, control plane then worker rollout under maintenance
//! windows, optional extra worker capacity, and lifecycle notifications.

mod cluster;
mod config;
mod controller;
mod crd;
mod error;
mod events;
mod gates;
mod health;
mod k8s;
mod monitoring;
mod notify;
mod policy;
mod scheduler;
mod status;
mod steps;
mod telemetry;
mod upgrader;
mod validation;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::StreamExt;
use kube::Api;
use kube::runtime::Controller;
use kube::runtime::watcher::Config;
use secrecy::SecretString;
use tokio::sync::watch;
use tracing::{error, info};

use cluster::{AvailabilityChecker, UpdateGraph};
use config::OperatorConfig;
use controller::{Context, Reconciler};
use crd::UpgradeConfig;
use events::EventManager;
use monitoring::alertmanager::AlertmanagerSilenceClient;
use monitoring::{
    AlertmanagerMaintenance, CincinnatiClient, HttpAvailabilityChecker, MetricsQuery, PrometheusClient,
};
use notify::{LogSink, NotificationSink, Notifier, SlackSink};
use policy::{ConfigMapSpecProvider, KubeUpgradeConfigStore, SpecProvider, UpgradeConfigManager};
use upgrader::Collaborators;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

const DEFAULT_NAMESPACE: &str = "openshift-managed-upgrade-operator";
const DEFAULT_PROMETHEUS_URL: &str = "https://prometheus-k8s.openshift-monitoring.svc:9091";
const DEFAULT_ALERTMANAGER_URL: &str = "https://alertmanager-main.openshift-monitoring.svc:9094";
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const HEALTH_PORT: u16 = 8080;
const METRICS_PORT: u16 = 8081;

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting muo v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    if let Err(e) = run().await {
        error!("Operator failed: {:#}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber with JSON format for production.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .init();

    Ok(())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Bearer token for the monitoring stack: `MONITORING_TOKEN`, else the pod's
/// service account token.
fn monitoring_token() -> Option<SecretString> {
    std::env::var("MONITORING_TOKEN")
        .ok()
        .or_else(|| std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN).ok())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .map(SecretString::from)
}

fn notification_sink() -> Result<Arc<dyn NotificationSink>> {
    match std::env::var("SLACK_WEBHOOK_URL").ok().filter(|url| !url.is_empty()) {
        Some(url) => {
            info!("Slack notifications enabled");
            Ok(Arc::new(SlackSink::new(SecretString::from(url))?))
        }
        None => {
            info!("SLACK_WEBHOOK_URL not set, notifications are logged only");
            Ok(Arc::new(LogSink))
        }
    }
}

/// Main operator loop.
async fn run() -> Result<()> {
    let config = Arc::new(OperatorConfig::load().context("Failed to load operator configuration")?);
    let namespace = env_or("OPERATOR_NAMESPACE", DEFAULT_NAMESPACE);

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let token = monitoring_token();
    let prometheus: Arc<dyn MetricsQuery> = Arc::new(PrometheusClient::new(
        env_or("PROMETHEUS_URL", DEFAULT_PROMETHEUS_URL),
        token.clone(),
    )?);
    let silences = Arc::new(AlertmanagerSilenceClient::new(
        env_or("ALERTMANAGER_URL", DEFAULT_ALERTMANAGER_URL),
        token,
    )?);

    // Initialize Prometheus metrics
    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(telemetry::metrics::Metrics::new(&mut registry, Some(prometheus.clone())));
    let registry = Arc::new(registry);

    // Start health server (port 8080)
    let health_state = telemetry::health::HealthState::new();
    let health_state_clone = health_state.clone();
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(HEALTH_PORT, health_state_clone).await {
            error!("Health server failed: {}", e);
        }
    });

    // Start metrics server (port 8081)
    let registry_clone = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(METRICS_PORT, registry_clone).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let http_checks = &config.ext_dependency_availability_checks.http;
    let availability: Vec<Arc<dyn AvailabilityChecker>> = if http_checks.urls.is_empty() {
        Vec::new()
    } else {
        vec![Arc::new(HttpAvailabilityChecker::new(
            http_checks.urls.clone(),
            config.availability_check_timeout(),
        )?)]
    };

    let cluster_version = Arc::new(k8s::KubeClusterVersion::new(client.clone()));
    let collaborators = Collaborators {
        cluster_version: cluster_version.clone(),
        maintenance: Arc::new(AlertmanagerMaintenance::new(silences)),
        scaler: Arc::new(k8s::KubeScaler::new(client.clone())),
        machinery: Arc::new(k8s::KubeMachinery::new(client.clone())),
        pdb: Arc::new(k8s::KubePdbAnalyzer::new(client.clone())),
        metrics_query: prometheus,
        availability,
        file_integrity: Arc::new(k8s::KubeFileIntegrity::new(client.clone())),
    };

    let update_graph: Option<Arc<dyn UpdateGraph>> = if config.validation.cincinnati {
        Some(Arc::new(CincinnatiClient::new()?))
    } else {
        None
    };

    let provider = config.config_manager.as_ref().map(|cm| {
        info!(
            source = cm.source.as_str(),
            configmap = cm.config_map.as_str(),
            "Upgrade policy source configured"
        );
        Arc::new(ConfigMapSpecProvider::new(client.clone(), &namespace, cm.config_map.clone()))
            as Arc<dyn SpecProvider>
    });
    let policy = Arc::new(UpgradeConfigManager::new(
        Arc::new(KubeUpgradeConfigStore::new(client.clone(), &namespace)),
        cluster_version,
        provider,
        namespace.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Some(cm) = &config.config_manager {
        tokio::spawn(policy::start_sync(
            policy.clone(),
            metrics.clone(),
            cm.watch_interval(),
            shutdown_rx,
        ));
    } else {
        info!("No upgrade policy source configured, will not sync");
    }

    let events = EventManager::new(Notifier::new(notification_sink()?), metrics.clone());
    let ctx = Arc::new(Context {
        client: client.clone(),
        reconciler: Reconciler {
            collaborators,
            config: config.clone(),
            metrics: metrics.clone(),
            events,
            update_graph,
            policy,
        },
        metrics,
    });

    let api: Api<UpgradeConfig> = Api::namespaced(client, &namespace);

    // Mark as ready once controller starts
    health_state.set_ready(true);

    info!(namespace = namespace.as_str(), "Starting UpgradeConfig controller");
    Controller::new(api, Config::default())
        .run(controller::reconcile, controller::error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("Reconciled: {:?}", o),
                Err(e) => error!("Reconcile failed: {:?}", e),
            }
        })
        .await;

    // The controller stream only ends on shutdown.
    health_state.set_live(false);
    let _ = shutdown_tx.send(true);
    Ok(())
}
