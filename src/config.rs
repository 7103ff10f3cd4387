//! Operator configuration loaded from a mounted YAML file.
//!
//! All durations are expressed in minutes unless noted otherwise. Invalid
//! values are rejected by [`OperatorConfig::validate`] before the controller
//! starts, so no step ever runs with a zero-length window.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::MuoError;

/// Default location of the operator configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/muo/config.yaml";

/// Feature gate enabling the extended pre-upgrade health check.
pub const PRE_HEALTH_CHECK_FEATURE_GATE: &str = "PreHealthCheck";

/// Top-level operator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    #[serde(default)]
    pub upgrade_window: UpgradeWindowConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub scale: ScaleConfig,

    #[serde(default)]
    pub node_drain: NodeDrainConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub ext_dependency_availability_checks: AvailabilityChecksConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub feature_gate: FeatureGateConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    /// Periodic policy sync. Absent means the sync loop is not started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_manager: Option<ConfigManagerConfig>,
}

/// Upgrade window: how long an upgrade may stay uncommenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeWindowConfig {
    /// Minutes after the start time before an uncommenced upgrade is abandoned.
    #[serde(default = "default_window_timeout")]
    pub time_out: i64,

    /// Minutes after the start time before a delay notification is sent.
    #[serde(default = "default_delay_trigger")]
    pub delay_trigger: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceConfig {
    #[serde(default = "default_control_plane_time")]
    pub control_plane_time: i64,

    #[serde(default)]
    pub ignored_alerts: IgnoredAlertsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoredAlertsConfig {
    /// Critical alerts silenced for the duration of the control plane window.
    #[serde(default)]
    pub control_plane_criticals: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleConfig {
    #[serde(default = "default_scale_timeout")]
    pub time_out: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDrainConfig {
    #[serde(default = "default_node_drain_timeout")]
    pub time_out: i64,

    #[serde(default = "default_expected_node_drain_time")]
    pub expected_node_drain_time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub ignored_criticals: Vec<String>,

    #[serde(default)]
    pub ignored_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityChecksConfig {
    #[serde(default)]
    pub http: HttpTargetsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTargetsConfig {
    /// Per-request timeout in seconds (1 to 60).
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub fedramp: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGateConfig {
    #[serde(default)]
    pub enabled: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    /// Validate channel changes against the Cincinnati update graph.
    #[serde(default)]
    pub cincinnati: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigManagerConfig {
    /// Spec provider source. Only `LOCAL` (ConfigMap) is supported.
    pub source: String,

    /// Minutes between policy refreshes.
    #[serde(default = "default_watch_interval")]
    pub watch_interval: i64,

    /// ConfigMap holding the upgrade policy for the `LOCAL` source.
    #[serde(default = "default_policy_config_map")]
    pub config_map: String,
}

const fn default_window_timeout() -> i64 {
    120
}
const fn default_delay_trigger() -> i64 {
    30
}
const fn default_control_plane_time() -> i64 {
    60
}
const fn default_scale_timeout() -> i64 {
    30
}
const fn default_node_drain_timeout() -> i64 {
    45
}
const fn default_expected_node_drain_time() -> i64 {
    8
}
const fn default_http_timeout() -> u64 {
    15
}
const fn default_watch_interval() -> i64 {
    1
}
fn default_policy_config_map() -> String {
    "managed-upgrade-policy".to_string()
}

impl Default for UpgradeWindowConfig {
    fn default() -> Self {
        Self {
            time_out: default_window_timeout(),
            delay_trigger: default_delay_trigger(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            control_plane_time: default_control_plane_time(),
            ignored_alerts: IgnoredAlertsConfig::default(),
        }
    }
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            time_out: default_scale_timeout(),
        }
    }
}

impl Default for NodeDrainConfig {
    fn default() -> Self {
        Self {
            time_out: default_node_drain_timeout(),
            expected_node_drain_time: default_expected_node_drain_time(),
        }
    }
}

impl Default for HttpTargetsConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
            urls: Vec::new(),
        }
    }
}

impl OperatorConfig {
    /// Load and validate configuration from `MUO_CONFIG_PATH` or the default path.
    ///
    /// A missing file yields the built-in defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("MUO_CONFIG_PATH")
            .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    /// Load and validate configuration from the given file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    /// Parse and validate configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would produce empty or negative windows.
    pub fn validate(&self) -> Result<(), MuoError> {
        let invalid =
            |msg: &str| -> Result<(), MuoError> { Err(MuoError::InvalidConfig(msg.to_string())) };

        if self.maintenance.control_plane_time <= 0 {
            return invalid("maintenance.controlPlaneTime must be greater than 0");
        }
        if self.scale.time_out <= 0 {
            return invalid("scale.timeOut must be greater than 0");
        }
        if self.node_drain.time_out <= 0 {
            return invalid("nodeDrain.timeOut must be greater than 0");
        }
        if self.node_drain.expected_node_drain_time <= 0 {
            return invalid("nodeDrain.expectedNodeDrainTime must be greater than 0");
        }
        if self.upgrade_window.delay_trigger < 0 {
            return invalid("upgradeWindow.delayTrigger must not be negative");
        }
        if self.upgrade_window.time_out < 0 {
            return invalid("upgradeWindow.timeOut must not be negative");
        }
        let http = &self.ext_dependency_availability_checks.http;
        if !http.urls.is_empty() && !(1..=60).contains(&http.timeout) {
            return invalid(
                "extDependencyAvailabilityChecks.http.timeout must be between 1 and 60 seconds",
            );
        }
        if let Some(cm) = &self.config_manager {
            if !cm.source.eq_ignore_ascii_case("LOCAL") {
                return Err(MuoError::InvalidConfig(format!(
                    "configManager.source {} is not supported",
                    cm.source
                )));
            }
            if cm.watch_interval <= 0 {
                return invalid("configManager.watchInterval must be greater than 0");
            }
        }
        Ok(())
    }

    /// Returns true if the named feature gate is enabled.
    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        self.feature_gate.enabled.iter().any(|f| f == feature)
    }

    pub fn upgrade_window_timeout(&self) -> Duration {
        Duration::minutes(self.upgrade_window.time_out)
    }

    pub fn delay_trigger(&self) -> Duration {
        Duration::minutes(self.upgrade_window.delay_trigger)
    }

    pub fn control_plane_duration(&self) -> Duration {
        Duration::minutes(self.maintenance.control_plane_time)
    }

    pub fn scale_duration(&self) -> Duration {
        Duration::minutes(self.scale.time_out)
    }

    pub fn node_drain_timeout(&self) -> Duration {
        Duration::minutes(self.node_drain.time_out)
    }

    pub fn expected_node_drain_time(&self) -> Duration {
        Duration::minutes(self.node_drain.expected_node_drain_time)
    }

    pub fn availability_check_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ext_dependency_availability_checks.http.timeout)
    }
}

impl ConfigManagerConfig {
    pub fn watch_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.watch_interval.unsigned_abs() * 60)
    }
}
