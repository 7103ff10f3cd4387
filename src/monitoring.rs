//! Clients for the in-cluster monitoring stack and other HTTP collaborators.

pub mod alertmanager;
pub mod availability;
pub mod cincinnati;
pub mod prometheus;

pub use alertmanager::AlertmanagerMaintenance;
pub use availability::HttpAvailabilityChecker;
pub use cincinnati::CincinnatiClient;
pub use prometheus::{MetricsQuery, PrometheusClient};

use const_format::formatcp;

/// Default bound on any request to a monitoring endpoint.
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// `User-Agent` sent on every outbound request.
pub const USER_AGENT: &str = formatcp!("muo/{}", crate::VERSION);
