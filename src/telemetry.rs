//! Operator self-observability: Prometheus metrics and probe endpoints.

pub mod health;
pub mod metrics;
