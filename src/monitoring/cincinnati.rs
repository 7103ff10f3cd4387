//! Update service (Cincinnati) graph client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{DEFAULT_REQUEST_TIMEOUT, USER_AGENT};
use crate::cluster::UpdateGraph;

/// Used when the cluster does not name its own upstream.
pub const DEFAULT_UPSTREAM: &str = "https://api.openshift.com/api/upgrades_info/v1/graph";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphNode {
    pub version: String,
}

/// Release graph: nodes plus `[from, to]` index edges.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<(usize, usize)>,
}

impl Graph {
    /// Direct successors of `from_version`, in edge order.
    pub fn updates_from(&self, from_version: &str) -> Vec<String> {
        let Some(origin) = self.nodes.iter().position(|n| n.version == from_version) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|(from, _)| *from == origin)
            .filter_map(|(_, to)| self.nodes.get(*to))
            .map(|n| n.version.clone())
            .collect()
    }
}

pub struct CincinnatiClient {
    client: reqwest::Client,
    arch: String,
}

impl CincinnatiClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build update service HTTP client")?;
        Ok(Self {
            client,
            arch: "amd64".to_string(),
        })
    }
}

#[async_trait]
impl UpdateGraph for CincinnatiClient {
    async fn available_updates(
        &self,
        upstream: &str,
        channel: &str,
        from_version: &str,
    ) -> Result<Vec<String>> {
        let upstream = if upstream.is_empty() { DEFAULT_UPSTREAM } else { upstream };
        debug!(upstream, channel, from_version, "Fetching update graph");
        let graph: Graph = self
            .client
            .get(upstream)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("channel", channel), ("arch", self.arch.as_str())])
            .send()
            .await
            .with_context(|| format!("Failed to fetch update graph from {upstream}"))?
            .error_for_status()?
            .json()
            .await
            .context("Failed to decode update graph")?;
        let updates = graph.updates_from(from_version);
        if updates.is_empty() {
            anyhow::bail!("no available upgrade for the given clusterversion {from_version}");
        }
        Ok(updates)
    }
}
