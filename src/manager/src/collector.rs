//! Cluster-metadata collector.
//!
//! Reads `/pools/nodes` on a target cluster and reduces the response to the
//! union of node services plus the server version of the first node. Every
//! failure is soft: the caller logs and proceeds without metadata.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const COLLECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// What a cluster reports about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInfo {
    pub services: Vec<String>,
    pub server: String,
}

#[derive(Debug, Deserialize)]
struct PoolsNodesResponse {
    #[serde(default)]
    nodes: Vec<NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    #[serde(default)]
    services: Vec<String>,
    #[serde(default)]
    version: String,
}

pub struct Collector {
    http: reqwest::Client,
}

impl Collector {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(COLLECT_TIMEOUT).build()?;
        Ok(Self { http })
    }

    pub async fn collect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<ClusterInfo, CollectorError> {
        let url = format!("http://{host}:{port}/pools/nodes");

        let resp = self
            .http
            .get(&url)
            .basic_auth(username, Some(password))
            .send()
            .await
            .map_err(|source| CollectorError::Transport {
                url: url.clone(),
                source,
            })?;

        if !resp.status().is_success() {
            return Err(CollectorError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }

        let body: PoolsNodesResponse =
            resp.json()
                .await
                .map_err(|source| CollectorError::Decode {
                    url: url.clone(),
                    source,
                })?;

        Ok(reduce_nodes(&body.nodes))
    }
}

/// Insertion-ordered union of node services; server version from the first
/// node.
fn reduce_nodes(nodes: &[NodeInfo]) -> ClusterInfo {
    let mut services = Vec::new();
    for node in nodes {
        for service in &node.services {
            if !services.contains(service) {
                services.push(service.clone());
            }
        }
    }
    let server = nodes.first().map(|n| n.version.clone()).unwrap_or_default();
    ClusterInfo { services, server }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_nodes_unions_services_in_order() {
        let body: PoolsNodesResponse = serde_json::from_str(
            r#"{
                "nodes": [
                    {"services": ["kv", "index"], "version": "8.0.0-1000-enterprise"},
                    {"services": ["index", "n1ql"], "version": "8.0.0-1001-enterprise"},
                    {"services": ["kv", "fts"], "version": "8.0.0-1000-enterprise"}
                ]
            }"#,
        )
        .unwrap();

        let info = reduce_nodes(&body.nodes);
        assert_eq!(info.services, vec!["kv", "index", "n1ql", "fts"]);
        assert_eq!(info.server, "8.0.0-1000-enterprise");
    }

    #[test]
    fn test_reduce_nodes_empty() {
        let info = reduce_nodes(&[]);
        assert!(info.services.is_empty());
        assert!(info.server.is_empty());
    }

    #[test]
    fn test_nodes_response_tolerates_extra_fields() {
        let body: PoolsNodesResponse = serde_json::from_str(
            r#"{"nodes": [{"hostname": "h1:8091", "services": ["kv"], "version": "7.6.2", "status": "healthy"}]}"#,
        )
        .unwrap();
        assert_eq!(reduce_nodes(&body.nodes).services, vec!["kv"]);
    }
}
