//! Request and response shapes for the snapshot control API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload for creating a snapshot: the clusters to scrape and how to reach
/// them.
#[derive(Clone, Debug, Deserialize)]
pub struct SnapshotRequest {
    #[serde(default)]
    pub configs: Vec<ConfigObject>,
    pub credentials: Credentials,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// One scrape target group: service discovery against the cluster manager,
/// or a fixed target list.
#[derive(Clone, Debug, Deserialize)]
pub struct ConfigObject {
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default, rename = "type")]
    pub kind: ConfigType,
    #[serde(default)]
    pub port: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    #[default]
    Sd,
    Static,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub id: String,
}

/// Display view of a snapshot derived from its scrape-config file.
#[derive(Debug, Serialize)]
pub struct DisplaySnapshot {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// PATCH body. All fields optional; an empty body is a pure heartbeat.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PatchRequest {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub services: Option<Vec<String>>,
}
