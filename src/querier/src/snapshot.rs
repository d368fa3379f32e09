//! Snapshot view for the dashboard UI: the metadata document plus the
//! pre-canned dashboards implied by the snapshot's services.

use serde::Serialize;

use common::model::SnapshotMetadata;

const DASHBOARD_MAP: [(&str, &str); 11] = [
    ("kv", "kv_basic"),
    ("index", "index_basic"),
    ("query", "query_basic"),
    ("fts", "fts_basic"),
    ("eventing", "eventing_basic"),
    ("analytics", "analytics_basic"),
    ("cbas", "analytics_basic"),
    ("n1ql", "query_basic"),
    ("data", "kv_basic"),
    ("xdcr", "xdcr_basic"),
    ("cluster_manager", "cluster_manager_basic"),
];

#[derive(Debug, Serialize)]
pub struct SnapshotView {
    pub metadata: SnapshotMetadata,
    pub dashboards: Vec<String>,
}

impl SnapshotView {
    pub fn new(metadata: SnapshotMetadata) -> Self {
        let dashboards = determine_dashboards(&metadata.services);
        Self {
            metadata,
            dashboards,
        }
    }
}

/// Dashboard ids for the given services. Duplicates collapse to the first
/// occurrence; the system dashboard is always appended.
pub fn determine_dashboards(services: &[String]) -> Vec<String> {
    let mut dashboards: Vec<String> = Vec::new();

    for service in services {
        let Some((_, dashboard)) = DASHBOARD_MAP.iter().find(|(s, _)| s == service) else {
            continue;
        };
        if !dashboards.iter().any(|d| d == dashboard) {
            dashboards.push(dashboard.to_string());
        }
    }

    if !dashboards.iter().any(|d| d == "system_basic") {
        dashboards.push("system_basic".to_string());
    }

    dashboards
}
