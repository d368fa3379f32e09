//! Router-level tests for the query plane: health, the discovery stub,
//! parameter validation, backend-unavailable behavior, and the snapshot
//! view.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use tokio::sync::Mutex;
use tower::ServiceExt;

use common::metadata::{MetadataError, MetadataStore};
use common::model::{PhaseMode, SnapshotMetadata};

use querier::{QuerierState, router};

#[derive(Default)]
struct MemoryMetadataStore {
    docs: Mutex<HashMap<String, SnapshotMetadata>>,
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn upsert(&self, doc: &SnapshotMetadata) -> Result<(), MetadataError> {
        self.docs
            .lock()
            .await
            .insert(doc.snapshot_id.clone(), doc.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<SnapshotMetadata, MetadataError> {
        self.docs
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))
    }

    async fn update_phase(
        &self,
        _id: &str,
        _label: &str,
        _mode: PhaseMode,
    ) -> Result<(), MetadataError> {
        Ok(())
    }

    async fn update_services(&self, _id: &str, _services: Vec<String>) -> Result<(), MetadataError> {
        Ok(())
    }

    async fn eol(&self, _id: &str) -> Result<(), MetadataError> {
        Ok(())
    }
}

fn state_without_backend(store: Arc<MemoryMetadataStore>) -> QuerierState {
    QuerierState {
        executor: None,
        metadata: store,
        ts_keyspace: "cbmonitor._default._default".to_string(),
        metadata_keyspace: "metadata._default._default".to_string(),
    }
}

async fn send(state: &QuerierState, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health() {
    let state = state_without_backend(Arc::default());
    let (status, body) = send(&state, "/metrics/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_series_stub() {
    let state = state_without_backend(Arc::default());

    let (status, body) = send(&state, "/series").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, body) = send(&state, "/series?match[]=up").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["result"], serde_json::json!([]));
}

#[tokio::test]
async fn test_query_requires_query_parameter() {
    let state = state_without_backend(Arc::default());
    let (status, body) = send(&state, "/query").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorType"], "bad_data");
}

#[tokio::test]
async fn test_query_range_requires_window() {
    let state = state_without_backend(Arc::default());
    let (status, body) = send(&state, "/query_range?query=up").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_query_without_backend_is_503() {
    let state = state_without_backend(Arc::default());
    let (status, body) = send(
        &state,
        "/query?query=memory_used%7Bjob%3D%22snap1%22%7D&time=1700000000",
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["errorType"], "unavailable");
}

#[tokio::test]
async fn test_metric_rows_without_backend_is_503() {
    let state = state_without_backend(Arc::default());
    let (status, body) = send(&state, "/snapshots/snap1/metrics/memory_used").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_snapshot_view_with_dashboards() {
    let store = Arc::new(MemoryMetadataStore::default());
    let mut doc = SnapshotMetadata::new(
        "snap1".to_string(),
        vec!["kv".to_string(), "n1ql".to_string()],
        "8.0.0-1000-enterprise".to_string(),
        Some("weekly perf run".to_string()),
    );
    doc.start_phase("load", Utc::now()).unwrap();
    store.upsert(&doc).await.unwrap();

    let state = state_without_backend(store);
    let (status, body) = send(&state, "/snapshots/snap1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["metadata"]["snapshot_id"], "snap1");
    assert_eq!(body["data"]["metadata"]["label"], "weekly perf run");
    assert_eq!(
        body["data"]["dashboards"],
        serde_json::json!(["kv_basic", "query_basic", "system_basic"])
    );
}

#[tokio::test]
async fn test_snapshot_view_not_found() {
    let state = state_without_backend(Arc::default());
    let (status, body) = send(&state, "/snapshots/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}
