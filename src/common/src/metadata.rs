//! Metadata store capability (one document per snapshot).
//!
//! Three backends: the real Couchbase store (documents addressed through the
//! query service), a no-op store used when metadata is disabled, and an
//! "unavailable" store standing in when the backend could not be reached at
//! boot. Read-modify-write sequences are serialized per snapshot id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Configuration;
use crate::couchbase::{CouchbaseError, QueryClient};
use crate::error::ApiError;
use crate::model::{PhaseMode, SnapshotMetadata, TransitionError};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata not found for snapshot {0}")]
    NotFound(String),
    #[error("metadata store is unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Invalid(#[from] TransitionError),
    #[error("metadata backend error: {0}")]
    Backend(String),
}

impl From<CouchbaseError> for MetadataError {
    fn from(err: CouchbaseError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<MetadataError> for ApiError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(msg) => ApiError::NotFound(msg),
            MetadataError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
            MetadataError::Invalid(TransitionError::SnapshotClosed) => {
                ApiError::validation("snapshot", "snapshot is closed and cannot be modified")
            }
            MetadataError::Invalid(err @ TransitionError::PhaseStillOpen(_)) => {
                ApiError::Validation {
                    field: "phase".to_string(),
                    message: err.to_string(),
                }
            }
            MetadataError::Backend(msg) => ApiError::Upstream(msg),
        }
    }
}

/// The five operations every metadata backend provides.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert(&self, doc: &SnapshotMetadata) -> Result<(), MetadataError>;

    async fn get(&self, id: &str) -> Result<SnapshotMetadata, MetadataError>;

    async fn update_phase(
        &self,
        id: &str,
        label: &str,
        mode: PhaseMode,
    ) -> Result<(), MetadataError>;

    async fn update_services(&self, id: &str, services: Vec<String>) -> Result<(), MetadataError>;

    /// Set `ts_end` on the snapshot. Idempotent when already closed.
    async fn eol(&self, id: &str) -> Result<(), MetadataError>;
}

/// Build the metadata store configured for this deployment. Falls back to
/// the no-op store when metadata is disabled, and to an unavailable store
/// when the backend cannot be reached at boot.
pub async fn connect(config: &Configuration) -> Arc<dyn MetadataStore> {
    if !config.metadata.enabled {
        log::info!("Metadata storage is disabled; snapshot documents will not be persisted");
        return Arc::new(NoopMetadataStore);
    }

    let client = match QueryClient::new(&config.metadata) {
        Ok(client) => client,
        Err(err) => {
            log::warn!("Failed to build metadata query client: {err}");
            return Arc::new(UnavailableMetadataStore::new(err.to_string()));
        }
    };

    if let Err(err) = client.ping().await {
        log::warn!(
            "Metadata store at {} is unreachable: {err}",
            config.metadata.host
        );
        return Arc::new(UnavailableMetadataStore::new(err.to_string()));
    }

    log::info!(
        "Connected to metadata store at {} (bucket {})",
        config.metadata.host,
        config.metadata.bucket
    );
    Arc::new(CouchbaseMetadataStore::new(
        client,
        config.metadata.keyspace(),
    ))
}

/// Per-key async mutexes serializing read-modify-write per snapshot id.
#[derive(Clone, Default)]
struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

fn upsert_statement(keyspace: &str) -> String {
    format!("UPSERT INTO {keyspace} (KEY, VALUE) VALUES ($1, $2)")
}

fn get_statement(keyspace: &str) -> String {
    format!("SELECT d.* FROM {keyspace} AS d USE KEYS $1")
}

/// Metadata store backed by Couchbase.
pub struct CouchbaseMetadataStore {
    client: QueryClient,
    keyspace: String,
    locks: KeyedLocks,
}

impl CouchbaseMetadataStore {
    pub fn new(client: QueryClient, keyspace: String) -> Self {
        Self {
            client,
            keyspace,
            locks: KeyedLocks::default(),
        }
    }

    async fn save(&self, doc: &SnapshotMetadata) -> Result<(), MetadataError> {
        let value = serde_json::to_value(doc)
            .map_err(|e| MetadataError::Backend(format!("failed to encode document: {e}")))?;
        self.client
            .execute(
                &upsert_statement(&self.keyspace),
                vec![Value::String(doc.snapshot_id.clone()), value],
            )
            .await?;
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<SnapshotMetadata, MetadataError> {
        let rows = self
            .client
            .execute(&get_statement(&self.keyspace), vec![Value::String(id.to_string())])
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))?;
        serde_json::from_value(row)
            .map_err(|e| MetadataError::Backend(format!("failed to decode document {id}: {e}")))
    }
}

#[async_trait]
impl MetadataStore for CouchbaseMetadataStore {
    async fn upsert(&self, doc: &SnapshotMetadata) -> Result<(), MetadataError> {
        self.save(doc).await
    }

    async fn get(&self, id: &str) -> Result<SnapshotMetadata, MetadataError> {
        self.fetch(id).await
    }

    async fn update_phase(
        &self,
        id: &str,
        label: &str,
        mode: PhaseMode,
    ) -> Result<(), MetadataError> {
        let _guard = self.locks.acquire(id).await;
        let mut doc = self.fetch(id).await?;
        match mode {
            PhaseMode::Start => doc.start_phase(label, Utc::now())?,
            PhaseMode::End => doc.end_phase(Utc::now())?,
        }
        self.save(&doc).await
    }

    async fn update_services(&self, id: &str, services: Vec<String>) -> Result<(), MetadataError> {
        let _guard = self.locks.acquire(id).await;
        let mut doc = self.fetch(id).await?;
        doc.set_services(services)?;
        self.save(&doc).await
    }

    async fn eol(&self, id: &str) -> Result<(), MetadataError> {
        let _guard = self.locks.acquire(id).await;
        let mut doc = self.fetch(id).await?;
        if doc.end_of_life(Utc::now()) {
            self.save(&doc).await?;
        }
        Ok(())
    }
}

/// No-op store used when metadata is disabled. Mutations succeed silently;
/// reads report not-found.
pub struct NoopMetadataStore;

#[async_trait]
impl MetadataStore for NoopMetadataStore {
    async fn upsert(&self, _doc: &SnapshotMetadata) -> Result<(), MetadataError> {
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<SnapshotMetadata, MetadataError> {
        Err(MetadataError::NotFound(id.to_string()))
    }

    async fn update_phase(
        &self,
        _id: &str,
        _label: &str,
        _mode: PhaseMode,
    ) -> Result<(), MetadataError> {
        Ok(())
    }

    async fn update_services(
        &self,
        _id: &str,
        _services: Vec<String>,
    ) -> Result<(), MetadataError> {
        Ok(())
    }

    async fn eol(&self, _id: &str) -> Result<(), MetadataError> {
        Ok(())
    }
}

/// Stand-in when the configured backend could not be reached at boot. Every
/// operation fails with an unavailable error so callers surface 503s.
pub struct UnavailableMetadataStore {
    reason: String,
}

impl UnavailableMetadataStore {
    pub fn new(reason: String) -> Self {
        Self { reason }
    }

    fn err(&self) -> MetadataError {
        MetadataError::Unavailable(self.reason.clone())
    }
}

#[async_trait]
impl MetadataStore for UnavailableMetadataStore {
    async fn upsert(&self, _doc: &SnapshotMetadata) -> Result<(), MetadataError> {
        Err(self.err())
    }

    async fn get(&self, _id: &str) -> Result<SnapshotMetadata, MetadataError> {
        Err(self.err())
    }

    async fn update_phase(
        &self,
        _id: &str,
        _label: &str,
        _mode: PhaseMode,
    ) -> Result<(), MetadataError> {
        Err(self.err())
    }

    async fn update_services(
        &self,
        _id: &str,
        _services: Vec<String>,
    ) -> Result<(), MetadataError> {
        Err(self.err())
    }

    async fn eol(&self, _id: &str) -> Result<(), MetadataError> {
        Err(self.err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_statements_use_configured_keyspace() {
        assert_eq!(
            upsert_statement("metadata._default._default"),
            "UPSERT INTO metadata._default._default (KEY, VALUE) VALUES ($1, $2)"
        );
        assert_eq!(
            get_statement("metadata._default._default"),
            "SELECT d.* FROM metadata._default._default AS d USE KEYS $1"
        );
    }

    #[tokio::test]
    async fn test_noop_store_swallows_mutations() {
        let store = NoopMetadataStore;
        let doc = SnapshotMetadata::new("id-1".into(), vec![], String::new(), None);

        store.upsert(&doc).await.unwrap();
        store.update_phase("id-1", "load", PhaseMode::Start).await.unwrap();
        store.eol("id-1").await.unwrap();
        assert!(matches!(
            store.get("id-1").await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_503() {
        let store = UnavailableMetadataStore::new("connection refused".into());
        let err: ApiError = store.eol("id-1").await.unwrap_err().into();
        assert_eq!(err.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::default();

        let guard = locks.acquire("snap-1").await;

        // a second acquire on the same key must wait for the guard
        let pending = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("snap-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        // a different key proceeds immediately
        let _other = locks.acquire("snap-2").await;

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("lock was not released")
            .unwrap();
    }

    #[test]
    fn test_transition_errors_map_to_validation() {
        let err: ApiError = MetadataError::Invalid(TransitionError::PhaseStillOpen("load".into())).into();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let err: ApiError = MetadataError::NotFound("snap-9".into()).into();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
