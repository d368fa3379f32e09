//! Snapshot control API.
//!
//! `POST /api/v1/snapshot` registers a cluster for scraping; the id-scoped
//! routes expose the display view, the heartbeat/phase/services PATCH, and
//! deletion. All cross-request coordination happens through the file store
//! and the metadata store.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;

use common::ApiError;
use common::metadata::{MetadataError, MetadataStore};
use common::model::{PhaseMode, SnapshotMetadata};

use crate::collector::Collector;
use crate::filestore::FileStore;
use crate::model::{DisplaySnapshot, PatchRequest, SnapshotRequest, SnapshotResponse};

#[derive(Clone)]
pub struct ManagerState {
    pub files: Arc<FileStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub collector: Arc<Collector>,
    pub agent_type: String,
}

pub fn router(state: ManagerState) -> Router {
    Router::new()
        .route("/api/v1/snapshot", post(create_snapshot))
        .route(
            "/api/v1/snapshot/:id",
            get(get_snapshot)
                .patch(patch_snapshot)
                .delete(delete_snapshot),
        )
        .with_state(state)
}

/// POST /api/v1/snapshot
#[tracing::instrument(skip(state, request))]
async fn create_snapshot(
    State(state): State<ManagerState>,
    Json(mut request): Json<SnapshotRequest>,
) -> Result<(StatusCode, Json<SnapshotResponse>), ApiError> {
    validate_snapshot_request(&mut request)?;

    let id = state.files.save(&request, &state.agent_type).await?;
    log::info!("Created scrape config for snapshot {id}");

    // Best-effort metadata collection; a cluster that cannot be reached
    // still gets a snapshot.
    let mut services: Vec<String> = Vec::new();
    let mut server = String::new();
    for config in &request.configs {
        for host in &config.hostnames {
            match state
                .collector
                .collect(
                    host,
                    config.port,
                    &request.credentials.username,
                    &request.credentials.password,
                )
                .await
            {
                Ok(info) => {
                    for service in info.services {
                        if !services.contains(&service) {
                            services.push(service);
                        }
                    }
                    if server.is_empty() {
                        server = info.server;
                    }
                }
                Err(err) => {
                    log::warn!("Failed to collect cluster metadata from {host}: {err}");
                }
            }
        }
    }

    let doc = SnapshotMetadata::new(id.clone(), services, server, request.label.clone());
    match state.metadata.upsert(&doc).await {
        Ok(()) => log::info!("Saved metadata for snapshot {id}"),
        Err(err) => log::warn!("Failed to save metadata for snapshot {id}: {err}"),
    }

    Ok((StatusCode::CREATED, Json(SnapshotResponse { id })))
}

/// GET /api/v1/snapshot/{id}
#[tracing::instrument(skip(state))]
async fn get_snapshot(
    State(state): State<ManagerState>,
    Path(id): Path<String>,
) -> Result<Json<DisplaySnapshot>, ApiError> {
    let view = state.files.get(&id).await?;
    Ok(Json(view))
}

/// DELETE /api/v1/snapshot/{id}
///
/// Metadata is closed before the file is removed so the agent never sees a
/// live file for a closed snapshot.
#[tracing::instrument(skip(state))]
async fn delete_snapshot(
    State(state): State<ManagerState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.metadata.eol(&id).await {
        Ok(()) => {}
        Err(MetadataError::NotFound(_)) => {
            log::warn!("No metadata document for snapshot {id}");
        }
        Err(err) => return Err(err.into()),
    }

    state.files.delete(&id).await?;
    log::info!("Deleted snapshot {id}");
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /api/v1/snapshot/{id}
///
/// The body may carry a phase transition and/or a services replacement; the
/// file's mtime is always bumped, so an empty body is a pure heartbeat.
#[tracing::instrument(skip(state, body))]
async fn patch_snapshot(
    State(state): State<ManagerState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if !body.is_empty() {
        let patch: PatchRequest = serde_json::from_slice(&body)
            .map_err(|_| ApiError::validation("body", "invalid payload request"))?;

        match (&patch.phase, &patch.mode) {
            (Some(phase), Some(mode)) => {
                let mode = mode.parse::<PhaseMode>().map_err(|_| {
                    ApiError::validation("mode", "mode must be either 'start' or 'end'")
                })?;
                state.metadata.update_phase(&id, phase, mode).await?;
                log::info!("Snapshot {id}: phase '{phase}' {mode}");
            }
            (None, None) => {}
            _ => {
                return Err(ApiError::validation(
                    "phase",
                    "phase updates require both phase and mode",
                ));
            }
        }

        if let Some(services) = &patch.services {
            if !services.is_empty() {
                state.metadata.update_services(&id, services.clone()).await?;
                log::info!("Snapshot {id}: services updated");
            }
        }
    }

    state.files.touch(&id).await?;
    Ok(StatusCode::OK)
}

fn validate_snapshot_request(request: &mut SnapshotRequest) -> Result<(), ApiError> {
    if request.configs.is_empty() {
        return Err(ApiError::validation(
            "configs",
            "at least one config object is required",
        ));
    }
    for config in &request.configs {
        if config.hostnames.is_empty() {
            return Err(ApiError::validation(
                "configs.hostnames",
                "at least one cluster/hostname is required",
            ));
        }
        if config.port == 0 {
            return Err(ApiError::validation("configs.port", "port is required"));
        }
    }

    if request.credentials.username.is_empty() {
        return Err(ApiError::validation(
            "credentials.username",
            "username is required",
        ));
    }
    if request.credentials.password.is_empty() {
        return Err(ApiError::validation(
            "credentials.password",
            "password is required",
        ));
    }

    if request.scheme.is_empty() {
        request.scheme = "http".to_string();
    } else if request.scheme != "http" && request.scheme != "https" {
        return Err(ApiError::validation(
            "scheme",
            "scheme must be either 'http' or 'https'",
        ));
    }

    Ok(())
}
