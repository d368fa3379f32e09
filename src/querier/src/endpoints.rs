//! Query-plane HTTP surface: Prometheus instant/range queries, raw and
//! phase-scoped metric rows, summaries, and the snapshot view.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use common::ApiError;
use common::couchbase::QueryClient;
use common::metadata::{MetadataError, MetadataStore};

use crate::metrics::{self, Projection};
use crate::query::promql::sqlbuilder::SqlBuilder;
use crate::query::promql::transformer::{self, PrometheusResponse, QueryRow};
use crate::query::promql::{self, DEFAULT_STEP, EvalContext, plan};
use crate::snapshot::SnapshotView;
use crate::summary;

#[derive(Clone)]
pub struct QuerierState {
    /// Absent when the backend could not be reached at boot; endpoints
    /// answer 503 until a restart.
    pub executor: Option<Arc<QueryClient>>,
    pub metadata: Arc<dyn MetadataStore>,
    pub ts_keyspace: String,
    pub metadata_keyspace: String,
}

pub fn router(state: QuerierState) -> Router {
    Router::new()
        .route("/metrics/health", get(health))
        .route("/query", get(query_instant))
        .route("/query_range", get(query_range))
        .route("/series", get(series))
        .route("/snapshots/:id", get(get_snapshot))
        .route("/snapshots/:id/metrics/:name", get(get_metric))
        .route("/snapshots/:id/metrics/:name/summary", get(get_metric_summary))
        .route("/snapshots/:id/metrics/:name/phases/:phase", get(get_metric_phase))
        .route(
            "/snapshots/:id/metrics/:name/phases/:phase/summary",
            get(get_metric_phase_summary),
        )
        // the dashboard is a browser app on another origin
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Error wrapper producing the `{success: false, error}` envelope used by
/// the snapshot and metric endpoints.
struct EnvelopeError(ApiError);

impl IntoResponse for EnvelopeError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let body = json!({"success": false, "error": self.0.to_string()});
        (status, Json(body)).into_response()
    }
}

impl From<ApiError> for EnvelopeError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl From<MetadataError> for EnvelopeError {
    fn from(err: MetadataError) -> Self {
        Self(err.into())
    }
}

fn executor(state: &QuerierState) -> Result<Arc<QueryClient>, ApiError> {
    state
        .executor
        .clone()
        .ok_or_else(|| ApiError::ServiceUnavailable("query backend is not available".to_string()))
}

fn prom_error(status: StatusCode, message: &str, error_type: &str) -> Response {
    (status, Json(PrometheusResponse::error(message, error_type))).into_response()
}

/// GET /metrics/health
#[tracing::instrument]
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "query plane is healthy",
        "service": "cbscope-querier",
    }))
}

/// GET /query?query=...&time=...
#[tracing::instrument(skip(state, params))]
async fn query_instant(
    State(state): State<QuerierState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(query) = params.get("query") else {
        return prom_error(
            StatusCode::BAD_REQUEST,
            "query parameter is required",
            "bad_data",
        );
    };

    let time = match params.get("time") {
        Some(raw) => match promql::parse_time(raw) {
            Ok(time) => time,
            Err(err) => {
                return prom_error(StatusCode::BAD_REQUEST, &err.to_string(), "bad_data");
            }
        },
        None => Utc::now(),
    };

    let ctx = EvalContext::instant(time, None);
    run_promql(&state, query, &ctx).await
}

/// GET /query_range?query=...&start=...&end=...&step=...
#[tracing::instrument(skip(state, params))]
async fn query_range(
    State(state): State<QuerierState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(query) = params.get("query") else {
        return prom_error(
            StatusCode::BAD_REQUEST,
            "query parameter is required",
            "bad_data",
        );
    };
    let (Some(start_raw), Some(end_raw)) = (params.get("start"), params.get("end")) else {
        return prom_error(
            StatusCode::BAD_REQUEST,
            "start and end parameters are required",
            "bad_data",
        );
    };

    let parsed = promql::parse_time(start_raw).and_then(|start| {
        promql::parse_time(end_raw).map(|end| (start, end))
    });
    let (start, end) = match parsed {
        Ok(window) => window,
        Err(err) => return prom_error(StatusCode::BAD_REQUEST, &err.to_string(), "bad_data"),
    };

    let step = match params.get("step") {
        Some(raw) => match promql::parse_step(raw) {
            Ok(step) => step,
            Err(err) => {
                return prom_error(StatusCode::BAD_REQUEST, &err.to_string(), "bad_data");
            }
        },
        None => DEFAULT_STEP,
    };

    let ctx = EvalContext::range(start, end, step, None);
    run_promql(&state, query, &ctx).await
}

/// GET /series?match[]=...
///
/// Discovery stub: always an empty result.
#[tracing::instrument(skip(params))]
async fn series(Query(params): Query<HashMap<String, String>>) -> Response {
    if !params.contains_key("match[]") {
        return prom_error(
            StatusCode::BAD_REQUEST,
            "match[] parameter is required",
            "bad_data",
        );
    }
    (
        StatusCode::OK,
        Json(PrometheusResponse::success("series", Vec::new())),
    )
        .into_response()
}

/// Parse, plan, lower, execute, and transform one PromQL query. Failed
/// sub-queries of a batch are logged and skipped; the transformer works
/// with whatever rows were collected.
async fn run_promql(state: &QuerierState, query: &str, ctx: &EvalContext) -> Response {
    let client = match executor(state) {
        Ok(client) => client,
        Err(err) => {
            return prom_error(StatusCode::SERVICE_UNAVAILABLE, &err.to_string(), "unavailable");
        }
    };

    let expr = match promql::parser::parse(query) {
        Ok(expr) => expr,
        Err(err) => return prom_error(StatusCode::BAD_REQUEST, &err.to_string(), "bad_data"),
    };
    let plan = match plan::plan(&expr, ctx.snapshot_id.as_deref()) {
        Ok(plan) => plan,
        Err(err) => return prom_error(StatusCode::BAD_REQUEST, &err.to_string(), "bad_data"),
    };
    log::info!("Query plan: {plan}");

    let statements = SqlBuilder::new(&plan, ctx, &state.ts_keyspace).build();
    log::debug!("Generated {} SQL++ statement(s)", statements.len());

    let mut rows = Vec::new();
    for statement in &statements {
        match client.execute(statement, Vec::new()).await {
            Ok(results) => rows.extend(results.iter().map(QueryRow::from_json)),
            Err(err) => log::warn!("Sub-query failed, continuing with partial rows: {err}"),
        }
    }

    let response = transformer::transform(rows, &plan, ctx);
    (StatusCode::OK, Json(response)).into_response()
}

/// GET /snapshots/{id}
#[tracing::instrument(skip(state))]
async fn get_snapshot(
    State(state): State<QuerierState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, EnvelopeError> {
    let doc = state.metadata.get(&id).await?;
    let view = SnapshotView::new(doc);
    log::info!(
        "Returning snapshot {id} with {} dashboards",
        view.dashboards.len()
    );
    Ok(Json(json!({"success": true, "data": view})))
}

/// GET /snapshots/{id}/metrics/{name}
#[tracing::instrument(skip(state, params))]
async fn get_metric(
    State(state): State<QuerierState>,
    Path((id, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, EnvelopeError> {
    let client = executor(&state)?;
    let (filters, _) = summary::parse_query_params(&params);

    let statement = metrics::snapshot_metric_query(
        &state.ts_keyspace,
        &state.metadata_keyspace,
        &name,
        &id,
        &filters,
        Projection::TimeAndValue,
    );
    let rows = client
        .execute(&statement, Vec::new())
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;

    let points = metrics::extract_points(&rows);
    Ok(Json(json!({
        "success": true,
        "metric": name,
        "snapshot": id,
        "values": points,
        "count": points.len(),
    })))
}

/// GET /snapshots/{id}/metrics/{name}/phases/{phase}
#[tracing::instrument(skip(state, params))]
async fn get_metric_phase(
    State(state): State<QuerierState>,
    Path((id, name, phase)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, EnvelopeError> {
    let client = executor(&state)?;
    let (filters, _) = summary::parse_query_params(&params);

    let statement = metrics::phase_metric_query(
        &state.ts_keyspace,
        &state.metadata_keyspace,
        &name,
        &id,
        &phase,
        &filters,
        Projection::TimeAndValue,
    );
    let rows = client
        .execute(&statement, Vec::new())
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;

    let points = metrics::extract_points(&rows);
    Ok(Json(json!({
        "success": true,
        "metric": name,
        "snapshot": id,
        "phase": phase,
        "values": points,
        "count": points.len(),
    })))
}

/// GET /snapshots/{id}/metrics/{name}/summary?p=0.5,0.95
#[tracing::instrument(skip(state, params))]
async fn get_metric_summary(
    State(state): State<QuerierState>,
    Path((id, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, EnvelopeError> {
    let client = executor(&state)?;
    let (filters, percentiles) = summary::parse_query_params(&params);

    let statement = metrics::snapshot_metric_query(
        &state.ts_keyspace,
        &state.metadata_keyspace,
        &name,
        &id,
        &filters,
        Projection::ValueOnly,
    );
    let rows = client
        .execute(&statement, Vec::new())
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;

    let values = metrics::extract_values(&rows);
    let summary = summary::compute_summary(&values, &percentiles);
    Ok(Json(json!({
        "success": true,
        "metric": name,
        "snapshot": id,
        "summary": summary,
    })))
}

/// GET /snapshots/{id}/metrics/{name}/phases/{phase}/summary?p=...
#[tracing::instrument(skip(state, params))]
async fn get_metric_phase_summary(
    State(state): State<QuerierState>,
    Path((id, name, phase)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, EnvelopeError> {
    let client = executor(&state)?;
    let (filters, percentiles) = summary::parse_query_params(&params);

    let statement = metrics::phase_metric_query(
        &state.ts_keyspace,
        &state.metadata_keyspace,
        &name,
        &id,
        &phase,
        &filters,
        Projection::ValueOnly,
    );
    let rows = client
        .execute(&statement, Vec::new())
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;

    let values = metrics::extract_values(&rows);
    let summary = summary::compute_summary(&values, &percentiles);
    Ok(Json(json!({
        "success": true,
        "metric": name,
        "snapshot": id,
        "phase": phase,
        "summary": summary,
    })))
}
