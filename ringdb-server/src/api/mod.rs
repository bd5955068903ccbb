//! HTTP API endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use ringdb_core::query::{QueryEngine, QueryOutput, QueryRequest};
use ringdb_core::{MetricId, MetricRef, RingError, Selector, TagMap, Timestamp, Tsdb};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state
pub struct App {
    pub tsdb: Tsdb,
    pub engine: QueryEngine,
}

pub type AppState = Arc<App>;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create the API router
pub fn create_router(app: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ingest/gauge", post(ingest_gauge))
        .route("/ingest/counter", post(ingest_counter))
        .route("/query", post(query))
        .route("/metrics", get(list_metrics))
        .route("/metrics/lookup", post(lookup_metrics))
        .route("/metrics/names", get(metric_names))
        .route("/metrics/tag-values", post(tag_values))
        .route("/metrics/:id/series", get(metric_series))
        .route("/metrics/:id/retention", post(update_retention))
        .route("/metrics/:id", delete(delete_metric))
        .route("/dashboards", get(list_dashboards).post(save_dashboard))
        .route("/dashboards/:slug", get(get_dashboard).delete(delete_dashboard))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct GaugePayload {
    pub metric_id: Option<MetricId>,
    pub name: Option<String>,
    pub ts: Timestamp,
    pub value: f64,
    #[serde(default)]
    pub tags: Option<TagMap>,
    pub step: Option<u32>,
    pub slots: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CounterPayload {
    pub metric_id: Option<MetricId>,
    pub name: Option<String>,
    pub ts: Timestamp,
    pub raw_value: f64,
    #[serde(default)]
    pub tags: Option<TagMap>,
    pub step: Option<u32>,
    pub slots: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub metric_id: MetricId,
}

#[derive(Debug, Deserialize)]
pub struct QueryPayload {
    #[serde(default)]
    pub metric_ids: Vec<MetricId>,
    #[serde(default)]
    pub selectors: Vec<Selector>,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub sql: String,
}

#[derive(Debug, Deserialize)]
pub struct LookupPayload {
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Option<TagMap>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TagValuesPayload {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetentionPayload {
    pub step: u32,
    pub slots: u32,
}

#[derive(Debug, Deserialize)]
pub struct SeriesParams {
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    #[serde(default = "default_bucket")]
    pub bucket: i64,
}

fn default_bucket() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct DashboardPayload {
    pub slug: String,
    pub title: String,
    pub definition: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ============================================================================
// Error mapping
// ============================================================================

fn api_error(err: RingError) -> ApiError {
    let status = match &err {
        RingError::Validation(_) | RingError::SqlParse(_) => StatusCode::BAD_REQUEST,
        RingError::NotFound(_) => StatusCode::NOT_FOUND,
        RingError::Conflict(_) | RingError::TypeMismatch(_) => StatusCode::CONFLICT,
        RingError::LimitExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
        RingError::BackendTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
        RingError::BackendFatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorResponse {
        error: err.to_string(),
        code: err.kind_code(),
    };
    (status, Json(body))
}

fn metric_ref(
    metric_id: Option<MetricId>,
    name: Option<String>,
    tags: Option<TagMap>,
) -> Result<MetricRef, ApiError> {
    match (metric_id, name) {
        (Some(id), _) => Ok(MetricRef::ById(id)),
        (None, Some(name)) if !name.is_empty() => Ok(MetricRef::ByName {
            name,
            tags: tags.unwrap_or_default(),
        }),
        _ => Err(api_error(RingError::Validation(
            "metric_id or name is required".into(),
        ))),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: ringdb_core::VERSION,
    })
}

async fn ingest_gauge(
    State(app): State<AppState>,
    Json(payload): Json<GaugePayload>,
) -> ApiResult<IngestResponse> {
    let metric = metric_ref(payload.metric_id, payload.name, payload.tags)?;
    let metric_id = app
        .tsdb
        .write_gauge(&metric, payload.ts, payload.value, payload.step, payload.slots)
        .map_err(api_error)?;
    Ok(Json(IngestResponse { metric_id }))
}

async fn ingest_counter(
    State(app): State<AppState>,
    Json(payload): Json<CounterPayload>,
) -> ApiResult<IngestResponse> {
    let metric = metric_ref(payload.metric_id, payload.name, payload.tags)?;
    let metric_id = app
        .tsdb
        .write_counter(&metric, payload.ts, payload.raw_value, payload.step, payload.slots)
        .map_err(api_error)?;
    Ok(Json(IngestResponse { metric_id }))
}

async fn query(
    State(app): State<AppState>,
    Json(payload): Json<QueryPayload>,
) -> ApiResult<QueryOutput> {
    let request = QueryRequest {
        metric_ids: payload.metric_ids,
        selectors: payload.selectors,
        start_ts: payload.start_ts,
        end_ts: payload.end_ts,
        sql: payload.sql,
    };
    let output = app.engine.run(&request).map_err(api_error)?;
    Ok(Json(output))
}

async fn list_metrics(State(app): State<AppState>) -> ApiResult<serde_json::Value> {
    let metrics = app.tsdb.registry().list().map_err(api_error)?;
    Ok(Json(serde_json::json!({ "metrics": metrics })))
}

async fn lookup_metrics(
    State(app): State<AppState>,
    Json(payload): Json<LookupPayload>,
) -> ApiResult<serde_json::Value> {
    let limit = payload
        .limit
        .unwrap_or(ringdb_core::config::DEFAULT_LOOKUP_LIMIT);
    let page = app
        .tsdb
        .registry()
        .lookup(
            payload.name.as_deref(),
            &payload.tags.unwrap_or_default(),
            limit,
        )
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "metrics": page.metrics,
        "hit_limit": page.hit_limit,
        "limit": limit.min(ringdb_core::config::MAX_LOOKUP_LIMIT),
    })))
}

async fn metric_names(State(app): State<AppState>) -> ApiResult<serde_json::Value> {
    let names = app.tsdb.registry().names(1000).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "names": names })))
}

async fn tag_values(
    State(app): State<AppState>,
    Json(payload): Json<TagValuesPayload>,
) -> ApiResult<serde_json::Value> {
    let tags = app
        .tsdb
        .registry()
        .tag_values(payload.name.as_deref())
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "tags": tags })))
}

/// Pre-bucketed series for one metric; counters are converted to per-bucket
/// rates at query time
async fn metric_series(
    State(app): State<AppState>,
    Path(metric_id): Path<MetricId>,
    Query(params): Query<SeriesParams>,
) -> ApiResult<serde_json::Value> {
    if params.start_ts > params.end_ts {
        return Err(api_error(RingError::Validation(
            "start_ts must be <= end_ts".into(),
        )));
    }
    if params.bucket <= 0 {
        return Err(api_error(RingError::Validation(
            "bucket must be positive".into(),
        )));
    }
    let descriptor = app.tsdb.describe(metric_id).map_err(api_error)?;

    let sql = if descriptor.metric_type == ringdb_core::MetricType::Counter {
        format!(
            "WITH bucketed AS ( \
               SELECT ts_bucket(ts, {bucket}) AS bucket, max(value) AS value \
               FROM samples \
               WHERE metric_id = {id} AND ts >= {start} AND ts <= {end} \
               GROUP BY bucket \
             ) \
             SELECT bucket, bucket_rate(value, lag(value) OVER (ORDER BY bucket), {bucket}) AS value \
             FROM bucketed ORDER BY bucket",
            bucket = params.bucket,
            id = metric_id,
            start = params.start_ts,
            end = params.end_ts,
        )
    } else {
        format!(
            "SELECT ts_bucket(ts, {bucket}) AS bucket, avg(value) AS value \
             FROM samples \
             WHERE metric_id = {id} AND ts >= {start} AND ts <= {end} \
             GROUP BY bucket ORDER BY bucket",
            bucket = params.bucket,
            id = metric_id,
            start = params.start_ts,
            end = params.end_ts,
        )
    };

    let request = QueryRequest {
        metric_ids: vec![metric_id],
        selectors: Vec::new(),
        start_ts: params.start_ts,
        end_ts: params.end_ts,
        sql,
    };
    let output = app.engine.run(&request).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "rows": output.rows })))
}

async fn update_retention(
    State(app): State<AppState>,
    Path(metric_id): Path<MetricId>,
    Json(payload): Json<RetentionPayload>,
) -> ApiResult<OkResponse> {
    app.tsdb
        .registry()
        .retention_rewrite(metric_id, payload.step, payload.slots)
        .map_err(api_error)?;
    Ok(Json(OkResponse { ok: true }))
}

async fn delete_metric(
    State(app): State<AppState>,
    Path(metric_id): Path<MetricId>,
) -> ApiResult<OkResponse> {
    app.tsdb.registry().delete(metric_id).map_err(api_error)?;
    Ok(Json(OkResponse { ok: true }))
}

async fn list_dashboards(State(app): State<AppState>) -> ApiResult<serde_json::Value> {
    let dashboards = app.tsdb.dashboards().list().map_err(api_error)?;
    Ok(Json(serde_json::json!({ "dashboards": dashboards })))
}

async fn save_dashboard(
    State(app): State<AppState>,
    Json(payload): Json<DashboardPayload>,
) -> ApiResult<OkResponse> {
    app.tsdb
        .dashboards()
        .save(&payload.slug, &payload.title, &payload.definition)
        .map_err(api_error)?;
    Ok(Json(OkResponse { ok: true }))
}

async fn get_dashboard(
    State(app): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<serde_json::Value> {
    let dashboard = app.tsdb.dashboards().get(&slug).map_err(api_error)?;
    Ok(Json(dashboard))
}

async fn delete_dashboard(
    State(app): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<OkResponse> {
    app.tsdb.dashboards().delete(&slug).map_err(api_error)?;
    Ok(Json(OkResponse { ok: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringdb_core::backend::MemoryBackend;

    fn app() -> AppState {
        let backend = Arc::new(MemoryBackend::new());
        Arc::new(App {
            tsdb: Tsdb::new(backend.clone()),
            engine: QueryEngine::new(backend),
        })
    }

    #[tokio::test]
    async fn test_ingest_then_series() {
        let app = app();
        let payload = GaugePayload {
            metric_id: None,
            name: Some("temp".into()),
            ts: 120,
            value: 21.0,
            tags: None,
            step: Some(1),
            slots: Some(600),
        };
        let Json(resp) = ingest_gauge(State(app.clone()), Json(payload)).await.unwrap();
        let metric_id = resp.metric_id;

        let Json(series) = metric_series(
            State(app),
            Path(metric_id),
            Query(SeriesParams { start_ts: 0, end_ts: 600, bucket: 60 }),
        )
        .await
        .unwrap();
        let rows = series["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["bucket"], serde_json::json!(120));
        assert_eq!(rows[0]["value"], serde_json::json!(21.0));
    }

    #[tokio::test]
    async fn test_counter_series_auto_rates() {
        let app = app();
        for (ts, raw) in [(0i64, 100.0), (60, 160.0), (120, 180.0)] {
            let payload = CounterPayload {
                metric_id: Some(42),
                name: None,
                ts,
                raw_value: raw,
                tags: None,
                step: Some(60),
                slots: Some(10),
            };
            ingest_counter(State(app.clone()), Json(payload)).await.unwrap();
        }
        let Json(series) = metric_series(
            State(app),
            Path(42),
            Query(SeriesParams { start_ts: 0, end_ts: 180, bucket: 60 }),
        )
        .await
        .unwrap();
        let rows = series["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["value"], serde_json::Value::Null);
        assert_eq!(rows[1]["value"], serde_json::json!(1.0));
    }

    #[tokio::test]
    async fn test_ingest_requires_identity() {
        let app = app();
        let payload = GaugePayload {
            metric_id: None,
            name: None,
            ts: 0,
            value: 0.0,
            tags: None,
            step: None,
            slots: None,
        };
        let err = ingest_gauge(State(app), Json(payload)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(err.1.code, "VALIDATION");
    }

    #[tokio::test]
    async fn test_unbounded_query_is_400() {
        let app = app();
        ingest_gauge(
            State(app.clone()),
            Json(GaugePayload {
                metric_id: Some(1),
                name: None,
                ts: 0,
                value: 1.0,
                tags: None,
                step: None,
                slots: None,
            }),
        )
        .await
        .unwrap();
        let payload = QueryPayload {
            metric_ids: vec![1],
            selectors: Vec::new(),
            start_ts: 0,
            end_ts: 10,
            sql: "SELECT * FROM samples".into(),
        };
        let err = query(State(app), Json(payload)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retention_on_counter_is_409() {
        let app = app();
        ingest_counter(
            State(app.clone()),
            Json(CounterPayload {
                metric_id: Some(7),
                name: None,
                ts: 0,
                raw_value: 1.0,
                tags: None,
                step: Some(1),
                slots: Some(10),
            }),
        )
        .await
        .unwrap();
        let err = update_retention(
            State(app),
            Path(7),
            Json(RetentionPayload { step: 2, slots: 10 }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
        assert_eq!(err.1.code, "TYPE_MISMATCH");
    }
}
