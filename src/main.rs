mod cache;
mod decoder;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod query;
mod refine;
mod relevance;
mod research;
mod retry;
mod search;
mod security;
mod store;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ExtractedItem, ScanRequest, ScanResponse};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "argus.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let pipeline = Pipeline::from_env();
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    spawn_cache_sweeper(pipeline.cache());
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        pipeline,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/scans", post(create_scan))
        .route("/scans/refine", post(refine_scan))
        .nest(
            "/stages",
            Router::new()
                .route("/decode", post(stage_decode))
                .route("/plan_queries", post(stage_plan_queries))
                .route("/score", post(stage_score)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/scans", post(enqueue_scan_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "argus.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, ScanResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Periodic TTL sweep over the research cache. Market data past its TTL is
/// cleared in batches; decode info is left alone.
fn spawn_cache_sweeper(cache: Arc<cache::ResearchCache>) {
    let interval_secs = std::env::var("CACHE_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(3600);
    let batch = std::env::var("CACHE_SWEEP_BATCH")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(500);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cleared = cache.sweep_stale(batch);
            metrics::cache_sweep(cleared);
        }
    });
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "argus-api-rs",
    }))
}

/// Optional shared-secret gate for operational endpoints. When the env var is
/// unset the endpoint is open; when set, the named header must match.
fn header_gate(headers: &axum::http::HeaderMap, env_var: &str, header_name: &str) -> bool {
    match std::env::var(env_var) {
        Ok(secret) => headers
            .get(header_name)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|presented| presented == secret),
        Err(_) => true,
    }
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if !header_gate(&headers, "OPENAPI_KEY", "X-Docs-Key") {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "docs",
            "unauthorized",
        )));
    }
    Ok(Json((*state.openapi).clone()))
}

const SWAGGER_PAGE: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8"/>
  <title>Argus API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css"/>
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;

async fn swagger_ui() -> axum::response::Html<&'static str> {
    axum::response::Html(SWAGGER_PAGE)
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if !header_gate(&headers, "METRICS_KEY", "X-Metrics-Key") {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Run the scanned item → price findings pipeline.
///
/// - Method: `POST`
/// - Path: `/scans`
/// - Auth: `Authorization: Bearer <key>` or `X-Argus-Key: <key>`
/// - Body: `ScanRequest`
/// - Response: `ScanResponse` (status, per-stage transcript, research, findings)
async fn create_scan(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    crate::metrics::inc_requests("/scans");
    info!(
        target = "argus.api",
        org_id = %context.org_id,
        api_key = %context.api_key_id,
        "scan pipeline invoked",
    );

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let Some(key) = idempotency_key else {
        return Ok(Json(state.pipeline.run(payload).await?));
    };

    if let Some(replayed) = lookup_idempotent(&state, &key).await {
        return Ok(Json(replayed));
    }
    let response = state.pipeline.run(payload).await?;
    store_idempotent(&state, key, &response).await;
    Ok(Json(response))
}

/// Prior response for this key, from Redis when configured, otherwise the
/// in-process map.
async fn lookup_idempotent(state: &AppState, key: &str) -> Option<ScanResponse> {
    match &state.redis {
        Some(client) => idempotency::redis_get(client, key).await,
        None => state.idempotency.lock().await.get(key).cloned(),
    }
}

async fn store_idempotent(state: &AppState, key: String, response: &ScanResponse) {
    match &state.redis {
        Some(client) => {
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, response, ttl).await;
        }
        None => {
            state.idempotency.lock().await.insert(key, response.clone());
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefineRequest {
    item: ExtractedItem,
    research: models::ResearchResult,
}

/// Re-run refinement over previously collected research, without searching
/// again.
///
/// - Method: `POST`
/// - Path: `/scans/refine`
/// - Body: `RefineRequest` (the item plus a prior research result)
/// - Response: `RefinedFindings`
async fn refine_scan(
    State(state): State<AppState>,
    Json(payload): Json<RefineRequest>,
) -> Result<Json<models::RefinedFindings>, AppError> {
    crate::metrics::inc_requests("/scans/refine");
    let refiner = refine::Refiner::new(state.pipeline.llm.clone());
    let findings = refiner.refine(&payload.item, &payload.research).await;
    Ok(Json(findings))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_scan_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ScanRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/scans");
    info!(
        target = "argus.api",
        org_id = %context.org_id,
        "scan job enqueued",
    );
    let id = state
        .queue
        .enqueue_scan(payload)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "not_found",
        )))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Config => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineErrorKind::Provider => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.user_message()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

// -------- Stage endpoints (manual granular control) --------

#[derive(Debug, Deserialize)]
struct DecodeStageRequest {
    brand: String,
    style_number: String,
}

#[derive(Debug, Serialize)]
struct DecodeStageResponse {
    decoded: Option<models::DecodedStyleInfo>,
}

async fn stage_decode(
    Json(req): Json<DecodeStageRequest>,
) -> Result<Json<DecodeStageResponse>, AppError> {
    crate::metrics::inc_requests("/stages/decode");
    if req.brand.trim().is_empty() || req.style_number.trim().is_empty() {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "decode",
            "brand and style_number are required",
        )));
    }
    let decoded = decoder::decode(&req.brand, &req.style_number);
    Ok(Json(DecodeStageResponse { decoded }))
}

#[derive(Debug, Serialize)]
struct PlanQueriesResponse {
    general: Vec<String>,
    platform_specific: Vec<String>,
    sold_cascade: Vec<String>,
    category: Option<String>,
}

async fn stage_plan_queries(
    Json(item): Json<ExtractedItem>,
) -> Result<Json<PlanQueriesResponse>, AppError> {
    crate::metrics::inc_requests("/stages/plan_queries");
    let decoded = match (item.brand_trimmed(), item.style_number_trimmed()) {
        (Some(brand), Some(style)) => decoder::decode(brand, style),
        _ => None,
    };
    let category = research::category_for(&item, decoded.as_ref());
    let plan = query::build_queries(&research::planner_item(&item, decoded.as_ref()), category);
    Ok(Json(PlanQueriesResponse {
        general: plan.general,
        platform_specific: plan.platform_specific,
        sold_cascade: plan.sold_cascade,
        category: category.map(|def| def.name.to_string()),
    }))
}

#[derive(Debug, Deserialize)]
struct ScoreStageRequest {
    item: ExtractedItem,
    listings: Vec<models::Listing>,
}

#[derive(Debug, Serialize)]
struct ScoredListing {
    listing: models::Listing,
    score: f64,
    breakdown: Vec<relevance::ScoreComponent>,
}

async fn stage_score(
    Json(req): Json<ScoreStageRequest>,
) -> Result<Json<Vec<ScoredListing>>, AppError> {
    crate::metrics::inc_requests("/stages/score");
    let config = relevance::ScoringConfig::from_env();
    let category = research::category_for(&req.item, None);
    let gender = research::gender_for_item(&req.item);
    let scored = req
        .listings
        .into_iter()
        .map(|mut listing| {
            let result = relevance::score_listing(&listing, &req.item, category, gender, &config);
            listing.relevance_score = Some(result.score);
            ScoredListing {
                listing,
                score: result.score,
                breakdown: result.breakdown,
            }
        })
        .collect();
    Ok(Json(scored))
}
