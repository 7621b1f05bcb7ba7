mod rate_limit;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Json, Path, Query, State};
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use haven_agents::{AgentRouter, Concierge, MessageInput};
use haven_core::{ConstraintError, RegionId};
use haven_ml::HavenMlStack;
use haven_observability::AppMetrics;
use haven_storage::{RegionStore, ServiceCatalog, Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use crate::rate_limit::{IpRateLimiter, RateDecision};

pub const DEFAULT_API_KEY: &str = "dev-haven-key";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_key: String,
    pub rate_limit_window: Duration,
    pub rate_limit_max: usize,
    pub router_threshold: f32,
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: DEFAULT_API_KEY.to_string(),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 120,
            router_threshold: haven_agents::DEFAULT_ROUTER_THRESHOLD,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: env::var("HAVEN_API_KEY")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.api_key),
            rate_limit_window: env::var("HAVEN_API_RATE_LIMIT_WINDOW_SECONDS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            rate_limit_max: env::var("HAVEN_API_RATE_LIMIT_MAX")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(defaults.rate_limit_max),
            router_threshold: AgentRouter::threshold_from_env(),
            allowed_origins: env::var("HAVEN_ALLOWED_ORIGINS")
                .ok()
                .map(|value| {
                    value
                        .split(',')
                        .map(|origin| origin.trim().trim_end_matches('/').to_string())
                        .filter(|origin| !origin.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.allowed_origins),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub concierge: Arc<Concierge<Store>>,
    pub store: Arc<Store>,
    pub metrics: Arc<AppMetrics>,
    pub api_key: String,
    pub limiter: IpRateLimiter,
    pub allowed_origins: Arc<Vec<String>>,
    pub burn_enabled: bool,
}

impl ApiState {
    pub fn new(store: Store, ml_stack: &HavenMlStack, config: ApiConfig) -> Self {
        let store = Arc::new(store);
        let metrics = AppMetrics::shared();
        let router = AgentRouter::from_stack(ml_stack, config.router_threshold);

        Self {
            concierge: Arc::new(Concierge::new(router, store.clone(), metrics.clone())),
            store,
            metrics,
            api_key: config.api_key,
            limiter: IpRateLimiter::new(config.rate_limit_window, config.rate_limit_max),
            allowed_origins: Arc::new(config.allowed_origins),
            burn_enabled: ml_stack.burn_enabled,
        }
    }
}

/// Reads `HAVEN_*` environment variables. Without `HAVEN_DATABASE_URL` the
/// catalog lives in memory.
pub async fn state_from_env() -> Result<ApiState> {
    let store = match env::var("HAVEN_DATABASE_URL") {
        Ok(database_url) => Store::sqlite(&database_url)
            .await
            .with_context(|| format!("failed to open catalog at {database_url}"))?,
        Err(_) => Store::memory(),
    };
    let ml_stack = HavenMlStack::load_default();
    let state = ApiState::new(store, &ml_stack, ApiConfig::from_env());

    info!(
        backend = state.store.backend_name(),
        burn_enabled = state.burn_enabled,
        "haven api state ready"
    );
    Ok(state)
}

pub async fn build_app() -> Result<Router> {
    Ok(build_router(state_from_env().await?))
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/route", post(route_message))
        .route("/v1/message", post(handle_message))
        .route("/v1/regions", get(list_regions))
        .route("/v1/regions/:id/path", get(region_path))
        .route("/v1/regions/:id/services", get(region_services))
        .route("/v1/service_types", get(service_types))
        .layer(build_cors_layer(&state.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(RequestBodyLimitLayer::new(16 * 1024))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp_utc: String,
    backend: &'static str,
    burn_enabled: bool,
    metrics: haven_observability::MetricsSnapshot,
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let payload = HealthResponse {
        status: "ok",
        timestamp_utc: chrono::Utc::now().to_rfc3339(),
        backend: state.store.backend_name(),
        burn_enabled: state.burn_enabled,
        metrics: state.metrics.snapshot(),
    };
    (StatusCode::OK, Json(payload))
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    text: String,
}

async fn route_message(
    State(state): State<ApiState>,
    Json(input): Json<RouteRequest>,
) -> impl IntoResponse {
    state.metrics.inc_request();
    let decision = state.concierge.route(&input.text);
    (StatusCode::OK, Json(decision))
}

async fn handle_message(
    State(state): State<ApiState>,
    Json(input): Json<MessageInput>,
) -> Response {
    if let Err(err) = input.origin() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_origin", err.to_string());
    }

    match state.concierge.handle_message(input).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(err) => {
            error!(error = %err, "message handling failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "message_failed",
                err.to_string(),
            )
        }
    }
}

async fn list_regions(State(state): State<ApiState>) -> Response {
    match state.store.list_regions().await {
        Ok(regions) => (StatusCode::OK, Json(regions)).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn region_path(State(state): State<ApiState>, Path(id): Path<i64>) -> Response {
    match state.store.get_path(RegionId(id)).await {
        Ok(path) => {
            let names = path.iter().map(|region| region.name.clone()).collect::<Vec<_>>();
            (
                StatusCode::OK,
                Json(json!({
                    "region_id": id,
                    "names": names,
                    "regions": path,
                })),
            )
                .into_response()
        }
        Err(err) => store_error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServicesQuery {
    #[serde(default)]
    recursive: bool,
}

async fn region_services(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Query(query): Query<ServicesQuery>,
) -> Response {
    let region_id = RegionId(id);
    match state.store.get_region(region_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return store_error_response(ConstraintError::RegionNotFound(region_id).into()),
        Err(err) => return store_error_response(err),
    }

    match state.store.query_services(region_id, query.recursive).await {
        Ok(services) => (StatusCode::OK, Json(services)).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn service_types(State(state): State<ApiState>) -> Response {
    match state.store.service_types().await {
        Ok(types) => (StatusCode::OK, Json(types)).into_response(),
        Err(err) => store_error_response(err),
    }
}

fn error_response(status: StatusCode, code: &'static str, message: String) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message
        })),
    )
        .into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match err.as_constraint() {
        Some(ConstraintError::RegionNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "region_not_found", err.to_string())
        }
        Some(_) => error_response(StatusCode::BAD_REQUEST, "constraint_violation", err.to_string()),
        None => {
            error!(error = %err, "storage failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "the service catalog is unavailable".to_string(),
            )
        }
    }
}

fn is_public_endpoint(path: &str) -> bool {
    path == "/health"
}

async fn api_key_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS || is_public_endpoint(request.uri().path()) {
        return next.run(request).await;
    }

    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if header_key != state.api_key {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid x-api-key".to_string(),
        );
    }

    next.run(request).await
}

async fn rate_limit_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS || is_public_endpoint(request.uri().path()) {
        return next.run(request).await;
    }

    let ip = request_ip(&request);
    if let RateDecision::Limited { retry_after } = state.limiter.check(&ip) {
        let mut response = error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "rate limit exceeded for this IP".to_string(),
        );
        let seconds = retry_after.as_secs().max(1);
        if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
    }

    next.run(request).await
}

fn request_ip(request: &Request<Body>) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

fn build_cors_layer(allowed_origins: &Arc<Vec<String>>) -> CorsLayer {
    let origins = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-api-key"),
        ])
}
