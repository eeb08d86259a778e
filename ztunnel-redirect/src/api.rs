use crate::error::RedirectError;
use crate::redirect::RedirectArgs;
use crate::server::{Command, RedirectHandle, Reply, WorkerMetrics};
use crate::tables::{LogLevel, WorkloadEntry};
use axum::{
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use ztunnel_redirect_common::WorkloadInfo;

pub struct AppState {
    pub redirect: RedirectHandle,
    pub worker: WorkerMetrics,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
}

impl Metrics {
    fn new(worker: &WorkerMetrics) -> Self {
        let mut registry = Registry::default();
        registry.register(
            "ztunnel_redirect_requests",
            "Requests processed by the redirect worker",
            worker.processed.clone(),
        );
        registry.register(
            "ztunnel_redirect_request_failures",
            "Requests the redirect worker failed to apply",
            worker.failed.clone(),
        );
        Self { registry }
    }
}

// ── Request / Response Types ──────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    processed: u64,
    failed: u64,
}

#[derive(Deserialize)]
pub struct RedirectParams {
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize)]
pub struct LogLevelBody {
    level: String,
}

#[derive(Deserialize)]
pub struct HostIpsBody {
    ips: Vec<String>,
}

#[derive(Debug)]
pub struct ApiError(RedirectError);

impl From<RedirectError> for ApiError {
    fn from(e: RedirectError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            RedirectError::ServerStopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (self.status(), body).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new(&state.worker));

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/redirect", post(post_redirect))
        .route("/api/log-level", put(put_log_level))
        .route("/api/host-ips", put(put_host_ips))
        .route("/api/workloads", get(get_workloads))
        .route("/api/ztunnel", get(get_ztunnel))
        .route("/metrics", get({
            let m = metrics.clone();
            move || get_metrics(m.clone())
        }));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| match s.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(e) => {
                        tracing::warn!("Ignoring allowed_ips entry {:?}: {}", s, e);
                        None
                    }
                })
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    // If there is no ConnectInfo, allow (should not happen with into_make_service_with_connect_info).
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        processed: state.worker.processed.get(),
        failed: state.worker.failed.get(),
    })
}

/// Queues a redirect. With `?wait=true` the outcome is returned, otherwise
/// the request is only accepted.
async fn post_redirect(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RedirectParams>,
    Json(args): Json<RedirectArgs>,
) -> Result<Response, ApiError> {
    if params.wait {
        state.redirect.call(Command::Redirect(args)).await?;
        return Ok(Json(serde_json::json!({ "status": "ok" })).into_response());
    }
    state.redirect.accept_request(args).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn put_log_level(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LogLevelBody>,
) -> Result<StatusCode, ApiError> {
    let level: LogLevel = body.level.parse()?;
    state.redirect.call(Command::SetLogLevel(level)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_host_ips(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HostIpsBody>,
) -> Result<StatusCode, ApiError> {
    state.redirect.call(Command::UpdateHostIps(body.ips)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_workloads(State(state): State<Arc<AppState>>) -> Result<Json<Vec<WorkloadEntry>>, ApiError> {
    match state.redirect.call(Command::DumpWorkloads).await? {
        Reply::Workloads(entries) => Ok(Json(entries)),
        other => Err(unexpected(other)),
    }
}

async fn get_ztunnel(State(state): State<Arc<AppState>>) -> Result<Json<WorkloadInfo>, ApiError> {
    match state.redirect.call(Command::DumpZtunnel).await? {
        Reply::Ztunnel(info) => Ok(Json(info)),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: Reply) -> ApiError {
    tracing::error!(?reply, "unexpected reply from redirect worker");
    ApiError(RedirectError::ServerStopped)
}

async fn get_metrics(metrics: Arc<Metrics>) -> impl IntoResponse {
    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("Failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
