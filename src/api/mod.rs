//! Master-side HTTP surface: C5 WorkerRegistry's `/workers/*` (spec §4.5),
//! a small admin surface for C4 SlaveManager and C9 HumanRequestStore, and
//! the `/stats` observability endpoint (spec §6.1, §11).

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::human_requests::HumanRequestStore;
use crate::models::HumanRequest;
use crate::orchestrator::Orchestrator;
use crate::rate_limit::{rate_limit_middleware, RateLimitState};
use crate::worker_registry::AssignedWork;
use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct ApiState {
    orchestrator: Arc<Orchestrator>,
    human_requests: Arc<HumanRequestStore>,
    poll_wait: std::time::Duration,
    admin_token: Option<Arc<String>>,
}

pub struct ApiServer {
    host: String,
    port: u16,
    router: Router,
}

impl ApiServer {
    pub fn new(config: &Config, orchestrator: Arc<Orchestrator>, human_requests: Arc<HumanRequestStore>) -> Self {
        let state = ApiState {
            orchestrator,
            human_requests,
            poll_wait: config.master.poll_wait,
            admin_token: config.master.admin_token.clone().map(Arc::new),
        };

        if state.admin_token.is_none() {
            warn!("MASTER_ADMIN_TOKEN not set; /slaves and /human-requests admin routes are unauthenticated");
        }

        let rate_limiter = RateLimitState::default();

        let worker_routes = Router::new()
            .route("/workers/register", post(register_worker))
            .route("/workers/{id}/heartbeat", post(heartbeat))
            .route("/workers/{id}/poll", get(poll))
            .route("/workers/{id}/result", post(post_result));

        let admin_routes = Router::new()
            .route("/slaves", get(list_slaves).post(register_slave))
            .route("/slaves/{id}", delete(remove_slave))
            .route("/human-requests/pending", get(list_pending_human_requests))
            .route("/human-requests/{id}/approve", post(approve_human_request))
            .route("/human-requests/{id}/reject", post(reject_human_request))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

        let router = Router::new()
            .route("/stats", get(stats))
            .merge(worker_routes)
            .merge(admin_routes)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn_with_state(rate_limiter, rate_limit_middleware))
            .with_state(state);

        Self {
            host: config.master.host.clone(),
            port: config.master.port,
            router,
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr, "master HTTP server listening");
        axum::serve(listener, self.router)
            .await
            .map_err(OrchestratorError::Io)
    }
}

/// Compares against [`ApiState::admin_token`] in constant time; a `None`
/// token (no `MASTER_ADMIN_TOKEN` configured) leaves these routes open,
/// matching local/dev deployments (spec SPEC_FULL.md §10.4's generalized
/// auth layer, applied here to the master's admin surface).
async fn require_admin_token(
    State(state): State<ApiState>,
    request: axum::extract::Request,
    next: Next,
) -> std::result::Result<Response, Response> {
    let Some(expected) = &state.admin_token else {
        return Ok(next.run(request).await);
    };
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token.as_bytes().ct_eq(expected.as_bytes()).into() => Ok(next.run(request).await),
        _ => Err(unauthorized()),
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"}))).into_response()
}

fn not_found(e: &OrchestratorError) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": e.to_string()}))).into_response()
}

// --- worker-facing surface (spec §4.5) ---

#[derive(Deserialize)]
struct RegisterWorkerBody {
    worker_id: String,
    kind: String,
    #[serde(default)]
    capabilities: HashSet<String>,
}

async fn register_worker(State(state): State<ApiState>, Json(body): Json<RegisterWorkerBody>) -> StatusCode {
    state
        .orchestrator
        .workers()
        .register(body.worker_id, body.kind, body.capabilities)
        .await;
    StatusCode::OK
}

async fn heartbeat(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.workers().heartbeat(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => not_found(&e),
    }
}

#[derive(Serialize)]
struct PollResponse {
    task_id: String,
    kind: String,
    payload: serde_json::Value,
}

impl From<AssignedWork> for PollResponse {
    fn from(work: AssignedWork) -> Self {
        Self {
            task_id: work.task_id,
            kind: work.kind,
            payload: work.payload,
        }
    }
}

async fn poll(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.workers().poll(&id, state.poll_wait).await {
        Some(work) => Json(PollResponse::from(work)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Deserialize)]
struct ResultBody {
    task_id: String,
    success: bool,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

async fn post_result(State(state): State<ApiState>, Path(id): Path<String>, Json(body): Json<ResultBody>) -> Response {
    match state
        .orchestrator
        .complete_from_worker(&id, &body.task_id, body.success, body.result, body.error)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => not_found(&e),
    }
}

// --- admin surface: slave registry control plane (spec §4.4) ---

#[derive(Deserialize)]
struct RegisterSlaveBody {
    id: String,
    host: String,
    port: u16,
    token: String,
    #[serde(default)]
    capabilities: HashSet<String>,
}

async fn register_slave(State(state): State<ApiState>, Json(body): Json<RegisterSlaveBody>) -> Response {
    match state
        .orchestrator
        .slaves()
        .register_slave(body.id, body.host, body.port, body.token, body.capabilities)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response(),
    }
}

async fn remove_slave(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.remove_slave(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => not_found(&e),
    }
}

async fn list_slaves(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "by_status": state.orchestrator.slaves().counts_by_status().await,
    }))
}

// --- admin surface: human request approvals (spec §4.9) ---

async fn list_pending_human_requests(State(state): State<ApiState>) -> Json<Vec<HumanRequest>> {
    Json(state.human_requests.list_pending().await)
}

#[derive(Deserialize)]
struct ApprovalBody {
    notes: Option<String>,
}

async fn approve_human_request(State(state): State<ApiState>, Path(id): Path<String>, Json(body): Json<ApprovalBody>) -> Response {
    match state.human_requests.approve(&id, body.notes).await {
        Ok(req) => Json(req).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": e.to_string()}))).into_response(),
    }
}

async fn reject_human_request(State(state): State<ApiState>, Path(id): Path<String>, Json(body): Json<ApprovalBody>) -> Response {
    match state.human_requests.reject(&id, body.notes).await {
        Ok(req) => Json(req).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": e.to_string()}))).into_response(),
    }
}

// --- observability (spec §6.1, SPEC_FULL.md §11) ---

async fn stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let queue_stats = state.orchestrator.queue().stats().await;
    let worker_counts = state.orchestrator.workers().counts_by_state().await;
    let slave_counts = state.orchestrator.slaves().counts_by_status().await;

    Json(serde_json::json!({
        "queue": queue_stats,
        "workers": worker_counts,
        "slaves": slave_counts,
    }))
}
