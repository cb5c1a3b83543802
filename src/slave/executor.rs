//! C3: SlaveExecutor — the HTTP server that runs on each slave host (spec
//! §4.3). Exposes `/health`, `/version`, `/execute`, `/upload`.

use crate::auth::require_bearer;
use crate::slave::backend::{execute, Backend, BackendAvailability};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub struct SlaveExecutorState {
    token: Arc<String>,
    version: String,
    commit: String,
    branch: String,
    availability: BackendAvailability,
    working_root: PathBuf,
    upload_root: PathBuf,
    default_timeout: std::time::Duration,
    semaphore: Arc<Semaphore>,
}

impl SlaveExecutorState {
    pub fn new(config: &crate::config::SlaveConfig, token: String) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.working_root)?;
        std::fs::create_dir_all(&config.upload_root)?;

        let (commit, branch) = git_identity();
        let availability = BackendAvailability::detect(&config.working_root, config.container_image.clone());

        Ok(Arc::new(Self {
            token: Arc::new(token),
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit,
            branch,
            availability,
            working_root: config.working_root.clone(),
            upload_root: config.upload_root.clone(),
            default_timeout: config.execute_timeout,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
        }))
    }
}

fn git_identity() -> (String, String) {
    let commit = std::process::Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());

    let branch = std::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    (commit, branch)
}

pub fn router(state: Arc<SlaveExecutorState>) -> Router {
    let protected = Router::new()
        .route("/execute", post(execute_handler))
        .route("/upload", post(upload_handler))
        .route_layer(middleware::from_fn_with_state(state.token.clone(), require_bearer));

    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .merge(protected)
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<SlaveExecutorState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": state.version,
        "commit": state.commit,
        "methods": state.availability.methods_map(),
    }))
}

#[derive(Serialize)]
struct VersionResponse {
    commit: String,
    version: String,
    branch: String,
}

async fn version_handler(State(state): State<Arc<SlaveExecutorState>>) -> Json<VersionResponse> {
    Json(VersionResponse {
        commit: state.commit.clone(),
        version: state.version.clone(),
        branch: state.branch.clone(),
    })
}

#[derive(Deserialize)]
struct ExecuteBody {
    command: String,
    working_dir: Option<String>,
    timeout: Option<u64>,
}

#[derive(Serialize)]
struct ExecuteResult {
    success: bool,
    stdout: String,
    stderr: String,
    method: Backend,
    exit_code: i32,
}

async fn execute_handler(
    State(state): State<Arc<SlaveExecutorState>>,
    Json(body): Json<ExecuteBody>,
) -> Response {
    let Ok(permit) = state.semaphore.clone().try_acquire_owned() else {
        warn!("rejecting /execute: max_concurrent_executions reached");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [("retry-after", "5")],
            Json(serde_json::json!({"error": "executor at capacity"})),
        )
            .into_response();
    };

    let working_dir = body
        .working_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| state.working_root.clone());
    let timeout = body
        .timeout
        .map(std::time::Duration::from_secs)
        .unwrap_or(state.default_timeout);

    let outcome = execute(&state.availability, &working_dir, &body.command, timeout).await;
    drop(permit);

    info!(method = outcome.method.as_str(), success = outcome.success, "execute completed");
    Json(ExecuteResult {
        success: outcome.success,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        method: outcome.method,
        exit_code: outcome.exit_code,
    })
    .into_response()
}

#[derive(Deserialize)]
struct UploadBody {
    path: String,
    content_base64: String,
}

/// Rejects any path that resolves outside `upload_root` once joined and
/// lexically normalized, without requiring the file to already exist (spec
/// §4.3: "Rejects paths outside a configured root allowlist with 400").
fn resolve_upload_path(root: &Path, requested: &str) -> Option<PathBuf> {
    let requested = Path::new(requested);
    if requested.is_absolute() {
        return None;
    }

    let mut normalized = PathBuf::new();
    for component in requested.components() {
        match component {
            std::path::Component::Normal(part) => normalized.push(part),
            std::path::Component::CurDir => {}
            _ => return None,
        }
    }

    Some(root.join(normalized))
}

async fn upload_handler(
    State(state): State<Arc<SlaveExecutorState>>,
    Json(body): Json<UploadBody>,
) -> Response {
    use base64::Engine;

    let Some(target) = resolve_upload_path(&state.upload_root, &body.path) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "path escapes upload root"})),
        )
            .into_response();
    };

    let content = match base64::engine::general_purpose::STANDARD.decode(&body.content_base64) {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "invalid base64 content"})),
            )
                .into_response()
        }
    };

    if let Some(parent) = target.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(error = %e, "failed to create upload parent directories");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": "io error"})))
                .into_response();
        }
    }

    match tokio::fs::write(&target, &content).await {
        Ok(()) => {
            info!(path = %target.display(), bytes = content.len(), "uploaded file");
            (StatusCode::OK, Json(serde_json::json!({"path": body.path}))).into_response()
        }
        Err(e) => {
            warn!(error = %e, "failed to write uploaded file");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": "io error"}))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_path_escape_is_rejected() {
        let root = Path::new("/data/work");
        assert!(resolve_upload_path(root, "../../etc/passwd").is_none());
        assert!(resolve_upload_path(root, "/etc/passwd").is_none());
        assert_eq!(
            resolve_upload_path(root, "subdir/file.txt"),
            Some(PathBuf::from("/data/work/subdir/file.txt"))
        );
    }
}
