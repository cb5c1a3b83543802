//! Bearer-token auth middleware shared by the slave's mutating endpoints
//! (`/execute`, `/upload`) and any master endpoint that requires a token
//! (spec §4.3, §6.5).

use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
}

/// Expects `Authorization: Bearer <token>` equal to the configured token,
/// compared in constant time to avoid leaking the token via response
/// latency. CORS preflight requests bypass auth since the browser sends no
/// credentials on `OPTIONS`.
pub async fn require_bearer(
    State(expected_token): State<Arc<String>>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token.as_bytes().ct_eq(expected_token.as_bytes()).into() => {
            Ok(next.run(request).await)
        }
        _ => {
            warn!(path = %request.uri().path(), "rejected request with missing or invalid bearer token");
            Err(unauthorized())
        }
    }
}
