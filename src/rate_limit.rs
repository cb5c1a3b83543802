//! General per-process request rate limiting for the master's HTTP surface,
//! applied ahead of the bearer-auth layer (SPEC_FULL.md §10.4). This is a
//! blunt global limiter; `governor` is kept in the dependency stack for this
//! purpose rather than hand-rolling a token bucket.

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};
use tracing::warn;

pub const REQUESTS_PER_MINUTE: u32 = 600;

#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitState {
    pub fn new(requests_per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute.max(1)).unwrap());
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new(REQUESTS_PER_MINUTE)
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(state): axum::extract::State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.limiter.check().is_err() {
        warn!(path = %request.uri().path(), "request rejected by rate limiter");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_within_quota() {
        let state = RateLimitState::new(60);
        assert!(state.limiter.check().is_ok());
    }
}
