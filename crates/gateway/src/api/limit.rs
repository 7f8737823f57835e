//! Rate-limit middleware for the execution endpoints.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::error::ApiError;
use crate::state::AppState;

/// Key requests by peer IP. Without connection info (in-process tests)
/// every caller shares one bucket.
fn caller_key(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".into())
}

pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        let key = caller_key(&req);
        if let Err(e) = limiter.check(&key) {
            tracing::info!(caller = %key, path = %req.uri().path(), "request rate limited");
            return ApiError(e).into_response();
        }
    }
    next.run(req).await
}
