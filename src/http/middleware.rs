//! Request middleware.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, Instrument};

use super::handlers::AppState;
use crate::error::TurnstileError;
use crate::ratelimit::Decision;

/// Body message returned with 429 responses.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Accept or reject a request based on its identity's token bucket.
///
/// Allowed requests continue to the inner service and get rate limit
/// headers added. Denied requests are answered with 429 and a
/// `Retry-After` hint without reaching the inner service. A bucket lock
/// timeout is an internal fault and answers 503.
pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = state.resolver.resolve(req.headers(), peer);

    match state.limiter.check(&key).await {
        Ok(Decision::Allow { limit, remaining }) => {
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
            response
        }
        Ok(Decision::Deny { limit, retry_after }) => (
            StatusCode::TOO_MANY_REQUESTS,
            [
                (header::RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after))),
                (X_RATELIMIT_LIMIT, HeaderValue::from(limit)),
                (X_RATELIMIT_REMAINING, HeaderValue::from(0u32)),
            ],
            Json(json!({ "error": RATE_LIMITED_MESSAGE })),
        )
            .into_response(),
        Err(e @ TurnstileError::LockTimeout { .. }) => {
            error!(key = %key, error = %e, "Rate limit state unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "rate limiter is temporarily unavailable" })),
            )
                .into_response()
        }
        Err(e) => {
            error!(key = %key, error = %e, "Rate limit check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Whole seconds for `Retry-After`, rounded up and at least one.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after
        .as_secs()
        .saturating_add(u64::from(retry_after.subsec_nanos() > 0));
    secs.max(1)
}

/// Only GET and HEAD reach the limiter.
pub async fn reject_unsupported_methods(req: Request, next: Next) -> Response {
    if req.method() == Method::GET || req.method() == Method::HEAD {
        return next.run(req).await;
    }
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, HeaderValue::from_static("GET, HEAD"))],
        Json(json!({ "error": "method not allowed" })),
    )
        .into_response()
}

/// Tag each request with a fresh id, both in the trace span and the response.
pub async fn request_id(req: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    async move {
        let mut response = next.run(req).await;
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        tracing::debug!(status = response.status().as_u16(), "Request completed");
        response
    }
    .instrument(span)
    .await
}
