//! Router assembly and the upstream handler.

use axum::{middleware as axum_middleware, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use super::middleware::{rate_limit, reject_unsupported_methods, request_id};
use crate::ratelimit::{IdentityResolver, RateLimiterBackend};

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<dyn RateLimiterBackend>,
    pub resolver: Arc<IdentityResolver>,
}

impl AppState {
    pub fn new(limiter: Arc<dyn RateLimiterBackend>, resolver: IdentityResolver) -> Self {
        Self {
            limiter,
            resolver: Arc::new(resolver),
        }
    }
}

/// Build the application router.
///
/// Every path is served by the same upstream handler. Middleware runs
/// outermost first: request id, method guard, then the rate limiter, so
/// unsupported methods never consume a token.
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(upstream)
        .layer(axum_middleware::from_fn_with_state(state, rate_limit))
        .layer(axum_middleware::from_fn(reject_unsupported_methods))
        .layer(axum_middleware::from_fn(request_id))
}

/// The protected resource.
async fn upstream() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}
