//! Rate limiter trait for abstracting limiter implementations.

use async_trait::async_trait;

use super::bucket::Decision;
use super::identity::IdentityKey;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// The HTTP middleware only talks to this trait, so it can be driven by the
/// in-process [`RateLimiter`](super::RateLimiter) or by a test double.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Try to take one permit for `key`.
    async fn check(&self, key: &IdentityKey) -> Result<Decision>;
}
