//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod clock;
mod identity;
mod limiter;
mod policy;
mod store;

pub use backend::RateLimiterBackend;
pub use bucket::{Decision, TokenBucket};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use identity::{IdentityKey, IdentityKind, IdentityResolver, DEFAULT_API_KEY_HEADER};
pub use limiter::{RateLimiter, DEFAULT_IDLE_TTL, DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_BUCKETS};
pub use policy::{tokens_from_json, PolicyTable, Quota};
pub use store::BucketStore;
