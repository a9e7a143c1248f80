//! Concurrent identity → bucket storage.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::bucket::TokenBucket;
use super::identity::IdentityKey;
use super::policy::Quota;

/// Holds one [`TokenBucket`] per identity.
///
/// Buckets are created lazily through DashMap's entry API, which inserts
/// under the shard lock, so racing first requests for a key always end up
/// sharing one bucket. The shard lock is dropped before a bucket is used;
/// callers only ever contend on the bucket's own lock.
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: DashMap<IdentityKey, Arc<TokenBucket>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bucket for `key`, creating a full one if absent.
    pub fn get_or_create(&self, key: &IdentityKey, quota: Quota, now: Duration) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = quota.capacity,
                refill_per_sec = quota.refill_per_sec,
                "Creating new token bucket"
            );
            Arc::new(TokenBucket::new(quota, now))
        });
        Arc::clone(bucket.value())
    }

    pub fn get(&self, key: &IdentityKey) -> Option<Arc<TokenBucket>> {
        self.buckets.get(key).map(|b| Arc::clone(b.value()))
    }

    /// Remove buckets idle for at least `ttl` that have refilled to capacity.
    ///
    /// Returns the number of buckets removed.
    pub fn evict_idle(&self, now: Duration, ttl: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.retire_if_idle(now, ttl));
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.buckets.len(), "Evicted idle buckets");
        }
        evicted
    }

    /// Get the number of active buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}
