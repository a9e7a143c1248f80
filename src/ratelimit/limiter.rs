//! Core rate limiter implementation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::bucket::Decision;
use super::clock::{Clock, MonotonicClock};
use super::identity::IdentityKey;
use super::policy::PolicyTable;
use super::store::BucketStore;
use crate::error::{Result, TurnstileError};

/// Default bound on waiting for a bucket lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);
/// Default number of buckets above which idle ones are swept.
pub const DEFAULT_MAX_BUCKETS: usize = 100_000;
/// Default idle time before a full bucket may be evicted.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

/// Minimum spacing between two lazy sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The core rate limiter that manages token buckets.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Token buckets indexed by identity key
    store: BucketStore,
    /// Identity to quota mapping
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    max_buckets: usize,
    idle_ttl: Duration,
    /// Clock reading of the last lazy sweep, in nanoseconds
    last_sweep: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter using the system monotonic clock.
    pub fn new(policies: PolicyTable) -> Self {
        Self::with_clock(policies, Arc::new(MonotonicClock::new()))
    }

    /// Create a rate limiter with a custom [`Clock`].
    pub fn with_clock(policies: PolicyTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: BucketStore::new(),
            policies,
            clock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_buckets: DEFAULT_MAX_BUCKETS,
            idle_ttl: DEFAULT_IDLE_TTL,
            last_sweep: AtomicU64::new(0),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sweep idle buckets once more than `max_buckets` exist.
    pub fn with_eviction(mut self, max_buckets: usize, idle_ttl: Duration) -> Self {
        self.max_buckets = max_buckets;
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Try to take one token for `key`.
    ///
    /// Allow and deny are both `Ok`; an error means the bucket lock could
    /// not be acquired within the configured timeout.
    ///
    /// This blocks the calling thread while waiting for the bucket lock.
    /// The lock is only held for the refill arithmetic, so the wait is
    /// normally far below `lock_timeout`; the timeout bounds a stuck
    /// holder, not ordinary contention.
    pub fn try_acquire(&self, key: &IdentityKey) -> Result<Decision> {
        let quota = self.policies.lookup(key);

        trace!(key = %key, capacity = quota.capacity, "Checking rate limit");

        let decision = loop {
            let now = self.clock.now();
            let bucket = self.store.get_or_create(key, quota, now);
            match bucket.try_consume(now, self.lock_timeout) {
                Some(Ok(decision)) => break decision,
                // Evicted between lookup and lock; fetch the replacement.
                Some(Err(_)) => continue,
                None => {
                    warn!(key = %key, timeout = ?self.lock_timeout, "Bucket lock timed out");
                    return Err(TurnstileError::LockTimeout {
                        key: key.to_string(),
                    });
                }
            }
        };

        match decision {
            Decision::Allow { remaining, .. } => {
                trace!(key = %key, remaining, "Request allowed");
            }
            Decision::Deny { retry_after, .. } => {
                debug!(key = %key, retry_after = ?retry_after, "Rate limit exceeded");
            }
        }

        self.maybe_sweep();
        Ok(decision)
    }

    /// Tokens currently available for `key`, if it has a bucket.
    pub fn available(&self, key: &IdentityKey) -> Option<f64> {
        self.store
            .get(key)
            .map(|bucket| bucket.available(self.clock.now()))
    }

    /// Evict idle, fully refilled buckets. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.store.evict_idle(self.clock.now(), self.idle_ttl)
    }

    fn maybe_sweep(&self) {
        if self.store.len() <= self.max_buckets {
            return;
        }
        let now = self.clock.now().as_nanos() as u64;
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < SWEEP_INTERVAL.as_nanos() as u64 && last != 0 {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now.max(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep();
        }
    }

    /// Get the number of active buckets.
    pub fn bucket_count(&self) -> usize {
        self.store.len()
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.store.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(PolicyTable::default())
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn check(&self, key: &IdentityKey) -> Result<Decision> {
        self.try_acquire(key)
    }
}
