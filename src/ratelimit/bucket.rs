//! Per-identity token bucket.

use parking_lot::Mutex;
use std::time::Duration;

use super::policy::Quota;

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request may proceed.
    Allow {
        /// Bucket capacity
        limit: u32,
        /// Whole tokens left after this request
        remaining: u32,
    },
    /// The request is rate limited.
    Deny {
        /// Bucket capacity
        limit: u32,
        /// How long until a request could succeed
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Duration,
    blocked_until: Option<Duration>,
    retired: bool,
}

impl BucketState {
    /// Lazily add tokens for the time elapsed since the last refill.
    ///
    /// A reading earlier than `last_refill` counts as zero elapsed time.
    fn refill(&mut self, now: Duration, quota: &Quota) {
        let elapsed = now.saturating_sub(self.last_refill);
        let capacity = quota.capacity as f64;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * quota.refill_per_sec).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// A continuously refilling bucket of permits.
///
/// All mutation happens under the bucket's own lock, so refill and consume
/// are one atomic step per key.
#[derive(Debug)]
pub struct TokenBucket {
    quota: Quota,
    state: Mutex<BucketState>,
}

/// Returned by [`TokenBucket::try_consume`] when the bucket was evicted
/// from its store and must not be used any more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired;

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(quota: Quota, now: Duration) -> Self {
        Self {
            quota,
            state: Mutex::new(BucketState {
                tokens: quota.capacity as f64,
                last_refill: now,
                blocked_until: None,
                retired: false,
            }),
        }
    }

    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// Refill, then try to take one token.
    ///
    /// Waits at most `timeout` for the bucket lock; `None` means the lock
    /// could not be acquired in time.
    pub fn try_consume(
        &self,
        now: Duration,
        timeout: Duration,
    ) -> Option<Result<Decision, Retired>> {
        let mut state = self.state.try_lock_for(timeout)?;
        if state.retired {
            return Some(Err(Retired));
        }

        state.refill(now, &self.quota);
        let limit = self.quota.capacity;

        if let Some(until) = state.blocked_until {
            if now < until {
                return Some(Ok(Decision::Deny {
                    limit,
                    retry_after: until - now,
                }));
            }
            state.blocked_until = None;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Some(Ok(Decision::Allow {
                limit,
                remaining: state.tokens.floor() as u32,
            }));
        }

        let retry_after = match self.quota.block_duration() {
            Some(block) => {
                state.blocked_until = Some(now.checked_add(block).unwrap_or(Duration::MAX));
                block
            }
            // Rates too slow to express as a Duration saturate.
            None => {
                let secs = (1.0 - state.tokens) / self.quota.refill_per_sec;
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
        };

        Some(Ok(Decision::Deny { limit, retry_after }))
    }

    /// Tokens available at `now`, refilling the stored state.
    pub fn available(&self, now: Duration) -> f64 {
        let mut state = self.state.lock();
        state.refill(now, &self.quota);
        state.tokens
    }

    /// Retire the bucket if it has been idle for `ttl` and is full again.
    ///
    /// Returns `true` when retired. A bucket whose lock is held is in use
    /// and is never retired.
    pub fn retire_if_idle(&self, now: Duration, ttl: Duration) -> bool {
        let Some(mut state) = self.state.try_lock() else {
            return false;
        };
        if now.saturating_sub(state.last_refill) < ttl {
            return false;
        }
        state.refill(now, &self.quota);
        let full = state.tokens >= self.quota.capacity as f64;
        let blocked = state.blocked_until.is_some_and(|until| now < until);
        if full && !blocked {
            state.retired = true;
        }
        state.retired
    }

    #[cfg(test)]
    pub(crate) fn hold_for_test(&self, f: impl FnOnce()) {
        let _guard = self.state.lock();
        f();
    }
}
