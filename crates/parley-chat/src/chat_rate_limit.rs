//! Per-conversation token buckets.
//!
//! The registry lock is only held long enough to fetch or create a bucket;
//! refill and consume happen under the bucket's own lock so unrelated
//! conversations never contend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatRateLimitConfig {
    pub capacity: f64,
    pub refill_per_second: f64,
    /// Above this many tracked conversations, full idle buckets are pruned.
    pub max_tracked_keys: usize,
}

impl Default for ChatRateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_second: 1.0,
            max_tracked_keys: 10_000,
        }
    }
}

#[derive(Debug)]
struct ChatTokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct ChatRateLimiter {
    config: ChatRateLimitConfig,
    buckets: Mutex<HashMap<String, Arc<Mutex<ChatTokenBucketState>>>>,
    rejected_total: AtomicU64,
}

impl ChatRateLimiter {
    pub fn new(config: ChatRateLimitConfig) -> Self {
        let capacity = if config.capacity.is_finite() {
            config.capacity.max(0.0)
        } else {
            0.0
        };
        let refill_per_second = if config.refill_per_second.is_finite() {
            config.refill_per_second.max(0.0)
        } else {
            0.0
        };
        Self {
            config: ChatRateLimitConfig {
                capacity,
                refill_per_second,
                max_tracked_keys: config.max_tracked_keys.max(1),
            },
            buckets: Mutex::new(HashMap::new()),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Refills the conversation's bucket, then consumes one token if available.
    pub fn allow(&self, conversation_key: &str) -> bool {
        let bucket = self.bucket_for(conversation_key);
        let mut state = lock_ignoring_poison(&bucket);
        self.refill_locked(&mut state, Instant::now());
        if state.tokens < 1.0 {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        state.tokens -= 1.0;
        true
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    pub fn tracked_keys(&self) -> usize {
        lock_ignoring_poison(&self.buckets).len()
    }

    /// Current token count after refill, or `None` for an untracked key.
    pub fn tokens(&self, conversation_key: &str) -> Option<f64> {
        let bucket = lock_ignoring_poison(&self.buckets)
            .get(conversation_key)
            .cloned()?;
        let mut state = lock_ignoring_poison(&bucket);
        self.refill_locked(&mut state, Instant::now());
        Some(state.tokens)
    }

    fn bucket_for(&self, conversation_key: &str) -> Arc<Mutex<ChatTokenBucketState>> {
        let mut buckets = lock_ignoring_poison(&self.buckets);
        if let Some(existing) = buckets.get(conversation_key) {
            return Arc::clone(existing);
        }
        if buckets.len() >= self.config.max_tracked_keys {
            self.prune_full_buckets_locked(&mut buckets);
        }
        let created = Arc::new(Mutex::new(ChatTokenBucketState {
            tokens: self.config.capacity,
            last_refill: Instant::now(),
        }));
        buckets.insert(conversation_key.to_string(), Arc::clone(&created));
        created
    }

    fn refill_locked(&self, state: &mut ChatTokenBucketState, now: Instant) {
        let elapsed = now
            .saturating_duration_since(state.last_refill)
            .as_secs_f64();
        if elapsed <= f64::EPSILON {
            return;
        }
        let refill = elapsed * self.config.refill_per_second;
        state.tokens = (state.tokens + refill).min(self.config.capacity);
        state.last_refill = now;
    }

    // A bucket that has refilled to capacity behaves exactly like a fresh one,
    // so dropping it loses nothing. Buckets another caller has fetched but not
    // yet consumed from must stay, or that caller would spend an orphaned token.
    fn prune_full_buckets_locked(
        &self,
        buckets: &mut HashMap<String, Arc<Mutex<ChatTokenBucketState>>>,
    ) {
        let now = Instant::now();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            match bucket.try_lock() {
                Ok(mut state) => {
                    self.refill_locked(&mut state, now);
                    state.tokens < self.config.capacity
                }
                Err(_) => true,
            }
        });
        tracing::debug!(
            pruned = before.saturating_sub(buckets.len()),
            remaining = buckets.len(),
            "rate limiter pruned idle buckets"
        );
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
