//! Per-key token-bucket rate limiting.
//!
//! Buckets live in a [`DashMap`]. Refill-then-withdraw runs while holding the
//! shard write lock of the key, and the idle sweep uses `retain`, which takes
//! the same shard locks, so a bucket is never evicted mid-update.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::{AuthError, Result};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Refill for the time elapsed since the last call, then try to take one token.
    fn take(&mut self, now: Instant, config: &RateLimitConfig) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.rate_per_sec).min(config.burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket admission control keyed by an arbitrary client key.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject one request for `key`.
    ///
    /// The first request from a key starts with a full bucket.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return bucket.take(now, &self.config);
        }
        let burst = self.config.burst;
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                tokens: burst,
                last_refill: now,
            })
            .take(now, &self.config)
    }

    /// Like [`allow`](Self::allow) but reports rejection as [`AuthError::RateLimited`].
    pub fn check(&self, key: &str) -> Result<()> {
        if self.allow(key) {
            Ok(())
        } else {
            debug!(key, "rate limit exceeded");
            Err(AuthError::RateLimited)
        }
    }

    /// Evict buckets idle for longer than the configured threshold.
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle_threshold;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= idle);
        before.saturating_sub(self.buckets.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Spawn the periodic sweep. It stops when `cancel` is cancelled.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("rate limiter sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = limiter.len(), "evicted idle rate-limit buckets");
                        }
                    }
                }
            }
        })
    }
}
