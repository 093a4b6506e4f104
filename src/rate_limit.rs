//! In-memory per-IP token buckets.
//!
//! Each client IP gets a bucket of `capacity` tokens that refills
//! continuously at `capacity / window` tokens per second. A request costs one
//! token. State is process-local: several instances behind a load balancer
//! enforce their quotas independently.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Default bucket capacity (burst size)
pub const DEFAULT_CAPACITY: u32 = 300;

/// Default refill window; `DEFAULT_CAPACITY` tokens per window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by client IP
#[derive(Debug)]
pub struct IpRateLimiter {
    capacity: f64,
    /// Tokens added per second
    rate: f64,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl IpRateLimiter {
    /// Allow `capacity` requests per `window` per IP, with bursts up to
    /// `capacity`. A zero window falls back to [`DEFAULT_WINDOW`].
    pub fn new(capacity: u32, window: Duration) -> Self {
        let window = if window.is_zero() { DEFAULT_WINDOW } else { window };
        let capacity = f64::from(capacity);
        Self {
            capacity,
            rate: capacity / window.as_secs_f64(),
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request from `ip` may proceed now
    pub fn allow(&self, ip: &str) -> bool {
        self.allow_at(ip, Instant::now())
    }

    /// Whether a request from `ip` may proceed at `now`, debiting one token
    pub fn allow_at(&self, ip: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();

        let Some(bucket) = buckets.get_mut(ip) else {
            if self.capacity < 1.0 {
                return false;
            }
            // First request from this IP: full bucket minus this request
            buckets.insert(
                ip.to_string(),
                Bucket {
                    tokens: self.capacity - 1.0,
                    last_refill: now,
                },
            );
            return true;
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
            bucket.last_refill = now;
        }

        if bucket.tokens < 1.0 {
            return false;
        }

        bucket.tokens -= 1.0;
        true
    }

    /// Current token count for `ip`, without refilling
    #[cfg(test)]
    pub fn tokens(&self, ip: &str) -> Option<f64> {
        self.buckets.lock().get(ip).map(|b| b.tokens)
    }

    /// Number of tracked IPs
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Drop buckets untouched for at least one window.
    ///
    /// Such a bucket has refilled completely, so forgetting it changes no
    /// future decision. Returns the number of buckets removed.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < self.window);
        before - buckets.len()
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` in the background
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.evict_idle(Instant::now());
                if removed > 0 {
                    debug!(removed, remaining = limiter.len(), "evicted idle rate-limit buckets");
                }
            }
        })
    }
}
