//! Token-bucket rate limiting shared across concurrent traces
//!
//! Providers enforce a fixed requests/second ceiling, so every call to a
//! given provider, from any trace, draws from one bucket.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with a burst capacity and a steady refill rate
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket. `refill_per_sec` must be positive.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// Take one token if available without waiting
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then take it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            debug!(wait_ms = wait.as_millis() as u64, "Rate limiter throttling");
            tokio::time::sleep(wait).await;
        }
    }

    /// Currently available tokens (after refill)
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }
}

/// Registry of buckets keyed by provider name
#[derive(Default)]
pub struct RateLimiters {
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the bucket for `provider`, creating it on first use.
    ///
    /// The first caller's settings win; later callers share that bucket.
    pub fn for_provider(&self, provider: &str, burst: u32, per_sec: f64) -> Arc<TokenBucket> {
        self.buckets
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(burst, per_sec)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_then_empty() {
        let bucket = TokenBucket::new(2, 0.001);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1, 50.0);
        bucket.acquire().await;

        let started = Instant::now();
        bucket.acquire().await;
        // One token at 50/s takes ~20ms to refill
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_refill_capped_at_capacity() {
        let bucket = TokenBucket::new(3, 1000.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bucket.available().await <= 3.0);
    }

    #[test]
    fn test_registry_shares_buckets() {
        let limiters = RateLimiters::new();
        let a = limiters.for_provider("etherscan", 5, 5.0);
        let b = limiters.for_provider("etherscan", 10, 10.0);
        let c = limiters.for_provider("helius", 5, 5.0);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(limiters.len(), 2);
    }
}
