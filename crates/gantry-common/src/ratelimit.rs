//! Client-side rate limiting for cloud APIs
//!
//! Providers throttle aggressively once a tenant exceeds its request quota,
//! and a throttled reconcile loop makes no progress at all. Every SDK
//! wrapper therefore takes a token from a bucket before issuing a call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Token bucket limiter shared by all clients of one cloud account
#[derive(Clone)]
pub struct RateLimiter {
    bucket_size: u64,
    tokens: Arc<AtomicU64>,
    /// Time one token takes to refill at the configured QPS
    refill_interval: Duration,
    last_refill: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    /// Create a limiter holding at most `bucket_size` tokens, refilled at
    /// `qps` tokens per second
    pub fn new(bucket_size: u64, qps: f64) -> Self {
        Self {
            bucket_size,
            tokens: Arc::new(AtomicU64::new(bucket_size)),
            refill_interval: Duration::from_secs_f64(1.0 / qps),
            last_refill: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Take a token if one is available
    pub async fn try_acquire(&self) -> bool {
        let mut last_refill = self.last_refill.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);

        if elapsed >= self.refill_interval {
            let earned = elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
            let current = self.tokens.load(Ordering::Relaxed);
            let refilled = (current as f64 + earned).floor() as u64;
            self.tokens
                .store(refilled.min(self.bucket_size), Ordering::Relaxed);
            *last_refill = now;
        }

        if self.tokens.load(Ordering::Relaxed) > 0 {
            self.tokens.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&self) {
        while !self.try_acquire().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn current_tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }
}
