//! # Rate Limiting
//!
//! Token bucket shared by every call to one platform.
//!
//! ```text
//!   capacity ┌──────────┐  refill_per_sec
//!            │ ● ● ● ○ ○│ ◄──────────────── time
//!            └────┬─────┘
//!                 │ acquire(): take one token, or sleep until one exists
//!                 ▼
//!            platform API call
//! ```
//!
//! `acquire` never fails; callers are suspended instead of rejected.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitSettings;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        TokenBucket {
            capacity: f64::from(capacity.max(1)),
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity.max(1)),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(settings.capacity, settings.refill_per_sec)
    }

    /// Takes a token if one is available right now.
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

    /// Takes a token, waiting for the refill if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Whole tokens currently available.
    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens.floor() as u32
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_limited() {
        let bucket = TokenBucket::new(3, 1.0);

        for _ in 0..3 {
            assert!(bucket.try_acquire().await);
        }
        assert!(!bucket.try_acquire().await);
        assert_eq!(bucket.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(2, 4.0);
        let start = Instant::now();

        // Two from the burst, then two more at 4/s
        for _ in 0..4 {
            bucket.acquire().await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(490), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped() {
        let bucket = TokenBucket::new(2, 10.0);
        bucket.acquire().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(bucket.available().await, 2);
    }
}
