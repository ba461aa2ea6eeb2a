// Token-bucket rate limiter shared by all gateway callers

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
        }
    }

    fn refill(&mut self, elapsed: Duration) {
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
    }

    /// Time until one whole token is available
    fn wait_time(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
    }
}

#[derive(Debug)]
struct LimiterState {
    per_second: Bucket,
    per_minute: Bucket,
    last_refill: Instant,
}

/// Callers queue on `acquire` until both the per-second and the per-minute
/// budgets have a token; requests are delayed, never dropped.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(max_per_second: f64, max_per_minute: u32) -> Self {
        let per_minute = max_per_minute as f64;
        Self {
            state: Mutex::new(LimiterState {
                per_second: Bucket::new(max_per_second.ceil().max(1.0), max_per_second),
                per_minute: Bucket::new(per_minute, per_minute / 60.0),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests_per_second, config.max_requests_per_minute)
    }

    pub async fn acquire(&self) {
        loop {
            // The lock is never held across the sleep
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(state.last_refill);
                state.last_refill = now;
                state.per_second.refill(elapsed);
                state.per_minute.refill(elapsed);

                let wait = state.per_second.wait_time().max(state.per_minute.wait_time());
                if wait.is_zero() {
                    state.per_second.tokens -= 1.0;
                    state.per_minute.tokens -= 1.0;
                    return;
                }
                wait
            };

            debug!("⏳ Rate limit reached, waiting {:?}", wait);
            sleep(wait).await;
        }
    }

    /// Tokens currently available in the tighter of the two buckets
    pub fn available(&self) -> f64 {
        let state = self.state.lock();
        state.per_second.tokens.min(state.per_minute.tokens)
    }
}
