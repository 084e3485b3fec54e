use std::time::Duration;

use tokio::{
    sync::Mutex,
    time::{Instant, sleep},
};

/// Token-bucket limiter shared by every enrichment worker.
///
/// Callers reserve a token under the lock and then sleep outside it until the
/// token is due, so waiting never spins and concurrent callers are spaced at
/// the configured rate no matter how many there are.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

#[derive(Debug)]
struct BucketState {
    /// May go negative: each unit below zero is a caller already waiting.
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `requests_per_second` must be positive; `burst` is clamped to at
    /// least one token.
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: requests_per_second,
        }
    }

    /// Wait until a request may be sent.
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.last_refill = now;
            state.tokens =
                (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.tokens -= 1.0;

            if state.tokens >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(
                    -state.tokens / self.refill_per_sec,
                ))
            }
        };

        if let Some(wait) = wait {
            sleep(wait).await;
        }
    }
}
