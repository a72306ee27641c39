use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;

/// Token-bucket rate limiter shared by a single Worker. `rate` tokens are
/// refilled per second up to `burst` capacity; `acquire` suspends until a
/// token is available and is cancel-safe (callers select it against
/// shutdown).
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Unlimited limiter, used by capabilities (like the shared CPU pool)
    /// that only gate on the semaphore.
    pub fn unlimited() -> Self {
        Self::new(f64::MAX, f64::MAX)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;
    }

    /// Current token count, for `WorkerSnapshot` reporting.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Suspend until one token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d.max(Duration::from_millis(1))).await,
            }
        }
    }
}
