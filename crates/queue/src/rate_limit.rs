use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Token bucket shared by every queue in a manager.
///
/// Refills continuously at `refill_per_sec` up to `capacity`; `try_take`
/// never blocks, callers decide how to wait.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimiterStats {
    pub available: u32,
    pub capacity: u32,
    pub refill_per_sec: u32,
}

impl TokenBucket {
    pub fn new(per_second: u32) -> Self {
        let capacity = per_second.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Never blocks.
    pub fn try_take(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        RateLimiterStats {
            available: state.tokens as u32,
            capacity: self.capacity as u32,
            refill_per_sec: self.refill_per_sec as u32,
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
}
