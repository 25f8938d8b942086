//! Token bucket shared by every request to one backend family.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Non-blocking token bucket.
///
/// `try_acquire` never sleeps or queues: it either takes a permit or reports
/// denial right away. Tokens refill continuously at `refill_per_sec` up to
/// `capacity`.
pub struct TokenBucket {
    capacity: u32,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket that starts full and refills `refill` tokens every `per`
    pub fn new(capacity: u32, refill: u32, per: Duration) -> Self {
        let secs = per.as_secs_f64();
        let refill_per_sec = if secs > 0.0 { refill as f64 / secs } else { 0.0 };
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// `capacity` tokens, refilled at `per_minute` tokens per minute
    pub fn per_minute(capacity: u32, per_minute: u32) -> Self {
        Self::new(capacity, per_minute, Duration::from_secs(60))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Take one permit if available
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> bool {
        // Poisoning leaves the numeric state intact
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed > Duration::ZERO {
            state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
                .min(self.capacity as f64);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            debug!(target: "rate_limit", tokens = state.tokens, "Token bucket empty");
            false
        }
    }

    /// Tokens currently available (rounded down)
    pub fn available(&self) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tokens.floor() as u32
    }
}
