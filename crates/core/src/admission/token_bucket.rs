use std::time::Duration;

use parking_lot::Mutex;

use crate::config::TokenBucketConfig;

/// Capped permit pool refilled on a fixed interval.
///
/// Consumption never blocks: an empty bucket is reported as `false`, not as
/// an error. The bucket does not own a timer; the owning admission
/// controller calls [`TokenBucket::refill`] on every tick.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: u32,
    interval: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    stopped: bool,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: &TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            interval: config.interval,
            state: Mutex::new(BucketState { tokens: config.capacity, stopped: false }),
        }
    }

    /// Take one token if available.
    pub fn try_consume(&self) -> bool {
        let mut state = self.state.lock();
        if state.tokens == 0 {
            return false;
        }
        state.tokens -= 1;
        true
    }

    /// Add `refill_rate` tokens, capped at capacity. No-op once stopped.
    ///
    /// Returns the token count after the refill.
    pub fn refill(&self) -> u32 {
        let mut state = self.state.lock();
        if !state.stopped {
            state.tokens = state.tokens.saturating_add(self.refill_rate).min(self.capacity);
        }
        state.tokens
    }

    /// Stop refilling permanently.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Tokens currently available.
    pub fn tokens(&self) -> u32 {
        self.state.lock().tokens
    }

    /// Maximum tokens the bucket holds after a refill.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u32 {
        self.refill_rate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
