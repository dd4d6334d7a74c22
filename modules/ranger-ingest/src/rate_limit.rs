//! Token buckets for the external dependencies, shared across workers.
//! The datastore is bounded by its connection pool; the LLM and geocoder
//! each get a bucket. An exhausted LLM bucket defers extraction back to the
//! scheduler instead of dropping work.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1.0)
    }

    pub fn try_acquire_n(&self, n: f64) -> bool {
        let mut state = self.state.lock().expect("bucket poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refill), for logging.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().expect("bucket poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
        state.tokens
    }
}

/// One bucket per external dependency.
pub struct RateLimits {
    pub llm: TokenBucket,
    pub geocoder: TokenBucket,
}

impl RateLimits {
    pub fn new() -> Self {
        Self {
            // Extraction: sustained 2/s with burst headroom.
            llm: TokenBucket::new(20.0, 2.0),
            // Parcel lookups: free-tier friendly.
            geocoder: TokenBucket::new(10.0, 1.0),
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new()
    }
}
