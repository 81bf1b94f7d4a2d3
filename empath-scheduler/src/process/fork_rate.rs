//! Limit on transport agent starts per second, as a token bucket.
//!
//! The bucket holds at most one second's worth of tokens and refills
//! continuously, so a burst of `rate` starts is allowed after a quiet
//! second, and the sustained rate never exceeds `rate` per second.

use std::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens
    tokens: f64,
    /// Maximum tokens
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last time tokens were added
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: u32, now: Instant) -> Self {
        let capacity = f64::from(per_second);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();

        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Fork rate limiter; a rate of 0 never limits
#[derive(Debug, Default)]
pub struct ForkRate {
    bucket: Option<TokenBucket>,
}

impl ForkRate {
    pub fn new(per_second: u32) -> Self {
        Self {
            bucket: (per_second > 0).then(|| TokenBucket::new(per_second, Instant::now())),
        }
    }

    /// Take a token for one start
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.bucket
            .as_mut()
            .is_none_or(|bucket| bucket.try_consume(now))
    }

    /// Whether the last attempt found the bucket empty
    pub fn is_exhausted(&self) -> bool {
        self.bucket.as_ref().is_some_and(|bucket| bucket.tokens < 1.0)
    }
}
