//! Outbound rate limiting.
//!
//! [RateLimiter] gates every ordinary outbound payload of one connection,
//! [session] and [remote] coordinate the scarce session start operation
//! across connections and processes.

pub mod remote;
pub mod session;

use std::{sync::Mutex, time::Duration};

use snafu::prelude::*;
use tokio::time::Instant;

/// Error of a rate limiter
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum LimiterError {
    /// limiter created with zero capacity or zero period
    #[snafu(display("invalid limiter config, capacity {capacity} per {period:?}"))]
    InvalidConfig {
        /// capacity
        capacity: u32,
        /// refill period
        period: Duration,
    },

    /// more tokens requested than the bucket can ever hold
    #[snafu(display("requested {requested} tokens, but capacity is {capacity}"))]
    ExceedsCapacity {
        /// requested tokens
        requested: u32,
        /// capacity
        capacity: u32,
    },

    /// permit pool was shut down
    #[snafu(display("session start permit pool closed"))]
    PoolClosed,

    /// remote permit pool failed
    #[snafu(display("remote session start limiter failed: {source}"))]
    Remote {
        /// source error
        source: remote::RemoteLimiterError,
    },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter with continuous, fractional refill.
///
/// The bucket holds up to `capacity` tokens and gains `capacity` tokens per
/// `period`, spread evenly over time.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    period: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket
    pub fn new(capacity: u32, period: Duration) -> Result<Self, LimiterError> {
        Self::with_tokens(capacity, period, capacity as f64)
    }

    /// Create an empty bucket
    pub fn empty(capacity: u32, period: Duration) -> Result<Self, LimiterError> {
        Self::with_tokens(capacity, period, 0.0)
    }

    fn with_tokens(capacity: u32, period: Duration, tokens: f64) -> Result<Self, LimiterError> {
        ensure!(
            capacity > 0 && !period.is_zero(),
            error::InvalidConfig { capacity, period }
        );

        Ok(Self {
            capacity,
            period,
            bucket: Mutex::new(Bucket {
                tokens,
                last_refill: Instant::now(),
            }),
        })
    }

    /// bucket capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// refill period
    pub fn period(&self) -> Duration {
        self.period
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let gained =
            elapsed.as_nanos() as f64 * self.capacity as f64 / self.period.as_nanos() as f64;

        bucket.tokens = (bucket.tokens + gained).min(self.capacity as f64);
        bucket.last_refill = now;
    }

    fn with_bucket<T>(&self, f: impl FnOnce(&mut Bucket) -> T) -> T {
        // a panic while holding the lock can't leave the bucket half updated
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.refill(&mut bucket);
        f(&mut bucket)
    }

    /// Tokens available right now
    pub fn available(&self) -> f64 {
        self.with_bucket(|bucket| bucket.tokens)
    }

    /// Take `n` tokens if they are available, fails fast otherwise
    pub fn try_consume(&self, n: u32) -> bool {
        self.with_bucket(|bucket| {
            if bucket.tokens >= n as f64 {
                bucket.tokens -= n as f64;
                true
            } else {
                false
            }
        })
    }

    /// Minimum wait until `n` tokens will be available, zero if they already are
    pub fn delay_to_consume(&self, n: u32) -> Result<Duration, LimiterError> {
        ensure!(
            n <= self.capacity,
            error::ExceedsCapacity {
                requested: n,
                capacity: self.capacity
            }
        );

        Ok(self.with_bucket(|bucket| {
            let missing = n as f64 - bucket.tokens;
            if missing <= 0.0 {
                Duration::ZERO
            } else {
                let nanos = (missing * self.period.as_nanos() as f64 / self.capacity as f64).ceil();
                Duration::from_nanos(nanos as u64)
            }
        }))
    }

    /// Wait until `n` tokens are available and take them
    pub async fn acquire(&self, n: u32) -> Result<(), LimiterError> {
        loop {
            let delay = self.delay_to_consume(n)?;
            if !delay.is_zero() {
                log::trace!("Rate limited, wait {:?} for {} tokens", delay, n);
                tokio::time::sleep(delay).await;
            }
            if self.try_consume(n) {
                return Ok(());
            }
        }
    }
}
